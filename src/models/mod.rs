//! Core data models for the storage emulator.
//!
//! `object` holds the committed object records and their download tokens,
//! `session` holds in-flight resumable upload sessions and their transition
//! tables.

pub mod object;
pub mod session;
