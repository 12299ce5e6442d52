use crate::services::auth::AuthMode;
use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "STORAGE_EMULATOR_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub public_url: Option<String>,
    pub auth_mode: AuthMode,
    pub session_retention: Duration,
    pub max_upload_bytes: usize,
    pub import_dir: Option<PathBuf>,
    pub export_dir: Option<PathBuf>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Local cloud storage emulator")]
pub struct Args {
    /// Host to bind to (overrides STORAGE_EMULATOR_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides STORAGE_EMULATOR_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Base URL used in resumable upload URLs (overrides STORAGE_EMULATOR_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Access policy (overrides STORAGE_EMULATOR_AUTH_MODE)
    #[arg(long, value_enum)]
    pub auth_mode: Option<AuthMode>,

    /// Idle upload sessions are dropped after this many seconds
    /// (overrides STORAGE_EMULATOR_SESSION_RETENTION_SECS)
    #[arg(long)]
    pub session_retention_secs: Option<u64>,

    /// Largest accepted upload (overrides STORAGE_EMULATOR_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Load a snapshot from this directory at startup
    #[arg(long)]
    pub import: Option<PathBuf>,

    /// Write a snapshot to this directory on shutdown
    #[arg(long)]
    pub export_on_exit: Option<PathBuf>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig.
    pub fn from_env_and_args() -> Result<Self> {
        Self::resolve(Args::parse(), |key| env::var(key).ok())
    }

    /// Merge CLI arguments over values from `lookup` (environment) over
    /// defaults.
    pub fn resolve(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        let env_host = var("HOST").unwrap_or_else(|| "0.0.0.0".into());
        let env_port = parse_var::<u16>(&var, "PORT")?.unwrap_or(9199);
        let env_public_url = var("PUBLIC_URL");
        let env_auth_mode = match var("AUTH_MODE") {
            Some(value) => <AuthMode as ValueEnum>::from_str(&value, true)
                .map_err(|err| anyhow!(err))
                .with_context(|| format!("parsing {ENV_PREFIX}AUTH_MODE value `{value}`"))?,
            None => AuthMode::default(),
        };
        let env_retention = parse_var::<u64>(&var, "SESSION_RETENTION_SECS")?.unwrap_or(3600);
        let env_max_upload =
            parse_var::<usize>(&var, "MAX_UPLOAD_BYTES")?.unwrap_or(64 * 1024 * 1024);

        Ok(Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            public_url: args
                .public_url
                .or(env_public_url)
                .map(|url| url.trim_end_matches('/').to_string()),
            auth_mode: args.auth_mode.unwrap_or(env_auth_mode),
            session_retention: Duration::from_secs(
                args.session_retention_secs.unwrap_or(env_retention),
            ),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
            import_dir: args.import,
            export_dir: args.export_on_exit,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    var(name)
        .map(|value| {
            value
                .parse::<T>()
                .with_context(|| format!("parsing {ENV_PREFIX}{name} value `{value}`"))
        })
        .transpose()
}
