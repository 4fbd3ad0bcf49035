use anyhow::{Context, Result};
use clap::Parser;
use std::{env, path::PathBuf, time::Duration};

/// Centralized process configuration.
/// Combines environment variables and CLI arguments.
///
/// Tunables that admins change at runtime (retention, upload limits, ...)
/// live in the `system_settings` table instead, see `services::settings`.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: PathBuf,
    /// Fast local volume used to stage uploads and build archives.
    pub cache_dir: Option<PathBuf>,
    pub database_url: String,
    pub sweep_interval: Duration,
    /// Largest folder archive built entirely in memory.
    pub archive_memory_limit: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Self-hosted personal drive")]
pub struct Args {
    /// Host to bind to (overrides DRIVE_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DRIVE_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where file payloads are stored (overrides DRIVE_VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Fast-cache staging directory (overrides DRIVE_VAULT_CACHE_DIR)
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Database URL (overrides DRIVE_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds between expired-trash sweeps (overrides DRIVE_VAULT_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Max bytes for in-memory folder archives (overrides DRIVE_VAULT_ARCHIVE_MEMORY_LIMIT)
    #[arg(long)]
    pub archive_memory_limit: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 3600;
const DEFAULT_ARCHIVE_MEMORY_LIMIT: u64 = 64 * 1024 * 1024;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        Self::merge(args)
    }

    fn merge(args: Args) -> Result<(Self, bool)> {
        // --- Environment fallback ---
        let env_host = env::var("DRIVE_VAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("DRIVE_VAULT_PORT", DEFAULT_PORT)?;
        let env_storage = env::var("DRIVE_VAULT_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/files"));
        let env_cache = env::var("DRIVE_VAULT_CACHE_DIR").ok().map(PathBuf::from);
        let env_db = env::var("DRIVE_VAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/drive.db".into());
        let env_sweep = env_number("DRIVE_VAULT_SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS)?;
        let env_archive_limit =
            env_number("DRIVE_VAULT_ARCHIVE_MEMORY_LIMIT", DEFAULT_ARCHIVE_MEMORY_LIMIT)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            cache_dir: args.cache_dir.or(env_cache),
            database_url: args.database_url.unwrap_or(env_db),
            sweep_interval: Duration::from_secs(
                args.sweep_interval_secs.unwrap_or(env_sweep).max(1),
            ),
            archive_memory_limit: args.archive_memory_limit.unwrap_or(env_archive_limit),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arguments_override_defaults() {
        let args = Args::parse_from([
            "drive-vault",
            "--port",
            "8080",
            "--cache-dir",
            "/mnt/fast",
            "--sweep-interval-secs",
            "0",
        ]);
        let (cfg, migrate) = AppConfig::merge(args).unwrap();

        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.cache_dir, Some(PathBuf::from("/mnt/fast")));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(1));
        assert!(!migrate);
    }

    #[test]
    fn migrate_flag_is_reported() {
        let args = Args::parse_from(["drive-vault", "--migrate"]);
        let (_, migrate) = AppConfig::merge(args).unwrap();
        assert!(migrate);
    }
}
