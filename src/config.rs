use anyhow::{Context, Result};
use clap::Parser;
use std::env;

const DEFAULT_MAX_CHUNK_BYTES: usize = 8 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Base root beneath which each upload gets its chunk directory.
    pub chunk_dir: String,
    /// Where reassembled uploads are written.
    pub artifact_dir: String,
    pub database_url: String,
    /// Largest request body accepted for a single chunk.
    pub max_chunk_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked upload server")]
pub struct Args {
    /// Host to bind to (overrides CHUNKED_UPLOAD_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CHUNKED_UPLOAD_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding in-flight chunks (overrides CHUNKED_UPLOAD_CHUNK_DIR)
    #[arg(long)]
    pub chunk_dir: Option<String>,

    /// Directory holding completed uploads (overrides CHUNKED_UPLOAD_ARTIFACT_DIR)
    #[arg(long)]
    pub artifact_dir: Option<String>,

    /// Database URL (overrides CHUNKED_UPLOAD_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum chunk body size in bytes (overrides CHUNKED_UPLOAD_MAX_CHUNK_BYTES)
    #[arg(long)]
    pub max_chunk_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("CHUNKED_UPLOAD_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("CHUNKED_UPLOAD_PORT", 3000u16)?;
        let env_chunks =
            env::var("CHUNKED_UPLOAD_CHUNK_DIR").unwrap_or_else(|_| "./data/chunks".into());
        let env_artifacts =
            env::var("CHUNKED_UPLOAD_ARTIFACT_DIR").unwrap_or_else(|_| "./data/uploads".into());
        let env_db = env::var("CHUNKED_UPLOAD_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uploads.db".into());
        let env_max_chunk = parse_env("CHUNKED_UPLOAD_MAX_CHUNK_BYTES", DEFAULT_MAX_CHUNK_BYTES)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            chunk_dir: args.chunk_dir.unwrap_or(env_chunks),
            artifact_dir: args.artifact_dir.unwrap_or(env_artifacts),
            database_url: args.database_url.unwrap_or(env_db),
            max_chunk_bytes: args.max_chunk_bytes.unwrap_or(env_max_chunk),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse `name`, falling back to `default` when it is unset.
fn parse_env<T>(name: &str, default: T) -> Result<T>
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
    fn parse_env_falls_back_when_unset() {
        let value = parse_env("CHUNKED_UPLOAD_TEST_SURELY_UNSET", 42u16).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn addr_joins_host_and_port() {
        let cfg = AppConfig {
            host: "127.0.0.1".into(),
            port: 8080,
            chunk_dir: "c".into(),
            artifact_dir: "a".into(),
            database_url: "sqlite::memory:".into(),
            max_chunk_bytes: 1,
        };
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
    }
}
