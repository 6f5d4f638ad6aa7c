use crate::models::{envelope::STORAGE_FINALIZED_TYPE, pixels::InputShape};
use crate::services::model_loader::ModelArtifacts;
use anyhow::{Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

/// Which object storage the service downloads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageBackend {
    /// Local directory tree: `{storage_dir}/{bucket}/{key}`
    Fs,
    /// Path-addressed HTTP endpoint: `{storage_endpoint}/{bucket}/{key}`
    Http,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fs" => Ok(Self::Fs),
            "http" => Ok(Self::Http),
            other => bail!("unknown storage backend `{}` (expected `fs` or `http`)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub scratch_dir: PathBuf,
    pub database_url: String,
    pub storage_backend: StorageBackend,
    pub storage_dir: PathBuf,
    pub storage_endpoint: String,
    pub storage_token: Option<String>,
    pub model_bucket: String,
    pub model_path: String,
    pub labels_path: String,
    pub input_size: u32,
    pub event_type: String,
    pub request_timeout: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Classifies images as they land in object storage")]
pub struct Args {
    /// Host to bind to (overrides DERMA_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory for per-request scratch files (overrides DERMA_SCRATCH_DIR)
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Result store database URL (overrides DERMA_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Object storage backend (overrides DERMA_STORAGE_BACKEND)
    #[arg(long, value_enum)]
    pub storage_backend: Option<StorageBackend>,

    /// Root directory for the `fs` backend (overrides DERMA_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Base URL for the `http` backend (overrides DERMA_STORAGE_ENDPOINT)
    #[arg(long)]
    pub storage_endpoint: Option<String>,

    /// Bucket holding the model artifacts (overrides DERMA_MODEL_BUCKET)
    #[arg(long)]
    pub model_bucket: Option<String>,

    /// Object path of the ONNX weights (overrides DERMA_MODEL_PATH)
    #[arg(long)]
    pub model_path: Option<String>,

    /// Object path of the label set (overrides DERMA_LABELS_PATH)
    #[arg(long)]
    pub labels_path: Option<String>,

    /// Square model input size in pixels (overrides DERMA_INPUT_SIZE)
    #[arg(long)]
    pub input_size: Option<u32>,

    /// Timeout for storage requests, in seconds (overrides DERMA_REQUEST_TIMEOUT_SECS)
    #[arg(long)]
    pub request_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::from_sources(args, |key| env::var(key).ok())?;
        Ok((cfg, migrate))
    }

    /// Merge CLI args over values from `lookup` over defaults.
    pub fn from_sources(args: Args, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        // --- Environment fallback ---
        let env_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let env_port = parse_env(&lookup, "PORT", 8080u16)?;
        let env_input_size = parse_env(&lookup, "DERMA_INPUT_SIZE", 224u32)?;
        let env_timeout = parse_env(&lookup, "DERMA_REQUEST_TIMEOUT_SECS", 60u64)?;
        let env_backend = parse_env(&lookup, "DERMA_STORAGE_BACKEND", StorageBackend::Fs)?;
        let env_scratch = lookup("DERMA_SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| env::temp_dir().join("derma-scratch"));

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or_else(|| env_or("DERMA_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            scratch_dir: args.scratch_dir.unwrap_or(env_scratch),
            database_url: args
                .database_url
                .unwrap_or_else(|| env_or("DERMA_DATABASE_URL", "sqlite://./data/derma.db")),
            storage_backend: args.storage_backend.unwrap_or(env_backend),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| env_or("DERMA_STORAGE_DIR", "./data/objects").into()),
            storage_endpoint: args.storage_endpoint.unwrap_or_else(|| {
                env_or("DERMA_STORAGE_ENDPOINT", "https://storage.googleapis.com")
            }),
            storage_token: lookup("DERMA_STORAGE_TOKEN").filter(|t| !t.is_empty()),
            model_bucket: args
                .model_bucket
                .unwrap_or_else(|| env_or("DERMA_MODEL_BUCKET", "derma-3fec9-2")),
            model_path: args
                .model_path
                .unwrap_or_else(|| env_or("DERMA_MODEL_PATH", "best.onnx")),
            labels_path: args
                .labels_path
                .unwrap_or_else(|| env_or("DERMA_LABELS_PATH", "labels.txt")),
            input_size: args.input_size.unwrap_or(env_input_size),
            event_type: env_or("DERMA_EVENT_TYPE", STORAGE_FINALIZED_TYPE),
            request_timeout: Duration::from_secs(args.request_timeout_secs.unwrap_or(env_timeout)),
        };

        if cfg.input_size == 0 {
            bail!("input size must be positive");
        }
        if cfg.request_timeout.is_zero() {
            bail!("request timeout must be positive");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn model_artifacts(&self) -> ModelArtifacts {
        ModelArtifacts {
            bucket: self.model_bucket.clone(),
            weights_path: self.model_path.clone(),
            labels_path: self.labels_path.clone(),
            input_shape: InputShape::square(self.input_size),
        }
    }
}

fn parse_env<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    match lookup(key) {
        Some(value) => value.trim().parse::<T>().map_err(|err| {
            let err: anyhow::Error = err.into();
            err.context(format!("parsing {} value `{}`", key, value))
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = AppConfig::from_sources(Args::default(), env(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.storage_backend, StorageBackend::Fs);
        assert_eq!(cfg.model_bucket, "derma-3fec9-2");
        assert_eq!(cfg.input_size, 224);
        assert_eq!(cfg.event_type, STORAGE_FINALIZED_TYPE);
        assert_eq!(cfg.request_timeout, Duration::from_secs(60));
        assert!(cfg.storage_token.is_none());
    }

    #[test]
    fn env_overrides_defaults_and_args_override_env() {
        let lookup = env(&[
            ("PORT", "9000"),
            ("DERMA_STORAGE_BACKEND", "HTTP"),
            ("DERMA_MODEL_PATH", "weights/v2.onnx"),
            ("DERMA_STORAGE_TOKEN", "secret"),
        ]);
        let args = Args {
            port: Some(7000),
            input_size: Some(160),
            ..Default::default()
        };
        let cfg = AppConfig::from_sources(args, lookup).unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.storage_backend, StorageBackend::Http);
        assert_eq!(cfg.model_path, "weights/v2.onnx");
        assert_eq!(cfg.storage_token.as_deref(), Some("secret"));
        assert_eq!(cfg.model_artifacts().input_shape, InputShape::square(160));
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = AppConfig::from_sources(Args::default(), env(&[("PORT", "eighty")])).unwrap_err();
        assert!(format!("{:#}", err).contains("PORT"));

        let err = AppConfig::from_sources(Args::default(), env(&[("DERMA_STORAGE_BACKEND", "s3")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("s3"));
    }

    #[test]
    fn zero_input_size_is_rejected() {
        let args = Args {
            input_size: Some(0),
            ..Default::default()
        };
        assert!(AppConfig::from_sources(args, env(&[])).is_err());
    }
}
