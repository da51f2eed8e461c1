//! Command-line and environment configuration.
//!
//! Every flag mirrors a `FAKE_GCS_`-prefixed uppercase environment
//! variable; flags take precedence.  Configuration problems are reported
//! as a single diagnostic line with a nonzero exit.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use crate::notify::EventType;

/// Storage backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendKind {
    Memory,
    Filesystem,
}

/// Listener scheme selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Scheme {
    Http,
    Https,
    Both,
}

/// Log verbosity, fed into the tracing env filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "mockgcs",
    version,
    about = "Google Cloud Storage emulator for local development and testing"
)]
pub struct Config {
    /// Storage backend.
    #[arg(long, value_enum, default_value = "filesystem", env = "FAKE_GCS_BACKEND")]
    pub backend: BackendKind,

    /// Root directory for the filesystem backend.
    #[arg(
        long = "filesystem-root",
        default_value = "/storage",
        env = "FAKE_GCS_FILESYSTEM_ROOT"
    )]
    pub filesystem_root: PathBuf,

    /// Listener scheme.  TLS termination is delegated; `https`/`both`
    /// require external TLS material this build does not load.
    #[arg(long, value_enum, default_value = "http", env = "FAKE_GCS_SCHEME")]
    pub scheme: Scheme,

    /// Bind address.
    #[arg(long, default_value = "0.0.0.0", env = "FAKE_GCS_HOST")]
    pub host: String,

    /// Bind port.
    #[arg(long, default_value_t = 4443, env = "FAKE_GCS_PORT")]
    pub port: u16,

    /// HTTP bind port when scheme is `both`.
    #[arg(long = "port-http", default_value_t = 8000, env = "FAKE_GCS_PORT_HTTP")]
    pub port_http: u16,

    /// Host reported in self-links and upload `Location` headers.
    #[arg(long = "public-host", default_value = "", env = "FAKE_GCS_PUBLIC_HOST")]
    pub public_host: String,

    /// Full URL override for self-links and upload `Location` headers.
    #[arg(long = "external-url", env = "FAKE_GCS_EXTERNAL_URL")]
    pub external_url: Option<String>,

    /// Seed directory: first-level subdirectories become buckets.
    #[arg(long = "data", env = "FAKE_GCS_DATA")]
    pub data: Option<PathBuf>,

    /// Extra CORS-allowlisted request headers (comma separated).
    #[arg(
        long = "cors-headers",
        env = "FAKE_GCS_CORS_HEADERS",
        value_delimiter = ','
    )]
    pub cors_headers: Vec<String>,

    /// Pub/Sub project for the global back-compat notification config.
    #[arg(
        long = "event.pubsub-project-id",
        env = "FAKE_GCS_EVENT_PUBSUB_PROJECT_ID"
    )]
    pub event_pubsub_project_id: Option<String>,

    /// Pub/Sub topic for the global notification config.
    #[arg(long = "event.pubsub-topic", env = "FAKE_GCS_EVENT_PUBSUB_TOPIC")]
    pub event_pubsub_topic: Option<String>,

    /// Bucket the global notification config watches.
    #[arg(long = "event.bucket", env = "FAKE_GCS_EVENT_BUCKET")]
    pub event_bucket: Option<String>,

    /// Object name prefix filter for the global notification config.
    #[arg(long = "event.object-prefix", env = "FAKE_GCS_EVENT_OBJECT_PREFIX")]
    pub event_object_prefix: Option<String>,

    /// Event types the global notification config fires on
    /// (comma separated, e.g. `finalize,delete`).
    #[arg(
        long = "event.list",
        env = "FAKE_GCS_EVENT_LIST",
        value_delimiter = ','
    )]
    pub event_list: Vec<String>,

    /// Default bucket location tag.
    #[arg(long, default_value = "US-CENTRAL1", env = "FAKE_GCS_LOCATION")]
    pub location: String,

    /// TLS certificate path (external TLS termination).
    #[arg(long = "cert-location", env = "FAKE_GCS_CERT_LOCATION")]
    pub cert_location: Option<PathBuf>,

    /// TLS private key path (external TLS termination).
    #[arg(long = "private-key-location", env = "FAKE_GCS_PRIVATE_KEY_LOCATION")]
    pub private_key_location: Option<PathBuf>,

    /// Log level.
    #[arg(long = "log-level", value_enum, default_value = "info", env = "FAKE_GCS_LOG_LEVEL")]
    pub log_level: LogLevel,
}

/// The global back-compat notification config, resolved from the
/// `event.*` flags.
pub struct GlobalEventConfig {
    pub bucket: String,
    pub topic: String,
    pub object_prefix: String,
    pub event_types: Vec<EventType>,
}

impl Config {
    /// Base URL used in self-links, media links, and upload `Location`
    /// headers.
    pub fn public_url(&self) -> String {
        if let Some(url) = &self.external_url {
            return url.trim_end_matches('/').to_string();
        }
        let scheme = match self.scheme {
            Scheme::Http => "http",
            Scheme::Https | Scheme::Both => "https",
        };
        if !self.public_host.is_empty() {
            format!("{scheme}://{}", self.public_host)
        } else {
            format!("{scheme}://{}:{}", self.host, self.port)
        }
    }

    /// Validate the configuration, returning a single-line diagnostic on
    /// error.
    pub fn validate(&self) -> Result<(), String> {
        if matches!(self.scheme, Scheme::Https | Scheme::Both) {
            return Err(
                "scheme 'https' requires TLS termination, which this build delegates; \
                 run with --scheme http behind a TLS proxy"
                    .to_string(),
            );
        }
        if let Some(data) = &self.data {
            if !data.is_dir() {
                return Err(format!("seed directory {} does not exist", data.display()));
            }
        }
        if self.event_pubsub_topic.is_some() != self.event_bucket.is_some() {
            return Err(
                "event.pubsub-topic and event.bucket must be set together".to_string(),
            );
        }
        Ok(())
    }

    /// Resolve the `event.*` flags into a global notification config, if
    /// one is requested.
    pub fn global_event_config(&self) -> Result<Option<GlobalEventConfig>, String> {
        let (Some(topic), Some(bucket)) = (&self.event_pubsub_topic, &self.event_bucket) else {
            return Ok(None);
        };
        let project = self
            .event_pubsub_project_id
            .as_deref()
            .unwrap_or("_");
        let event_types = self
            .event_list
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| EventType::parse(s).map_err(|e| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Some(GlobalEventConfig {
            bucket: bucket.clone(),
            topic: format!("//pubsub.googleapis.com/projects/{project}/topics/{topic}"),
            object_prefix: self.event_object_prefix.clone().unwrap_or_default(),
            event_types,
        }))
    }
}
