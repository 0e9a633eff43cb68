use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use chrono::{DateTime, Utc};
use kube::{
    client::Client,
    runtime::events::{Recorder, Reporter},
};

use credentials::CredentialResolver;
use events::Notifier;
use route53::{DnsProvider, ProviderError};
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[source] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[source] kube::Error),

    #[error("Secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("Secret key {key} not found")]
    SecretKeyMissing { key: String },

    #[error("Secret value for {key} is not valid utf-8")]
    SecretValueEncoding { key: String },

    #[error("Invalid IP address: {0}")]
    InvalidIpAddress(#[from] std::net::AddrParseError),

    #[error("Unsupported record type: {0}")]
    UnsupportedRecordType(String),

    #[error("Record has no targets to upsert")]
    EmptyTargets,

    #[error("Route53 API error: {0}")]
    ProviderError(#[from] ProviderError),
}
pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn metric_label(&self) -> String {
        format!("{self:?}").to_lowercase()
    }
}

/// Diagnostics to be exposed by the web server
#[derive(Clone, Serialize)]
pub struct Diagnostics {
    pub last_event: DateTime<Utc>,
    #[serde(skip)]
    pub reporter: Reporter,
}
impl Default for Diagnostics {
    fn default() -> Self {
        Self {
            last_event: Utc::now(),
            reporter: "dnsrecord-controller".into(),
        }
    }
}
impl Diagnostics {
    fn recorder(&self, client: Client) -> Recorder {
        Recorder::new(client, self.reporter.clone())
    }
}

/// State shared between the controller and the web server
#[derive(Clone)]
pub struct State {
    /// Diagnostics populated by the reconciler
    diagnostics: Arc<RwLock<Diagnostics>>,
    /// Metrics
    metrics: Arc<Metrics>,
}

/// State wrapper around the controller outputs for the web server
impl State {
    pub fn new() -> Self {
        Self {
            diagnostics: Arc::default(),
            metrics: Arc::default(),
        }
    }

    /// Metrics getter
    pub fn metrics(&self) -> String {
        let mut buffer = String::new();
        let registry = &*self.metrics.registry;
        prometheus_client::encoding::text::encode(&mut buffer, registry).unwrap();
        buffer
    }

    /// State getter
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    // Create a Controller Context that can update State
    pub async fn to_context(&self, client: Client, provider: Arc<dyn DnsProvider>) -> Arc<Context> {
        Arc::new(Context {
            client: client.clone(),
            notifier: Notifier::new(self.diagnostics.read().await.recorder(client.clone())),
            metrics: self.metrics.clone(),
            diagnostics: self.diagnostics.clone(),
            credentials: CredentialResolver::new(client),
            provider,
        })
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Best-effort event publisher
    pub notifier: Notifier,
    /// Diagnostics read by the web server
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Prometheus metrics
    pub metrics: Arc<Metrics>,
    /// AWS credential lookup against Secrets
    pub credentials: CredentialResolver,
    /// Route53 change submission
    pub provider: Arc<dyn DnsProvider>,
}

pub async fn run(state: State) {
    dns_record::run(state).await;
}

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;
pub use metrics::Metrics;
pub mod credentials;
pub mod dns_record;
pub mod events;
pub mod route53;

#[cfg(test)]
pub mod fixtures;
