//! Transports that deliver metric records to an experiment tracker.

use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use url::Url;

use imgflow_shared::{PipelineError, Result};

use crate::MetricsRecord;

/// Basic-auth credentials read from the environment at resolution time.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Credentials {
    pub username: String,
    #[serde(serialize_with = "redact")]
    pub password: String,
}

fn redact<S: serde::Serializer>(_: &String, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str("***")
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where metric records are sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrackingTarget {
    /// POST each record as JSON to an HTTP endpoint.
    Http {
        endpoint: Url,
        #[serde(skip_serializing_if = "Option::is_none")]
        credentials: Option<Credentials>,
    },
    /// Append each record as one JSON line to a local file.
    File { path: PathBuf },
}

/// Delivers one record. Errors are always [`PipelineError::SinkUnavailable`].
pub trait Transport: Send + 'static {
    /// Short label for logs.
    fn name(&self) -> &str;

    /// Deliver a single record.
    fn send(&self, record: &MetricsRecord) -> Result<()>;
}

/// Build the transport for a tracking target.
pub fn transport_for(target: &TrackingTarget) -> Result<Box<dyn Transport>> {
    Ok(match target {
        TrackingTarget::Http {
            endpoint,
            credentials,
        } => Box::new(HttpTransport::new(endpoint.clone(), credentials.clone())?),
        TrackingTarget::File { path } => Box::new(JsonlTransport::new(path.clone())),
    })
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// JSON-over-HTTP transport using a blocking client.
pub struct HttpTransport {
    client: reqwest::blocking::Client,
    endpoint: Url,
    credentials: Option<Credentials>,
}

impl HttpTransport {
    pub fn new(endpoint: Url, credentials: Option<Credentials>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("imgflow/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| PipelineError::SinkUnavailable(format!("client build: {e}")))?;

        Ok(Self {
            client,
            endpoint,
            credentials,
        })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn send(&self, record: &MetricsRecord) -> Result<()> {
        let mut request = self.client.post(self.endpoint.as_str()).json(record);
        if let Some(creds) = &self.credentials {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }

        let response = request
            .send()
            .map_err(|e| PipelineError::SinkUnavailable(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::SinkUnavailable(format!(
                "{}: HTTP {status}",
                self.endpoint
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON lines file
// ---------------------------------------------------------------------------

/// Appends one JSON document per line to a local file.
pub struct JsonlTransport {
    path: PathBuf,
}

impl JsonlTransport {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl Transport for JsonlTransport {
    fn name(&self) -> &str {
        "jsonl"
    }

    fn send(&self, record: &MetricsRecord) -> Result<()> {
        let unavailable =
            |e: std::io::Error| PipelineError::SinkUnavailable(format!("{}: {e}", self.path.display()));

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| PipelineError::SinkUnavailable(format!("serialize record: {e}")))?;

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(unavailable)?;
        writeln!(file, "{line}").map_err(unavailable)?;
        Ok(())
    }
}
