use std::path::PathBuf;

use thiserror::Error;

use crate::util::retriable_status;

/// Failure of a single request or of a whole fetch pass.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure: DNS, connect, TLS, timeout, truncated body.
    #[error("network error for {url}: {message}")]
    Network { url: String, message: String },

    /// Non-success HTTP status.
    #[error("HTTP {status} for url ({url})")]
    Status { url: String, status: u16 },

    /// The feature service answered with an error payload (often under HTTP 200).
    #[error("service error {code} for url ({url}): {message}")]
    Service {
        url: String,
        code: u16,
        message: String,
    },

    /// The response body could not be understood.
    #[error("malformed response from {url}: {message}")]
    Parse { url: String, message: String },

    /// The retry budget was spent on transient failures.
    #[error("gave up after {attempts} attempt(s): {last}")]
    Exhausted {
        attempts: usize,
        #[source]
        last: Box<FetchError>,
    },
}

impl FetchError {
    pub fn is_parse(&self) -> bool {
        matches!(self, FetchError::Parse { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, FetchError::Exhausted { .. })
    }

    /// Whether another attempt of the same request may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Network { .. } => true,
            FetchError::Status { status, .. } => retriable_status(*status),
            FetchError::Service { code, .. } => retriable_status(*code),
            FetchError::Parse { .. } | FetchError::Exhausted { .. } => false,
        }
    }
}

/// Per-record (or per-chunk) coordinate lookup failure. Never fatal.
#[derive(Debug, Error)]
pub enum GeometryLookupError {
    #[error("no geometry returned for object {0}")]
    Missing(i64),

    #[error("geometry for object {0} has no usable coordinates")]
    Empty(i64),

    #[error("geometry query for {count} object(s) failed: {source}")]
    Request {
        count: usize,
        #[source]
        source: FetchError,
    },
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode CSV {}: {source}", path.display())]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("failed to encode JSON {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to replace {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: tempfile::PersistError,
    },
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no data source produced rows; last error: {last}")]
    AllSourcesFailed { last: String },

    #[error(transparent)]
    Write(#[from] WriteError),
}

impl PipelineError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> u8 {
        match self {
            PipelineError::AllSourcesFailed { .. } => 2,
            PipelineError::Write(_) => 3,
        }
    }
}

/// Error envelope of the ArcGIS REST API:
/// `{"error": {"code": 400, "message": "...", "details": ["..."]}}`.
#[derive(Debug, serde::Deserialize)]
pub(crate) struct ServiceErrorEnvelope {
    pub(crate) error: ServiceErrorBody,
}

#[derive(Debug, serde::Deserialize)]
pub(crate) struct ServiceErrorBody {
    #[serde(default)]
    pub(crate) code: Option<u16>,
    #[serde(default)]
    pub(crate) message: Option<String>,
    #[serde(default)]
    pub(crate) details: Vec<String>,
}

pub(crate) fn format_service_error(status: u16, url: &str, body: &ServiceErrorBody) -> FetchError {
    let code = body.code.unwrap_or(status);
    let mut message = body
        .message
        .as_deref()
        .unwrap_or("unspecified error")
        .to_string();

    // "Invalid query parameters" alone is useless; the details name the parameter.
    let details: Vec<&str> = body
        .details
        .iter()
        .map(|d| d.trim())
        .filter(|d| !d.is_empty())
        .collect();
    if !details.is_empty() {
        message.push_str(" (");
        message.push_str(&details.join("; "));
        message.push(')');
    }

    FetchError::Service {
        url: url.to_string(),
        code,
        message,
    }
}

/// Detects an ArcGIS error envelope in an otherwise successful response body.
pub(crate) fn service_error_in(status: u16, url: &str, text: &str) -> Option<FetchError> {
    if !text.trim_start().starts_with('{') || !text.contains("\"error\"") {
        return None;
    }
    serde_json::from_str::<ServiceErrorEnvelope>(text)
        .ok()
        .map(|env| format_service_error(status, url, &env.error))
}
