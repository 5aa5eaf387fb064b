use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `GET /api/health`.
///
/// Only `status` is required; the remaining fields are those the reference backend reports.
/// Anything else the server sends is kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Service status, e.g. `healthy`, `unhealthy`, or `error` when unreachable.
    pub status: String,

    /// Model the backend is configured with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Whether the backend has credentials for its model provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_configured: Option<bool>,

    /// Server-side time of the check.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Unrecognized fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl HealthStatus {
    /// The status string used when the service could not be reached.
    pub const ERROR: &'static str = "error";

    /// The value reported when the health check fails for any reason.
    pub fn error() -> Self {
        Self {
            status: Self::ERROR.to_string(),
            model: None,
            api_configured: None,
            timestamp: None,
            extra: Map::new(),
        }
    }

    /// True unless this is the failure placeholder.
    pub fn is_reachable(&self) -> bool {
        self.status != Self::ERROR
    }
}
