use serde::Deserialize;
use serde::Serialize;

/// Body of `GET /api/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// RFC 3339 timestamp of the response.
    pub timestamp: String,
}

/// Body of `GET /api/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub gateway: String,
    pub connections: usize,
    /// Seconds since the gateway started.
    pub uptime: u64,
    pub active_missions: usize,
}
