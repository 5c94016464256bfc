pub mod error;
pub mod identity;
pub mod progress;
pub mod schedule;
pub mod stderr;
pub mod stream_protocol;
pub mod tool_events;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub use error::MeasurementError;
pub use identity::{IdentityCatalog, IdentityResolution, ValidationMode, UNKNOWN_IDENTITY};
pub use progress::{MonotonicClamp, ProgressEvent, ProgressNormalizer};
pub use schedule::{TimeWindow, WindowSchedule};
pub use stream_protocol::StreamMessage;
pub use tool_events::{Outcome, ShapedResult, TerminalKind, ToolProgress};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Connecting,
    Ping,
    Download,
    Upload,
    Complete,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Connecting
    }
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Connecting => "connecting",
            Phase::Ping => "ping",
            Phase::Download => "download",
            Phase::Upload => "upload",
            Phase::Complete => "complete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One measurement attempt, owned by a single supervisor run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRequest {
    pub request_id: String,
    pub office_id: String,
    #[serde(default)]
    pub claimed_isp: Option<String>,
    #[serde(default)]
    pub section: Option<String>,
    #[serde(default)]
    pub isp_validated: bool,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
}

pub fn default_time_zone() -> String {
    "UTC".to_string()
}

impl MeasurementRequest {
    pub fn new(office_id: impl Into<String>) -> Self {
        Self {
            request_id: new_request_id(),
            office_id: office_id.into(),
            claimed_isp: None,
            section: None,
            isp_validated: false,
            time_zone: default_time_zone(),
        }
    }

    pub fn with_claimed_isp(mut self, isp: impl Into<String>, validated: bool) -> Self {
        let isp = isp.into();
        let trimmed = isp.trim();
        if trimmed.is_empty() {
            self.claimed_isp = None;
            self.isp_validated = false;
        } else {
            self.claimed_isp = Some(trimmed.to_string());
            self.isp_validated = validated;
        }
        self
    }

    pub fn with_section(mut self, section: impl Into<String>) -> Self {
        let section = section.into();
        let trimmed = section.trim();
        self.section = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    pub fn with_time_zone(mut self, tz: impl Into<String>) -> Self {
        let tz = tz.into();
        if !tz.trim().is_empty() {
            self.time_zone = tz.trim().to_string();
        }
        self
    }

    /// Whether the caller must run pre-flight identity validation before opening a stream.
    pub fn needs_preflight(&self) -> bool {
        self.claimed_isp.is_some() && !self.isp_validated
    }
}

pub fn new_request_id() -> String {
    format!("req-{}", uuid::Uuid::new_v4().simple())
}

/// Office record consumed from the environment: configured providers and sections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfficeRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub isp_names: Vec<String>,
    #[serde(default)]
    pub sections: Vec<String>,
}

impl OfficeRecord {
    pub fn default_isp(&self) -> &str {
        self.isp_names
            .iter()
            .map(|name| name.trim())
            .find(|name| !name.is_empty())
            .unwrap_or(UNKNOWN_IDENTITY)
    }

    pub fn has_section(&self, section: &str) -> bool {
        let wanted = section.trim();
        self.sections
            .iter()
            .any(|candidate| candidate.trim().eq_ignore_ascii_case(wanted))
    }
}

/// The single record persisted per completed measurement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResult {
    pub request_id: String,
    pub office_id: String,
    #[serde(default)]
    pub section: Option<String>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    #[serde(default)]
    pub server_id: Option<String>,
    #[serde(default)]
    pub server_name: Option<String>,
    pub isp_name: String,
    #[serde(default)]
    pub isp_validation: Option<IdentityResolution>,
    #[serde(default)]
    pub client_ip: Option<String>,
    #[serde(default)]
    pub server_location: Option<String>,
    #[serde(default)]
    pub result_url: Option<String>,
    #[serde(default)]
    pub raw_data: String,
    /// RFC 3339, UTC.
    pub measured_at: String,
}

impl MeasurementResult {
    /// Builds the persisted record from a shaped tool result. The raw blob
    /// echoes the request's claims next to the tool's own object for audit.
    pub fn from_shaped(
        request: &MeasurementRequest,
        shaped: ShapedResult,
        isp_name: String,
        isp_validation: Option<IdentityResolution>,
        measured_at: DateTime<Utc>,
    ) -> Self {
        let raw_data = serde_json::json!({
            "tool": shaped.tool_json,
            "section": request.section,
            "claimedIsp": request.claimed_isp,
            "ispValidated": request.isp_validated,
            "requestId": request.request_id,
        })
        .to_string();
        Self {
            request_id: request.request_id.clone(),
            office_id: request.office_id.clone(),
            section: request.section.clone(),
            download_mbps: shaped.download_mbps,
            upload_mbps: shaped.upload_mbps,
            ping_ms: shaped.ping_ms,
            jitter_ms: shaped.jitter_ms,
            packet_loss: shaped.packet_loss,
            server_id: shaped.server_id,
            server_name: shaped.server_name,
            isp_name,
            isp_validation,
            client_ip: shaped.client_ip,
            server_location: shaped.server_location,
            result_url: shaped.result_url,
            raw_data,
            measured_at: measured_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}
