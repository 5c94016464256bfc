use crate::stderr::{classify_diagnostic, Diagnostic};
use crate::{MeasurementError, Phase};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// bytes/s to Mbps.
pub const BANDWIDTH_TO_MBPS: f64 = 8.0 / 1_000_000.0;
/// Raw bandwidth figures above this are treated as corrupt.
pub const MAX_RAW_BANDWIDTH: f64 = 1e15;
/// `testStart` carries no fraction of its own.
pub const TEST_START_FRACTION: f64 = 0.2;

/// Normalised view of one incremental tool event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolProgress {
    pub phase: Phase,
    pub fraction: f64,
    pub download_mbps: Option<f64>,
    pub upload_mbps: Option<f64>,
    pub latency_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub detected_isp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TerminalKind {
    /// The tool's own result object, still unshaped.
    Completed(Box<Value>),
    Failed(MeasurementError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Progress(ToolProgress),
    /// Logged and otherwise ignored; never ends a measurement.
    Recoverable(MeasurementError),
    Terminal(TerminalKind),
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapedResult {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub ping_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub server_id: Option<String>,
    pub server_name: Option<String>,
    pub server_location: Option<String>,
    pub detected_isp: Option<String>,
    pub client_ip: Option<String>,
    pub result_url: Option<String>,
    pub tool_json: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ToolLine {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    ping: Option<PingSection>,
    #[serde(default)]
    download: Option<TransferSection>,
    #[serde(default)]
    upload: Option<TransferSection>,
    #[serde(default)]
    packet_loss: Option<f64>,
    #[serde(default)]
    isp: Option<String>,
    #[serde(default)]
    interface: Option<InterfaceSection>,
    #[serde(default)]
    server: Option<ServerSection>,
    #[serde(default)]
    result: Option<ResultLink>,
}

#[derive(Debug, Default, Deserialize)]
struct PingSection {
    #[serde(default)]
    jitter: Option<f64>,
    #[serde(default)]
    latency: Option<f64>,
    #[serde(default)]
    progress: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct TransferSection {
    #[serde(default)]
    bandwidth: Option<f64>,
    #[serde(default)]
    progress: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InterfaceSection {
    #[serde(default)]
    external_ip: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    #[serde(default, deserialize_with = "deserialize_optional_id")]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    location: Option<String>,
    #[serde(default)]
    country: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ResultLink {
    #[serde(default)]
    url: Option<String>,
}

/// Deserialize an id that can be either a string or a number.
fn deserialize_optional_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: Value = Value::deserialize(deserializer)?;
    match val {
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Null => Ok(None),
        _ => Err(serde::de::Error::custom("expected string or number for id")),
    }
}

pub fn bandwidth_to_mbps(raw: f64) -> f64 {
    if !raw.is_finite() || raw < 0.0 || raw > MAX_RAW_BANDWIDTH {
        return 0.0;
    }
    round2(raw * BANDWIDTH_TO_MBPS)
}

/// Latency, jitter and loss figures: non-negative and finite or zero.
pub fn sanitize_metric(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        round2(value)
    } else {
        0.0
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn clamp_fraction(value: Option<f64>) -> f64 {
    match value {
        Some(v) if v.is_finite() => v.clamp(0.0, 1.0),
        _ => 0.0,
    }
}

/// Classifies one decoded stdout object.
pub fn classify_tool_line(value: &Value) -> Outcome {
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        let detail = match error {
            Value::String(text) => text.clone(),
            other => other
                .get("message")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        return Outcome::Terminal(TerminalKind::Failed(fatal_from_detail(&detail)));
    }

    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind == "result" {
        return Outcome::Terminal(TerminalKind::Completed(Box::new(value.clone())));
    }
    let line: ToolLine = match serde_json::from_value(value.clone()) {
        Ok(line) => line,
        Err(_) => return Outcome::Ignored,
    };

    match kind {
        "testStart" => Outcome::Progress(ToolProgress {
            phase: Phase::Connecting,
            fraction: TEST_START_FRACTION,
            detected_isp: line.isp.clone(),
            ..ToolProgress::default()
        }),
        "ping" => {
            let ping = line.ping.unwrap_or_default();
            Outcome::Progress(ToolProgress {
                phase: Phase::Ping,
                fraction: clamp_fraction(ping.progress),
                latency_ms: ping.latency.map(sanitize_metric),
                jitter_ms: ping.jitter.map(sanitize_metric),
                ..ToolProgress::default()
            })
        }
        "download" => {
            let section = line.download.unwrap_or_default();
            Outcome::Progress(ToolProgress {
                phase: Phase::Download,
                fraction: clamp_fraction(section.progress),
                download_mbps: section.bandwidth.map(bandwidth_to_mbps),
                ..ToolProgress::default()
            })
        }
        "upload" => {
            let section = line.upload.unwrap_or_default();
            Outcome::Progress(ToolProgress {
                phase: Phase::Upload,
                fraction: clamp_fraction(section.progress),
                upload_mbps: section.bandwidth.map(bandwidth_to_mbps),
                ..ToolProgress::default()
            })
        }
        "log" if line.level.as_deref() == Some("error") => {
            let message = line.message.unwrap_or_default();
            match classify_diagnostic(&message) {
                Diagnostic::Fatal(err) => Outcome::Terminal(TerminalKind::Failed(err)),
                Diagnostic::Noise(err) => Outcome::Recoverable(err),
                Diagnostic::Unclassified => Outcome::Ignored,
            }
        }
        _ => Outcome::Ignored,
    }
}

fn fatal_from_detail(detail: &str) -> MeasurementError {
    match classify_diagnostic(detail) {
        Diagnostic::Fatal(err) => err,
        Diagnostic::Noise(_) | Diagnostic::Unclassified => MeasurementError::UnknownToolError {
            detail: detail.trim().to_string(),
        },
    }
}

/// Turns the tool's result object into persisted figures. Used by both the
/// streaming path and the end-of-output fallback.
pub fn shape_result(tool_json: &Value) -> Result<ShapedResult, MeasurementError> {
    let line: ToolLine =
        serde_json::from_value(tool_json.clone()).map_err(|err| MeasurementError::ParseFailure {
            detail: err.to_string(),
        })?;
    if let Some(kind) = line.kind.as_deref() {
        if kind != "result" {
            return Err(MeasurementError::ParseFailure {
                detail: format!("expected a result object, got {kind}"),
            });
        }
    }

    let download = line
        .download
        .and_then(|section| section.bandwidth)
        .ok_or_else(|| MeasurementError::ParseFailure {
            detail: "missing download bandwidth".to_string(),
        })?;
    let upload = line
        .upload
        .and_then(|section| section.bandwidth)
        .ok_or_else(|| MeasurementError::ParseFailure {
            detail: "missing upload bandwidth".to_string(),
        })?;
    let ping = line.ping.unwrap_or_default();
    let server = line.server.unwrap_or_default();
    let server_location = match (server.location, server.country) {
        (Some(location), Some(country)) if !country.trim().is_empty() => {
            Some(format!("{location}, {country}"))
        }
        (location, _) => location,
    };

    Ok(ShapedResult {
        download_mbps: bandwidth_to_mbps(download),
        upload_mbps: bandwidth_to_mbps(upload),
        ping_ms: ping.latency.map(sanitize_metric).unwrap_or(0.0),
        jitter_ms: ping.jitter.map(sanitize_metric).unwrap_or(0.0),
        packet_loss: line.packet_loss.map(sanitize_metric).unwrap_or(0.0),
        server_id: server.id,
        server_name: server.name,
        server_location,
        detected_isp: line.isp,
        client_ip: line.interface.and_then(|interface| interface.external_ip),
        result_url: line.result.and_then(|result| result.url),
        tool_json: tool_json.clone(),
    })
}

/// Longest stdout line kept while waiting for its newline.
pub const MAX_TOOL_LINE_BYTES: usize = 256 * 1024;

/// Splits chunked tool stdout into one JSON value per line.
#[derive(Debug, Default)]
pub struct ToolLineDecoder {
    pending: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct ToolLines {
    pub values: Vec<Value>,
    /// Non-empty lines that were not JSON, or overran the line limit.
    pub undecodable: usize,
}

impl ToolLines {
    fn decode(&mut self, line: &[u8]) {
        let text = String::from_utf8_lossy(line);
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        match serde_json::from_str::<Value>(text) {
            Ok(value) => self.values.push(value),
            Err(_) => self.undecodable += 1,
        }
    }
}

impl ToolLineDecoder {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> ToolLines {
        let mut lines = ToolLines::default();
        self.pending.extend_from_slice(chunk);
        while let Some(end) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=end).collect::<Vec<u8>>();
            lines.decode(&line);
        }
        if self.pending.len() > MAX_TOOL_LINE_BYTES {
            lines.undecodable += 1;
            self.pending.clear();
        }
        lines
    }

    /// Decodes an unterminated last line.
    pub fn finish(&mut self) -> ToolLines {
        let mut lines = ToolLines::default();
        let rest = std::mem::take(&mut self.pending);
        lines.decode(&rest);
        lines
    }
}

/// The last complete JSON object in an accumulated output buffer.
pub fn last_json_object(buffer: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(buffer);
    let from_lines = text.lines().rev().find_map(|line| {
        let trimmed = line.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        serde_json::from_str::<Value>(trimmed)
            .ok()
            .filter(Value::is_object)
    });
    from_lines.or_else(|| {
        serde_json::from_str::<Value>(text.trim())
            .ok()
            .filter(Value::is_object)
    })
}

/// Fallback for a clean exit without a streamed `result` event.
pub fn shape_from_buffer(buffer: &[u8]) -> Result<ShapedResult, MeasurementError> {
    let value = last_json_object(buffer).ok_or_else(|| MeasurementError::ParseFailure {
        detail: "no JSON object in tool output".to_string(),
    })?;
    shape_result(&value)
}
