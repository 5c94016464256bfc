use crate::identity::IdentityResolution;
use crate::progress::ProgressEvent;
use crate::{MeasurementResult, Phase};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;
pub const SSE_CONTENT_TYPE: &str = "text/event-stream";

const DATA_PREFIX: &[u8] = b"data:";
const FRAME_DELIMITER: &[u8] = b"\n\n";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Progress(ProgressPayload),
    Result(ResultPayload),
    Error(ErrorPayload),
}

impl StreamMessage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamMessage::Result(_) | StreamMessage::Error(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamMessage::Progress(_) => "progress",
            StreamMessage::Result(_) => "result",
            StreamMessage::Error(_) => "error",
        }
    }
}

impl From<ProgressEvent> for StreamMessage {
    fn from(event: ProgressEvent) -> Self {
        StreamMessage::Progress(ProgressPayload {
            stage: event.phase,
            progress: event.progress,
            download: event.download,
            upload: event.upload,
            ping: event.ping,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressPayload {
    pub stage: Phase,
    pub progress: f64,
    #[serde(default)]
    pub download: f64,
    #[serde(default)]
    pub upload: f64,
    #[serde(default)]
    pub ping: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub stage: Phase,
    pub progress: f64,
    pub download: f64,
    pub upload: f64,
    pub ping: f64,
    #[serde(default)]
    pub jitter: f64,
    #[serde(default)]
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
    pub complete: bool,
    #[serde(default)]
    pub raw_data: String,
}

impl From<&MeasurementResult> for ResultPayload {
    fn from(result: &MeasurementResult) -> Self {
        Self {
            stage: Phase::Complete,
            progress: 100.0,
            download: result.download_mbps,
            upload: result.upload_mbps,
            ping: result.ping_ms,
            jitter: result.jitter_ms,
            packet_loss: result.packet_loss,
            server_id: result.server_id.clone(),
            server_name: result.server_name.clone(),
            isp_name: result.isp_name.clone(),
            isp_validation: result.isp_validation.clone(),
            client_ip: result.client_ip.clone(),
            server_location: result.server_location.clone(),
            result_url: result.result_url.clone(),
            complete: true,
            raw_data: result.raw_data.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retryable: Option<bool>,
}

impl ErrorPayload {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
            code: None,
            retryable: None,
        }
    }
}

impl From<&crate::MeasurementError> for ErrorPayload {
    fn from(err: &crate::MeasurementError) -> Self {
        Self {
            error: err.to_string(),
            code: Some(err.code().to_string()),
            retryable: Some(err.retryable()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("buffer exceeds max size without delimiter: {size} > {max}")]
    OversizedBuffer { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct DecodeReport<T> {
    pub frames: Vec<T>,
    pub errors: Vec<FrameError>,
}

impl<T> Default for DecodeReport<T> {
    fn default() -> Self {
        Self {
            frames: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl<T> DecodeReport<T> {
    fn push_frame(&mut self, frame: T) {
        self.frames.push(frame);
    }

    fn push_error(&mut self, error: FrameError) {
        self.errors.push(error);
    }
}

/// Encodes one server-push message as `data: <json>\n\n`.
pub fn encode_sse_frame<T: Serialize>(
    value: &T,
    max_frame_bytes: usize,
) -> Result<Vec<u8>, FrameError> {
    let json = serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if json.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: json.len(),
            max: max_frame_bytes,
        });
    }
    let mut encoded = Vec::with_capacity(json.len() + 8);
    encoded.extend_from_slice(b"data: ");
    encoded.extend_from_slice(&json);
    encoded.extend_from_slice(FRAME_DELIMITER);
    Ok(encoded)
}

/// Decodes a single block. Returns `Ok(None)` for blocks without `data:` lines
/// (keep-alive comments, bare `event:`/`id:` fields).
pub fn decode_sse_frame<T: DeserializeOwned>(
    bytes: &[u8],
    max_frame_bytes: usize,
) -> Result<Option<T>, FrameError> {
    let Some(data) = extract_data(bytes) else {
        return Ok(None);
    };
    if data.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: data.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|err| FrameError::Decode(err.to_string()))
}

fn extract_data(block: &[u8]) -> Option<Vec<u8>> {
    let mut data: Option<Vec<u8>> = None;
    for line in block.split(|byte| *byte == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        let buf = data.get_or_insert_with(Vec::new);
        if !buf.is_empty() {
            buf.push(b'\n');
        }
        buf.extend_from_slice(rest);
    }
    data
}

/// Incremental decoder for a `text/event-stream` body.
pub struct SseFrameDecoder<T> {
    max_frame_bytes: usize,
    pending: Vec<u8>,
    marker: PhantomData<T>,
}

impl<T> SseFrameDecoder<T> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            max_frame_bytes,
            pending: Vec::new(),
            marker: PhantomData,
        }
    }
}

impl<T> Default for SseFrameDecoder<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl<T: DeserializeOwned> SseFrameDecoder<T> {
    pub fn push_chunk(&mut self, chunk: &[u8]) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        self.pending
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        while let Some(idx) = find_delimiter(&self.pending) {
            let block = self
                .pending
                .drain(..idx + FRAME_DELIMITER.len())
                .collect::<Vec<u8>>();
            self.decode_block(&block[..idx], &mut report);
        }

        // The limit covers the `data: ` prefix and the delimiter as well as the payload.
        let buffer_limit = self.max_frame_bytes + 16;
        if self.pending.len() > buffer_limit {
            report.push_error(FrameError::OversizedBuffer {
                size: self.pending.len(),
                max: buffer_limit,
            });
            self.pending.clear();
        }

        report
    }

    pub fn finish(&mut self) -> DecodeReport<T> {
        let mut report = DecodeReport::default();
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            self.pending.clear();
            return report;
        }
        let block = std::mem::take(&mut self.pending);
        self.decode_block(&block, &mut report);
        report
    }

    fn decode_block(&self, block: &[u8], report: &mut DecodeReport<T>) {
        match decode_sse_frame(block, self.max_frame_bytes) {
            Ok(Some(parsed)) => report.push_frame(parsed),
            Ok(None) => {}
            Err(err) => report.push_error(err),
        }
    }
}

fn find_delimiter(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_DELIMITER.len())
        .position(|window| window == FRAME_DELIMITER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn download_progress() -> StreamMessage {
        StreamMessage::Progress(ProgressPayload {
            stage: Phase::Download,
            progress: 42.5,
            download: 87.3,
            upload: 0.0,
            ping: 14.2,
        })
    }

    #[test]
    fn progress_frame_uses_data_prefix_and_blank_line() {
        let frame = encode_sse_frame(&download_progress(), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode");
        let text = String::from_utf8(frame).expect("utf8");
        assert!(text.starts_with("data: {\"type\":\"progress\",\"stage\":\"download\""));
        assert!(text.ends_with("}\n\n"));
        assert_eq!(text.matches('\n').count(), 2);
    }

    #[test]
    fn wire_literals_decode_into_messages() {
        let progress: StreamMessage = serde_json::from_str(
            r#"{"type":"progress","stage":"download","progress":42.5,"download":87.3,"upload":0,"ping":14.2}"#,
        )
        .expect("progress");
        assert_eq!(progress, download_progress());

        let result: StreamMessage = serde_json::from_str(
            r#"{"type":"result","stage":"complete","progress":100,"download":91.2,"upload":38.7,"ping":13.9,
                "jitter":1.2,"packetLoss":0,"serverId":"10493","serverName":"Example","ispName":"PLDT",
                "ispValidation":{"isMatch":true,"confidence":100,"proceed":true,"claimed":"PLDT","detected":"PLDT Inc.",
                "canonicalClaimed":"PLDT","canonicalDetected":"PLDT"},
                "clientIp":"203.0.113.9","serverLocation":"Manila","resultUrl":"https://example.invalid/r/1",
                "complete":true,"rawData":"{}"}"#,
        )
        .expect("result");
        match result {
            StreamMessage::Result(payload) => {
                assert_eq!(payload.stage, Phase::Complete);
                assert_eq!(payload.download, 91.2);
                assert_eq!(payload.isp_name, "PLDT");
                assert_eq!(payload.server_id.as_deref(), Some("10493"));
                let validation = payload.isp_validation.expect("validation");
                assert!(validation.is_match);
                assert_eq!(validation.confidence, 100);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let error: StreamMessage =
            serde_json::from_str(r#"{"type":"error","error":"Speed test timed out"}"#)
                .expect("error");
        assert!(error.is_terminal());
        assert_eq!(error.kind(), "error");
    }

    #[test]
    fn sse_decoder_handles_split_chunks_and_comments() {
        let frame = encode_sse_frame(&download_progress(), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode");
        let mut stream = b": keep-alive\n\n".to_vec();
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(&frame);

        let mut decoder = SseFrameDecoder::<StreamMessage>::default();
        let (head, tail) = stream.split_at(frame.len() / 2 + 14);
        let first = decoder.push_chunk(head);
        assert!(first.frames.is_empty());
        assert!(first.errors.is_empty());

        let second = decoder.push_chunk(tail);
        assert_eq!(second.frames.len(), 2);
        assert!(second.errors.is_empty());
        assert!(decoder.finish().frames.is_empty());
    }

    #[test]
    fn sse_decoder_accepts_crlf_and_multiline_data() {
        let raw = b"event: message\r\ndata: {\"type\":\"error\",\r\ndata: \"error\":\"boom\"}\r\n\r\n";
        let mut decoder = SseFrameDecoder::<StreamMessage>::default();
        let report = decoder.push_chunk(raw);
        assert_eq!(report.frames.len(), 1);
        assert_eq!(
            report.frames[0],
            StreamMessage::Error(ErrorPayload::new("boom"))
        );
    }

    #[test]
    fn sse_decoder_recovers_after_malformed_frame() {
        let valid = encode_sse_frame(&download_progress(), DEFAULT_MAX_FRAME_BYTES)
            .expect("encode");
        let mut chunk = valid.clone();
        chunk.extend_from_slice(b"data: {\"type\":\"progress\"\n\n");
        chunk.extend_from_slice(&valid);

        let mut decoder = SseFrameDecoder::<StreamMessage>::default();
        let report = decoder.push_chunk(&chunk);
        assert_eq!(report.frames.len(), 2);
        assert_eq!(report.errors.len(), 1);
        assert!(matches!(report.errors[0], FrameError::Decode(_)));
    }

    #[test]
    fn encoder_rejects_oversized_payload() {
        let message = StreamMessage::Error(ErrorPayload::new("x".repeat(128)));
        let result = encode_sse_frame(&message, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }
}
