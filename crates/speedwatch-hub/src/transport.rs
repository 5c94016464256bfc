use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use speedwatch_core::stream_protocol::{
    encode_sse_frame, ErrorPayload, ResultPayload, SSE_CONTENT_TYPE,
};
use speedwatch_core::StreamMessage;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Write side of one observer's event stream.
///
/// Emits never block. Once the observer is gone, or a terminal message has
/// been written, further emits are dropped.
pub struct StreamTransport {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    max_frame_bytes: usize,
    terminal_sent: AtomicBool,
}

/// Read side, turned into the HTTP response body.
pub struct StreamReceiver {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub fn stream_channel(max_frame_bytes: usize) -> (StreamTransport, StreamReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        StreamTransport {
            tx,
            max_frame_bytes,
            terminal_sent: AtomicBool::new(false),
        },
        StreamReceiver { rx },
    )
}

impl StreamTransport {
    /// Returns whether the frame was queued for the observer.
    pub fn emit(&self, message: &StreamMessage) -> bool {
        if self.terminal_sent.load(Ordering::SeqCst) || self.tx.is_closed() {
            return false;
        }
        let Some(frame) = self.encode(message) else {
            return false;
        };
        if message.is_terminal() && self.terminal_sent.swap(true, Ordering::SeqCst) {
            return false;
        }
        if self.tx.send(frame).is_err() {
            debug!(event = "observer_gone", kind = message.kind());
            return false;
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves when the observer drops its end of the stream.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    /// A terminal message that does not fit is replaced by a smaller one, so
    /// the observer always learns the run is over.
    fn encode(&self, message: &StreamMessage) -> Option<Vec<u8>> {
        let err = match encode_sse_frame(message, self.max_frame_bytes) {
            Ok(frame) => return Some(frame),
            Err(err) => err,
        };
        warn!(event = "frame_encode_failed", kind = message.kind(), error = %err);

        let mut fallbacks = Vec::new();
        match message {
            StreamMessage::Progress(_) => return None,
            StreamMessage::Result(result) => fallbacks.push(StreamMessage::Result(ResultPayload {
                raw_data: String::new(),
                ..result.clone()
            })),
            StreamMessage::Error(_) => {}
        }
        let mut oversized = ErrorPayload::new("the measurement finished but its report was too large to stream");
        oversized.code = Some("frame_too_large".to_string());
        oversized.retryable = Some(false);
        fallbacks.push(StreamMessage::Error(oversized));

        for fallback in &fallbacks {
            if let Ok(frame) = encode_sse_frame(fallback, self.max_frame_bytes) {
                debug!(event = "frame_fallback_used", kind = fallback.kind());
                return Some(frame);
            }
        }
        None
    }
}

impl StreamReceiver {
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    pub fn into_body(self) -> Body {
        let stream = futures_util::stream::unfold(self.rx, |mut rx| async move {
            rx.recv()
                .await
                .map(|frame| (Ok::<Vec<u8>, Infallible>(frame), rx))
        });
        Body::from_stream(stream)
    }

    pub fn into_response(self) -> Response {
        let mut response = (StatusCode::OK, self.into_body()).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static(SSE_CONTENT_TYPE),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        response
    }
}
