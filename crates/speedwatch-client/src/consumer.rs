//! Local view of one measurement stream.
//!
//! Every wire message, pre-flight verdict, cancellation or transport end is
//! fed through [`StreamConsumer::reduce`]. The consumer owns its state; there
//! is no shared mutable view for callbacks to race on.

use serde::Serialize;
use speedwatch_core::stream_protocol::{ErrorPayload, ProgressPayload, ResultPayload};
use speedwatch_core::{MonotonicClamp, Phase, StreamMessage};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Connecting,
    Ping,
    Download,
    Upload,
    Complete,
    Errored,
    Cancelled,
}

impl ConsumerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConsumerState::Complete | ConsumerState::Errored | ConsumerState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Connecting => "connecting",
            ConsumerState::Ping => "ping",
            ConsumerState::Download => "download",
            ConsumerState::Upload => "upload",
            ConsumerState::Complete => "complete",
            ConsumerState::Errored => "errored",
            ConsumerState::Cancelled => "cancelled",
        }
    }
}

impl From<Phase> for ConsumerState {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Connecting => ConsumerState::Connecting,
            Phase::Ping => ConsumerState::Ping,
            Phase::Download => ConsumerState::Download,
            Phase::Upload => ConsumerState::Upload,
            Phase::Complete => ConsumerState::Complete,
        }
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a consumer ended in [`ConsumerState::Errored`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// Pre-flight found the connection belongs to another provider.
    IdentityMismatch {
        claimed: String,
        detected: String,
        message: String,
        /// Another provider configured for the office that matches the detection.
        alternative: Option<String>,
    },
    /// An `error` message on the stream, or a rejection before it opened.
    Hub {
        message: String,
        code: Option<String>,
        retryable: bool,
    },
    /// The stream ended without a terminal message.
    StreamEnded,
    Transport(String),
}

impl Failure {
    pub fn message(&self) -> String {
        match self {
            Failure::IdentityMismatch { message, .. } => message.clone(),
            Failure::Hub { message, .. } => message.clone(),
            Failure::StreamEnded => "the hub closed the stream before a result".to_string(),
            Failure::Transport(detail) => format!("connection to the hub failed: {detail}"),
        }
    }

    pub fn code(&self) -> Option<&str> {
        match self {
            Failure::IdentityMismatch { .. } => Some("identity_mismatch"),
            Failure::Hub { code, .. } => code.as_deref(),
            Failure::StreamEnded | Failure::Transport(_) => None,
        }
    }
}

impl From<&ErrorPayload> for Failure {
    fn from(payload: &ErrorPayload) -> Self {
        Failure::Hub {
            message: payload.error.clone(),
            code: payload.code.clone(),
            retryable: payload.retryable.unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConsumerEvent {
    Message(StreamMessage),
    Failed(Failure),
    Cancelled,
    StreamClosed,
}

/// Whether a reduction changed what a renderer would show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Figures {
    pub download: f64,
    pub upload: f64,
    pub ping: f64,
}

#[derive(Debug, Clone)]
pub struct StreamConsumer {
    state: ConsumerState,
    clamp: MonotonicClamp,
    figures: Figures,
    result: Option<ResultPayload>,
    failure: Option<Failure>,
}

impl Default for StreamConsumer {
    fn default() -> Self {
        Self {
            state: ConsumerState::Connecting,
            clamp: MonotonicClamp::new(),
            figures: Figures {
                download: 0.0,
                upload: 0.0,
                ping: 0.0,
            },
            result: None,
            failure: None,
        }
    }
}

impl StreamConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ConsumerState {
        self.state
    }

    pub fn progress(&self) -> f64 {
        self.clamp.floor()
    }

    pub fn figures(&self) -> &Figures {
        &self.figures
    }

    pub fn result(&self) -> Option<&ResultPayload> {
        self.result.as_ref()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Applies one event. Terminal states absorb everything after them.
    pub fn reduce(&mut self, event: ConsumerEvent) -> Transition {
        if self.is_terminal() {
            return Transition::Unchanged;
        }
        match event {
            ConsumerEvent::Message(StreamMessage::Progress(progress)) => self.on_progress(&progress),
            ConsumerEvent::Message(StreamMessage::Result(result)) => {
                self.clamp.apply(Phase::Complete, 100.0);
                self.figures = Figures {
                    download: result.download,
                    upload: result.upload,
                    ping: result.ping,
                };
                self.result = Some(result);
                self.state = ConsumerState::Complete;
                Transition::Changed
            }
            ConsumerEvent::Message(StreamMessage::Error(payload)) => {
                self.fail(Failure::from(&payload))
            }
            ConsumerEvent::Failed(failure) => self.fail(failure),
            ConsumerEvent::StreamClosed => self.fail(Failure::StreamEnded),
            ConsumerEvent::Cancelled => {
                self.state = ConsumerState::Cancelled;
                Transition::Changed
            }
        }
    }

    fn on_progress(&mut self, progress: &ProgressPayload) -> Transition {
        let before = (self.clamp.phase(), self.clamp.floor(), self.figures.clone());
        let (phase, _) = self.clamp.apply(progress.stage, progress.progress);
        // A progress message never completes the run; only a result does.
        self.state = if phase == Phase::Complete {
            ConsumerState::Upload
        } else {
            phase.into()
        };
        self.figures = Figures {
            download: sanitize(progress.download),
            upload: sanitize(progress.upload),
            ping: sanitize(progress.ping),
        };
        if before == (self.clamp.phase(), self.clamp.floor(), self.figures.clone()) {
            Transition::Unchanged
        } else {
            Transition::Changed
        }
    }

    fn fail(&mut self, failure: Failure) -> Transition {
        self.failure = Some(failure);
        self.state = ConsumerState::Errored;
        Transition::Changed
    }
}

fn sanitize(value: f64) -> f64 {
    if value.is_finite() && value >= 0.0 {
        value
    } else {
        0.0
    }
}
