//! HTTP side of the consumer: pre-flight validation, the event stream, and
//! cancellation.

use crate::consumer::{ConsumerEvent, Failure, StreamConsumer, Transition};
use crate::error::ClientError;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use speedwatch_core::stream_protocol::{SseFrameDecoder, DEFAULT_MAX_FRAME_BYTES};
use speedwatch_core::{IdentityResolution, MeasurementRequest, StreamMessage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Body of `POST /api/isp/validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateVerdict {
    #[serde(flatten)]
    pub resolution: IdentityResolution,
    #[serde(default)]
    pub alternative_isp: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    code: Option<String>,
}

/// Thin wrapper over the hub's HTTP API.
#[derive(Debug, Clone)]
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
    validate_timeout: Duration,
}

impl HubClient {
    pub fn new(
        base_url: &str,
        api_token: Option<String>,
        validate_timeout: Duration,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::InvalidUrl(base_url));
        }
        // No overall timeout: the stream legitimately stays open for minutes.
        let http = reqwest::Client::builder()
            .connect_timeout(validate_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_token,
            validate_timeout,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn validate(
        &self,
        office_id: &str,
        claimed_isp: &str,
    ) -> Result<ValidateVerdict, ClientError> {
        let request = self
            .http
            .post(format!("{}/api/isp/validate", self.base_url))
            .timeout(self.validate_timeout)
            .json(&json!({ "officeId": office_id, "claimedIsp": claimed_isp }));
        let response = self.authorized(request).send().await?;
        let response = reject_unless_success(response).await?;
        Ok(response.json::<ValidateVerdict>().await?)
    }

    pub async fn open_stream(
        &self,
        request: &MeasurementRequest,
    ) -> Result<reqwest::Response, ClientError> {
        let mut query = vec![
            ("officeId", request.office_id.clone()),
            ("tz", request.time_zone.clone()),
        ];
        if let Some(isp) = &request.claimed_isp {
            query.push(("isp", isp.clone()));
            query.push(("ispValidated", request.isp_validated.to_string()));
        }
        if let Some(section) = &request.section {
            query.push(("section", section.clone()));
        }
        let builder = self
            .http
            .get(format!("{}/api/speedtest/stream", self.base_url))
            .query(&query);
        let response = self.authorized(builder).send().await?;
        reject_unless_success(response).await
    }
}

async fn reject_unless_success(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let body = serde_json::from_str::<ErrorBody>(&text).ok();
    let message = body
        .as_ref()
        .and_then(|body| body.error.clone())
        .unwrap_or_else(|| {
            if text.trim().is_empty() {
                status.to_string()
            } else {
                text.trim().to_string()
            }
        });
    Err(ClientError::Rejected {
        status: status.as_u16(),
        message,
        code: body.and_then(|body| body.code),
    })
}

/// Cancels the run of the session it was taken from.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

struct ActiveGuard<'a>(&'a AtomicBool);

impl<'a> ActiveGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// One consumer at a time against a hub. Once cancelled, a session stays
/// cancelled; start a new one for the next run.
pub struct MeasurementSession {
    client: HubClient,
    active: AtomicBool,
    cancel: CancellationToken,
}

impl MeasurementSession {
    pub fn new(client: HubClient) -> Self {
        Self {
            client,
            active: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.cancel.clone(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Runs pre-flight validation when needed, then follows the stream to a
    /// terminal state. `observe` sees the consumer after every change.
    ///
    /// Hub rejections and transport failures end in
    /// [`ConsumerState::Errored`](crate::ConsumerState::Errored); only a
    /// second concurrent run is an `Err`.
    pub async fn run<F>(
        &self,
        request: &MeasurementRequest,
        mut observe: F,
    ) -> Result<StreamConsumer, ClientError>
    where
        F: FnMut(&StreamConsumer),
    {
        let Some(_active) = ActiveGuard::acquire(&self.active) else {
            return Err(ClientError::AlreadyActive);
        };
        let mut consumer = StreamConsumer::new();
        observe(&consumer);

        if request.needs_preflight() {
            if let Some(failure) = self.preflight(request).await {
                consumer.reduce(failure);
                observe(&consumer);
                return Ok(consumer);
            }
        }

        let opened = tokio::select! {
            _ = self.cancel.cancelled() => None,
            opened = self.client.open_stream(request) => Some(opened),
        };
        let response = match opened {
            None => {
                consumer.reduce(ConsumerEvent::Cancelled);
                observe(&consumer);
                return Ok(consumer);
            }
            Some(Ok(response)) => response,
            Some(Err(err)) => {
                consumer.reduce(ConsumerEvent::Failed(failure_from(err)));
                observe(&consumer);
                return Ok(consumer);
            }
        };
        info!(event = "stream_opened", request_id = %request.request_id, office_id = %request.office_id);

        self.follow(response, &mut consumer, &mut observe).await;
        info!(
            event = "stream_finished",
            request_id = %request.request_id,
            state = %consumer.state()
        );
        Ok(consumer)
    }

    /// `Some(event)` when the run must stop before the stream opens.
    async fn preflight(&self, request: &MeasurementRequest) -> Option<ConsumerEvent> {
        let claimed = request.claimed_isp.as_deref()?;
        let verdict = tokio::select! {
            _ = self.cancel.cancelled() => return Some(ConsumerEvent::Cancelled),
            verdict = self.client.validate(&request.office_id, claimed) => verdict,
        };
        match verdict {
            Ok(verdict) if verdict.resolution.proceed => {
                debug!(
                    event = "preflight_passed",
                    claimed = %verdict.resolution.canonical_claimed,
                    confidence = verdict.resolution.confidence
                );
                None
            }
            Ok(verdict) => {
                warn!(
                    event = "identity_mismatch",
                    claimed = %verdict.resolution.canonical_claimed,
                    detected = %verdict.resolution.canonical_detected,
                    alternative = ?verdict.alternative_isp
                );
                let message = verdict.error.clone().unwrap_or_else(|| {
                    format!(
                        "provider mismatch: selected {} but the connection belongs to {}",
                        verdict.resolution.canonical_claimed, verdict.resolution.canonical_detected
                    )
                });
                Some(ConsumerEvent::Failed(Failure::IdentityMismatch {
                    claimed: verdict.resolution.canonical_claimed,
                    detected: verdict.resolution.canonical_detected,
                    message,
                    alternative: verdict.alternative_isp,
                }))
            }
            Err(err) => Some(ConsumerEvent::Failed(failure_from(err))),
        }
    }

    async fn follow<F>(
        &self,
        response: reqwest::Response,
        consumer: &mut StreamConsumer,
        observe: &mut F,
    ) where
        F: FnMut(&StreamConsumer),
    {
        let mut bytes = response.bytes_stream();
        let mut decoder = SseFrameDecoder::<StreamMessage>::new(DEFAULT_MAX_FRAME_BYTES);
        loop {
            let chunk = tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!(event = "stream_cancelled");
                    consumer.reduce(ConsumerEvent::Cancelled);
                    observe(consumer);
                    return;
                }
                chunk = bytes.next() => chunk,
            };
            let ended = chunk.is_none();
            let report = match chunk {
                Some(Ok(chunk)) => decoder.push_chunk(&chunk),
                Some(Err(err)) => {
                    consumer.reduce(ConsumerEvent::Failed(Failure::Transport(err.to_string())));
                    observe(consumer);
                    return;
                }
                None => decoder.finish(),
            };
            for err in &report.errors {
                warn!(event = "frame_decode_failed", error = %err);
            }
            for message in report.frames {
                if consumer.reduce(ConsumerEvent::Message(message)) == Transition::Changed {
                    observe(consumer);
                }
                if consumer.is_terminal() {
                    // Dropping the body here closes the connection.
                    return;
                }
            }
            if ended {
                consumer.reduce(ConsumerEvent::StreamClosed);
                observe(consumer);
                return;
            }
        }
    }
}

fn failure_from(err: ClientError) -> Failure {
    match err {
        ClientError::Rejected {
            message,
            code,
            status,
        } => Failure::Hub {
            message,
            code,
            retryable: status >= 500,
        },
        other => Failure::Transport(other.to_string()),
    }
}
