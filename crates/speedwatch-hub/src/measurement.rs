//! Runs one measurement: spawns the tool, turns its output into stream
//! messages, and hands the single accepted result to the persistence guard.

use crate::config::ToolInvocation;
use crate::persistence::PersistenceGuard;
use crate::supervisor::{ProcessSupervisor, SupervisorEvent, SupervisorHandle};
use crate::transport::StreamTransport;
use speedwatch_core::stderr::classify_stderr_line;
use speedwatch_core::stream_protocol::{ErrorPayload, ResultPayload};
use speedwatch_core::tool_events::{
    classify_tool_line, shape_from_buffer, shape_result, ToolLineDecoder, ToolLines,
};
use speedwatch_core::{
    IdentityCatalog, MeasurementError, MeasurementRequest, OfficeRecord, Outcome,
    ProgressNormalizer, ShapedResult, StreamMessage, TerminalKind,
};
use speedwatch_storage::ResultSink;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

pub struct MeasurementJob {
    pub request: MeasurementRequest,
    pub office: OfficeRecord,
    pub invocation: ToolInvocation,
    pub catalog: Arc<IdentityCatalog>,
    pub sink: Arc<dyn ResultSink>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { saved: bool },
    Failed(MeasurementError),
    StorageFailed(String),
    /// The observer left before a terminal event.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub request_id: String,
    pub outcome: RunOutcome,
    pub exit_code: Option<i32>,
}

/// Drives the job to completion. Returns after the tool process has exited.
pub async fn run_measurement(
    job: MeasurementJob,
    supervisor: ProcessSupervisor,
    transport: StreamTransport,
) -> RunSummary {
    let request_id = job.request.request_id.clone();
    let mut run = Dispatch::new(&job, supervisor.timeout().as_secs());

    if let Some(event) = run.normalizer.initial() {
        transport.emit(&event.into());
    }

    let mut handle = match supervisor.start(&job.invocation) {
        Ok(handle) => handle,
        Err(err) => {
            run.fail(&transport, None, err);
            return run.summary(request_id, None);
        }
    };
    info!(
        event = "measurement_started",
        request_id = %request_id,
        office_id = %job.request.office_id,
        pid = ?handle.pid()
    );

    let mut observer_gone = false;
    let exit_code = loop {
        tokio::select! {
            _ = transport.closed(), if !observer_gone => {
                observer_gone = true;
                if !run.terminated {
                    warn!(event = "observer_disconnected", request_id = %request_id);
                    run.terminated = true;
                    run.outcome = Some(RunOutcome::Abandoned);
                    handle.kill();
                }
            }
            event = handle.next_event() => match event {
                Some(SupervisorEvent::Stdout(chunk)) => {
                    run.buffer.extend_from_slice(&chunk);
                    let lines = run.decoder.push_chunk(&chunk);
                    run.dispatch_lines(&transport, &handle, lines).await;
                }
                Some(SupervisorEvent::Stderr(line)) => {
                    let outcome = classify_stderr_line(&line);
                    if outcome == Outcome::Ignored && !line.trim().is_empty() {
                        debug!(event = "tool_stderr", request_id = %request_id, line = %line);
                    }
                    run.on_outcome(&transport, &handle, outcome).await;
                }
                Some(SupervisorEvent::TimedOut) => {
                    let err = MeasurementError::Timeout { secs: run.timeout_secs };
                    run.fail(&transport, Some(&handle), err);
                }
                Some(SupervisorEvent::Exited(code)) => {
                    let lines = run.decoder.finish();
                    run.dispatch_lines(&transport, &handle, lines).await;
                    run.on_exit(&transport, code).await;
                    break code;
                }
                None => break None,
            }
        }
    };

    run.summary(request_id, exit_code)
}

struct Dispatch<'a> {
    job: &'a MeasurementJob,
    timeout_secs: u64,
    normalizer: ProgressNormalizer,
    decoder: ToolLineDecoder,
    buffer: Vec<u8>,
    guard: Arc<PersistenceGuard>,
    detected_isp: Option<String>,
    /// Set by the first terminal event; later terminal events are discarded.
    terminated: bool,
    outcome: Option<RunOutcome>,
}

impl<'a> Dispatch<'a> {
    fn new(job: &'a MeasurementJob, timeout_secs: u64) -> Self {
        Self {
            job,
            timeout_secs,
            normalizer: ProgressNormalizer::new(),
            decoder: ToolLineDecoder::default(),
            buffer: Vec::new(),
            guard: Arc::new(PersistenceGuard::new(
                job.request.clone(),
                job.office.clone(),
                job.catalog.clone(),
                job.sink.clone(),
            )),
            detected_isp: None,
            terminated: false,
            outcome: None,
        }
    }

    async fn dispatch_lines(
        &mut self,
        transport: &StreamTransport,
        handle: &SupervisorHandle,
        lines: ToolLines,
    ) {
        if lines.undecodable > 0 {
            debug!(
                event = "tool_line_undecodable",
                request_id = %self.job.request.request_id,
                count = lines.undecodable
            );
        }
        for value in lines.values {
            let outcome = classify_tool_line(&value);
            self.on_outcome(transport, handle, outcome).await;
        }
    }

    async fn on_outcome(
        &mut self,
        transport: &StreamTransport,
        handle: &SupervisorHandle,
        outcome: Outcome,
    ) {
        match outcome {
            Outcome::Progress(progress) => {
                if let Some(isp) = progress.detected_isp.as_ref() {
                    self.detected_isp = Some(isp.clone());
                }
                if self.terminated {
                    return;
                }
                if let Some(event) = self.normalizer.observe(&progress) {
                    transport.emit(&event.into());
                }
            }
            Outcome::Recoverable(err) => self.fail(transport, None, err),
            Outcome::Terminal(TerminalKind::Completed(value)) => {
                if self.terminated {
                    debug!(
                        event = "late_terminal_discarded",
                        request_id = %self.job.request.request_id
                    );
                    return;
                }
                match shape_result(&value) {
                    Ok(shaped) => self.complete(transport, shaped).await,
                    Err(err) => self.fail(transport, Some(handle), err),
                }
            }
            Outcome::Terminal(TerminalKind::Failed(err)) => {
                self.fail(transport, Some(handle), err);
            }
            Outcome::Ignored => {}
        }
    }

    async fn on_exit(&mut self, transport: &StreamTransport, code: Option<i32>) {
        if self.terminated {
            return;
        }
        match code {
            Some(0) => {
                debug!(event = "result_fallback_parse", request_id = %self.job.request.request_id);
                match shape_from_buffer(&self.buffer) {
                    Ok(shaped) => self.complete(transport, shaped).await,
                    Err(err) => self.fail(transport, None, err),
                }
            }
            Some(code) => self.fail(
                transport,
                None,
                MeasurementError::UnknownToolError {
                    detail: format!("speedtest exited with code {code}"),
                },
            ),
            None => self.fail(
                transport,
                None,
                MeasurementError::UnknownToolError {
                    detail: "speedtest was terminated by a signal".to_string(),
                },
            ),
        }
    }

    async fn complete(&mut self, transport: &StreamTransport, shaped: ShapedResult) {
        self.terminated = true;
        self.normalizer.complete();
        // The store write is synchronous; keep it off the runtime workers.
        let guard = self.guard.clone();
        let detected = self.detected_isp.clone();
        let saved = tokio::task::spawn_blocking(move || guard.try_save(shaped, detected.as_deref()))
            .await
            .map_err(|err| err.to_string())
            .and_then(|saved| saved.map_err(|err| err.to_string()));
        match saved {
            Ok(outcome) => {
                match outcome.result.as_ref() {
                    Some(result) => {
                        transport.emit(&StreamMessage::Result(ResultPayload::from(result)));
                    }
                    None => self.fail(transport, None, MeasurementError::DuplicateCompletion),
                }
                self.outcome = Some(RunOutcome::Completed {
                    saved: outcome.saved,
                });
            }
            Err(err) => {
                error!(
                    event = "result_save_failed",
                    request_id = %self.job.request.request_id,
                    error = %err
                );
                let mut payload = ErrorPayload::new("failed to save the measurement result");
                payload.code = Some("storage_error".to_string());
                payload.retryable = Some(true);
                transport.emit(&StreamMessage::Error(payload));
                self.outcome = Some(RunOutcome::StorageFailed(err));
            }
        }
    }

    fn fail(
        &mut self,
        transport: &StreamTransport,
        handle: Option<&SupervisorHandle>,
        err: MeasurementError,
    ) {
        if err.is_silent() {
            warn!(
                event = "measurement_noise",
                request_id = %self.job.request.request_id,
                code = err.code(),
                detail = %err
            );
            return;
        }
        if let Some(handle) = handle {
            handle.kill();
        }
        if self.terminated {
            debug!(
                event = "late_terminal_discarded",
                request_id = %self.job.request.request_id,
                code = err.code()
            );
            return;
        }
        self.terminated = true;
        warn!(
            event = "measurement_failed",
            request_id = %self.job.request.request_id,
            code = err.code(),
            error = %err
        );
        transport.emit(&StreamMessage::Error(ErrorPayload::from(&err)));
        self.outcome = Some(RunOutcome::Failed(err));
    }

    fn summary(self, request_id: String, exit_code: Option<i32>) -> RunSummary {
        let outcome = self.outcome.unwrap_or(RunOutcome::Abandoned);
        info!(
            event = "measurement_finished",
            request_id = %request_id,
            outcome = ?outcome,
            exit_code = ?exit_code
        );
        RunSummary {
            request_id,
            outcome,
            exit_code,
        }
    }
}
