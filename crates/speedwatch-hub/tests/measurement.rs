#![cfg(unix)]

mod common;

use common::{decode_all, happy_script, progress_values, shell, store, RESULT_LINE};
use speedwatch_core::{
    IdentityCatalog, MeasurementError, MeasurementRequest, MeasurementResult, Phase,
    StreamMessage,
};
use speedwatch_hub::{
    run_measurement, stream_channel, MeasurementJob, ProcessSupervisor, RunOutcome, RunSummary,
    SupervisorEvent, ToolInvocation,
};
use speedwatch_storage::{ResultSink, SpeedwatchStore, StorageError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn job(
    store: &Arc<SpeedwatchStore>,
    request: MeasurementRequest,
    invocation: ToolInvocation,
) -> MeasurementJob {
    MeasurementJob {
        request,
        office: common::office(),
        invocation,
        catalog: Arc::new(IdentityCatalog::default()),
        sink: store.clone(),
    }
}

fn supervisor(timeout_secs: u64) -> ProcessSupervisor {
    ProcessSupervisor::new(Duration::from_secs(timeout_secs), Duration::from_secs(1))
}

async fn run_collecting(
    job: MeasurementJob,
    supervisor: ProcessSupervisor,
) -> (RunSummary, Vec<StreamMessage>) {
    let (transport, mut receiver) = stream_channel(64 * 1024);
    let run = tokio::spawn(run_measurement(job, supervisor, transport));
    let mut bytes = Vec::new();
    while let Some(frame) = receiver.recv().await {
        bytes.extend_from_slice(&frame);
    }
    let summary = run.await.expect("join");
    (summary, decode_all(&bytes))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn happy_path_streams_progress_then_one_result() {
    let store = store();
    let request = MeasurementRequest::new("office-1")
        .with_claimed_isp("PLDT", true)
        .with_section("Finance");
    let (summary, messages) =
        run_collecting(job(&store, request, shell(&happy_script())), supervisor(30)).await;

    assert_eq!(summary.outcome, RunOutcome::Completed { saved: true });
    assert_eq!(summary.exit_code, Some(0));

    let progress = progress_values(&messages);
    assert_eq!(progress.first(), Some(&0.0));
    assert!(progress.windows(2).all(|pair| pair[0] <= pair[1]), "{progress:?}");
    assert!(messages
        .iter()
        .any(|message| matches!(message, StreamMessage::Progress(p) if p.stage == Phase::Download && p.download == 87.3)));
    assert!(messages.iter().all(|message| match message {
        StreamMessage::Progress(p) => p.upload >= 0.0,
        _ => true,
    }));

    let last = messages.last().expect("terminal message");
    let StreamMessage::Result(result) = last else {
        panic!("expected result, got {last:?}");
    };
    assert_eq!(result.stage, Phase::Complete);
    assert_eq!(result.progress, 100.0);
    assert_eq!(result.download, 91.2);
    assert_eq!(result.upload, 38.7);
    assert_eq!(result.isp_name, "PLDT");
    assert_eq!(result.server_id.as_deref(), Some("10493"));
    assert!(result.complete);
    assert_eq!(messages.iter().filter(|message| message.is_terminal()).count(), 1);

    let stored = store.results_for_office("office-1").expect("results");
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].isp_name, "PLDT");
    assert_eq!(stored[0].section.as_deref(), Some("Finance"));
    let raw: serde_json::Value = serde_json::from_str(&stored[0].raw_data).expect("raw");
    assert_eq!(raw["claimedIsp"], "PLDT");
    assert_eq!(raw["section"], "Finance");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_exit_without_result_event_uses_fallback_parse() {
    let store = store();
    // Same figures, but without the "type" marker the stream parser keys on.
    let untyped = RESULT_LINE.replacen(r#""type":"result","#, "", 1);
    let script = format!("echo '{{\"type\":\"testStart\",\"isp\":\"PLDT Inc.\"}}'; echo '{untyped}'");
    let (summary, messages) = run_collecting(
        job(&store, MeasurementRequest::new("office-1"), shell(&script)),
        supervisor(30),
    )
    .await;

    assert_eq!(summary.outcome, RunOutcome::Completed { saved: true });
    match messages.last() {
        Some(StreamMessage::Result(result)) => {
            assert_eq!(result.download, 91.2);
            assert_eq!(result.upload, 38.7);
            assert_eq!(result.isp_name, "PLDT");
        }
        other => panic!("expected result, got {other:?}"),
    }
    assert_eq!(store.result_count("office-1").expect("count"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn garbage_output_is_a_parse_failure() {
    let store = store();
    let (summary, messages) = run_collecting(
        job(&store, MeasurementRequest::new("office-1"), shell("echo 'not json'")),
        supervisor(30),
    )
    .await;

    assert!(matches!(
        summary.outcome,
        RunOutcome::Failed(MeasurementError::ParseFailure { .. })
    ));
    match messages.last() {
        Some(StreamMessage::Error(error)) => {
            assert!(error.error.contains("failed to parse results"));
            assert_eq!(error.code.as_deref(), Some("parse_failure"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(store.result_count("office-1").expect("count"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_stderr_terminates_without_waiting() {
    let store = store();
    let started = Instant::now();
    let (summary, messages) = run_collecting(
        job(
            &store,
            MeasurementRequest::new("office-1"),
            shell("echo 'Cannot open socket: Operation not permitted' >&2; sleep 30"),
        ),
        supervisor(60),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(matches!(
        summary.outcome,
        RunOutcome::Failed(MeasurementError::SocketError { .. })
    ));
    let errors = messages
        .iter()
        .filter(|message| matches!(message, StreamMessage::Error(_)))
        .count();
    assert_eq!(errors, 1);
    assert_eq!(store.result_count("office-1").expect("count"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fatal_stderr_after_invalid_utf8_is_still_classified() {
    let store = store();
    let started = Instant::now();
    let (summary, messages) = run_collecting(
        job(
            &store,
            MeasurementRequest::new("office-1"),
            shell(
                "printf 'warn \\377\\n' >&2; \
                 echo 'Cannot open socket: Operation not permitted' >&2; sleep 30",
            ),
        ),
        supervisor(60),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());
    assert!(
        matches!(
            summary.outcome,
            RunOutcome::Failed(MeasurementError::SocketError { .. })
        ),
        "{:?}",
        summary.outcome
    );
    assert!(matches!(
        messages.last(),
        Some(StreamMessage::Error(error)) if error.code.as_deref() == Some("socket_error")
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn result_after_fatal_stderr_is_discarded() {
    let store = store();
    // The tool ignores SIGTERM and still prints a full result after failing.
    let script = format!(
        "trap '' TERM; echo 'Network is unreachable' >&2; sleep 0.3; echo '{RESULT_LINE}'"
    );
    let (summary, messages) = run_collecting(
        job(&store, MeasurementRequest::new("office-1"), shell(&script)),
        supervisor(30),
    )
    .await;

    assert!(
        matches!(
            summary.outcome,
            RunOutcome::Failed(MeasurementError::NetworkUnavailable { .. })
        ),
        "{:?}",
        summary.outcome
    );
    assert_eq!(messages.iter().filter(|message| message.is_terminal()).count(), 1);
    assert!(!messages
        .iter()
        .any(|message| matches!(message, StreamMessage::Result(_))));
    assert_eq!(store.result_count("office-1").expect("count"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn result_after_timeout_is_discarded() {
    let store = store();
    let script = format!("trap '' TERM; sleep 2; echo '{RESULT_LINE}'");
    // The grace period outlasts the tool, so it exits on its own after the deadline.
    let supervisor = ProcessSupervisor::new(Duration::from_secs(1), Duration::from_secs(4));
    let (summary, messages) = run_collecting(
        job(&store, MeasurementRequest::new("office-1"), shell(&script)),
        supervisor,
    )
    .await;

    assert_eq!(
        summary.outcome,
        RunOutcome::Failed(MeasurementError::Timeout { secs: 1 })
    );
    assert_eq!(summary.exit_code, Some(0));
    assert_eq!(messages.iter().filter(|message| message.is_terminal()).count(), 1);
    assert!(matches!(messages.last(), Some(StreamMessage::Error(_))));
    assert_eq!(store.result_count("office-1").expect("count"), 0);
}

/// A sink whose writes take a while, recording when the write ran.
struct SlowSink {
    store: Arc<SpeedwatchStore>,
    delay: Duration,
    window: Mutex<Option<(Instant, Instant)>>,
}

impl ResultSink for SlowSink {
    fn create_result(&self, result: &MeasurementResult) -> Result<bool, StorageError> {
        let started = Instant::now();
        std::thread::sleep(self.delay);
        let saved = self.store.create_result(result);
        *self.window.lock().expect("window lock") = Some((started, Instant::now()));
        saved
    }
}

// Single-threaded runtime: a write on the worker would freeze every other task.
#[tokio::test]
async fn slow_result_write_does_not_stall_the_runtime() {
    let store = store();
    let sink = Arc::new(SlowSink {
        store: store.clone(),
        delay: Duration::from_millis(400),
        window: Mutex::new(None),
    });
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let ticker = {
        let ticks = ticks.clone();
        tokio::spawn(async move {
            loop {
                ticks.lock().expect("ticks lock").push(Instant::now());
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let job = MeasurementJob {
        request: MeasurementRequest::new("office-1"),
        office: common::office(),
        invocation: shell(&happy_script()),
        catalog: Arc::new(IdentityCatalog::default()),
        sink: sink.clone(),
    };
    let (summary, messages) = run_collecting(job, supervisor(30)).await;
    ticker.abort();

    assert_eq!(summary.outcome, RunOutcome::Completed { saved: true });
    assert!(matches!(messages.last(), Some(StreamMessage::Result(_))));
    assert_eq!(store.result_count("office-1").expect("count"), 1);

    let (started, finished) = sink
        .window
        .lock()
        .expect("window lock")
        .expect("write happened");
    let ticks = ticks.lock().expect("ticks lock");
    assert!(
        ticks.iter().any(|tick| *tick > started && *tick < finished),
        "no task ran during the {:?} write",
        finished - started
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn protocol_noise_does_not_stop_the_run() {
    let store = store();
    let script = format!(
        "echo 'Timeout occurred in connect.' >&2; echo 'Latency test failed' >&2; {}",
        happy_script()
    );
    let (summary, messages) = run_collecting(
        job(&store, MeasurementRequest::new("office-1"), shell(&script)),
        supervisor(30),
    )
    .await;

    assert_eq!(summary.outcome, RunOutcome::Completed { saved: true });
    assert!(matches!(messages.last(), Some(StreamMessage::Result(_))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nonzero_exit_is_reported_as_retryable_tool_error() {
    let store = store();
    let (summary, messages) = run_collecting(
        job(&store, MeasurementRequest::new("office-1"), shell("exit 3")),
        supervisor(30),
    )
    .await;

    assert_eq!(summary.exit_code, Some(3));
    match messages.last() {
        Some(StreamMessage::Error(error)) => {
            assert!(error.error.contains("exited with code 3"));
            assert_eq!(error.retryable, Some(true));
        }
        other => panic!("expected error, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_tool_binary_reports_spawn_failure() {
    let store = store();
    let invocation = ToolInvocation {
        program: "/nonexistent/speedtest".to_string(),
        args: Vec::new(),
    };
    let (summary, messages) = run_collecting(
        job(&store, MeasurementRequest::new("office-1"), invocation),
        supervisor(30),
    )
    .await;

    assert!(matches!(
        summary.outcome,
        RunOutcome::Failed(MeasurementError::Spawn { .. })
    ));
    assert_eq!(messages.len(), 2);
    assert!(matches!(messages[1], StreamMessage::Error(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_tool_is_killed_at_the_deadline() {
    let store = store();
    let started = Instant::now();
    let (summary, messages) = run_collecting(
        job(
            &store,
            MeasurementRequest::new("office-1"),
            shell("trap '' TERM; sleep 30"),
        ),
        supervisor(1),
    )
    .await;

    // 1s timeout + 1s grace, plus scheduling slack.
    assert!(started.elapsed() < Duration::from_secs(8), "{:?}", started.elapsed());
    assert_eq!(
        summary.outcome,
        RunOutcome::Failed(MeasurementError::Timeout { secs: 1 })
    );
    let errors = messages
        .iter()
        .filter_map(|message| match message {
            StreamMessage::Error(error) => Some(error.clone()),
            _ => None,
        })
        .collect::<Vec<_>>();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].error.contains("timed out"));
    assert_eq!(store.result_count("office-1").expect("count"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn observer_disconnect_kills_the_tool() {
    let store = store();
    let (transport, mut receiver) = stream_channel(64 * 1024);
    let started = Instant::now();
    let run = tokio::spawn(run_measurement(
        job(
            &store,
            MeasurementRequest::new("office-1"),
            shell(&format!("sleep 30; {}", happy_script())),
        ),
        supervisor(60),
        transport,
    ));

    let first = receiver.recv().await.expect("initial frame");
    assert!(!first.is_empty());
    drop(receiver);

    let summary = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run finished after disconnect")
        .expect("join");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(summary.outcome, RunOutcome::Abandoned);
    assert_eq!(store.result_count("office-1").expect("count"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_streams_output_then_exit() {
    let supervisor = supervisor(30);
    let mut handle = supervisor
        .start(&shell("printf 'one\\ntwo\\n'; echo warn >&2; exit 0"))
        .expect("spawn");
    assert!(handle.pid().is_some());

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut last = None;
    while let Some(event) = handle.next_event().await {
        match event {
            SupervisorEvent::Stdout(chunk) => stdout.extend_from_slice(&chunk),
            SupervisorEvent::Stderr(line) => stderr.push(line),
            other => last = Some(other),
        }
    }
    assert_eq!(String::from_utf8_lossy(&stdout), "one\ntwo\n");
    assert_eq!(stderr, vec!["warn".to_string()]);
    assert_eq!(last, Some(SupervisorEvent::Exited(Some(0))));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_kill_sends_term_promptly() {
    let supervisor = supervisor(60);
    let mut handle = supervisor.start(&shell("sleep 30")).expect("spawn");
    let started = Instant::now();
    handle.kill();
    handle.kill();

    let mut exit = None;
    while let Some(event) = handle.next_event().await {
        if let SupervisorEvent::Exited(code) = event {
            exit = Some(code);
        }
    }
    assert!(started.elapsed() < Duration::from_secs(5));
    // Terminated by a signal, so no exit code.
    assert_eq!(exit, Some(None));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn supervisor_decodes_non_utf8_stderr_lossily() {
    let supervisor = supervisor(30);
    let mut handle = supervisor
        .start(&shell("printf 'bad \\377 byte\\r\\nnext\\n' >&2"))
        .expect("spawn");

    let mut stderr = Vec::new();
    while let Some(event) = handle.next_event().await {
        if let SupervisorEvent::Stderr(line) = event {
            stderr.push(line);
        }
    }
    assert_eq!(stderr, vec!["bad \u{FFFD} byte".to_string(), "next".to_string()]);
}
