#![allow(dead_code)]

use speedwatch_core::stream_protocol::SseFrameDecoder;
use speedwatch_core::{OfficeRecord, StreamMessage};
use speedwatch_hub::ToolInvocation;
use speedwatch_storage::SpeedwatchStore;
use std::sync::Arc;

pub const RESULT_LINE: &str = r#"{"type":"result","ping":{"jitter":1.2,"latency":13.9},"download":{"bandwidth":11400000,"bytes":120000000,"elapsed":10000},"upload":{"bandwidth":4837500,"bytes":50000000,"elapsed":10000},"packetLoss":0,"isp":"PLDT Inc.","interface":{"externalIp":"203.0.113.9"},"server":{"id":10493,"name":"Example Telco","location":"Manila","country":"Philippines"},"result":{"id":"abc","url":"https://www.speedtest.net/result/c/abc"}}"#;

pub fn office() -> OfficeRecord {
    OfficeRecord {
        id: "office-1".to_string(),
        name: "Makati".to_string(),
        isp_names: vec!["PLDT".to_string(), "Globe".to_string()],
        sections: vec!["Finance".to_string()],
    }
}

pub fn store() -> Arc<SpeedwatchStore> {
    let store = SpeedwatchStore::open_in_memory().expect("store");
    store.upsert_office(&office()).expect("office");
    Arc::new(store)
}

/// A fake measurement tool: `sh -c <script>`.
pub fn shell(script: &str) -> ToolInvocation {
    ToolInvocation {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
    }
}

/// Script printing a full happy-path run, one JSON object per line.
pub fn happy_script() -> String {
    let lines = [
        r#"{"type":"testStart","isp":"PLDT Inc.","server":{"id":10493,"name":"Example Telco"}}"#,
        r#"{"type":"ping","ping":{"jitter":0.8,"latency":14.2,"progress":0.5}}"#,
        r#"{"type":"ping","ping":{"jitter":1.2,"latency":13.9,"progress":1.0}}"#,
        r#"{"type":"download","download":{"bandwidth":10912500,"progress":0.45}}"#,
        r#"{"type":"download","download":{"bandwidth":11400000,"progress":1.0}}"#,
        r#"{"type":"upload","upload":{"bandwidth":-4.2e20,"progress":0.3}}"#,
        r#"{"type":"upload","upload":{"bandwidth":4837500,"progress":1.0}}"#,
        RESULT_LINE,
    ];
    lines
        .iter()
        .map(|line| format!("echo '{line}'"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub fn decode_all(bytes: &[u8]) -> Vec<StreamMessage> {
    let mut decoder = SseFrameDecoder::<StreamMessage>::default();
    let mut report = decoder.push_chunk(bytes);
    assert!(report.errors.is_empty(), "decode errors: {:?}", report.errors);
    report.frames.extend(decoder.finish().frames);
    report.frames
}

pub fn progress_values(messages: &[StreamMessage]) -> Vec<f64> {
    messages
        .iter()
        .filter_map(|message| match message {
            StreamMessage::Progress(progress) => Some(progress.progress),
            _ => None,
        })
        .collect()
}
