use crate::consumer::{ConsumerState, Failure, StreamConsumer};

const BAR_WIDTH: usize = 24;

/// One status line, redrawn in place while the run is live.
pub fn progress_line(consumer: &StreamConsumer) -> String {
    let progress = consumer.progress().clamp(0.0, 100.0);
    let filled = ((progress / 100.0) * BAR_WIDTH as f64).round() as usize;
    let figures = consumer.figures();
    format!(
        "[{}{}] {:>5.1}% {:<10} down {:>8.2} Mbps  up {:>8.2} Mbps  ping {:>6.1} ms",
        "#".repeat(filled.min(BAR_WIDTH)),
        "-".repeat(BAR_WIDTH - filled.min(BAR_WIDTH)),
        progress,
        consumer.state().as_str(),
        figures.download,
        figures.upload,
        figures.ping,
    )
}

pub fn summary(consumer: &StreamConsumer) -> String {
    match consumer.state() {
        ConsumerState::Complete => match consumer.result() {
            Some(result) => {
                let mut lines = vec![
                    format!("provider: {}", result.isp_name),
                    format!("download: {:.2} Mbps", result.download),
                    format!("upload:   {:.2} Mbps", result.upload),
                    format!(
                        "ping:     {:.1} ms (jitter {:.1} ms, loss {:.1}%)",
                        result.ping, result.jitter, result.packet_loss
                    ),
                ];
                if let Some(server) = result.server_name.as_deref().or(result.server_id.as_deref()) {
                    lines.push(format!("server:   {server}"));
                }
                if let Some(url) = &result.result_url {
                    lines.push(format!("result:   {url}"));
                }
                lines.join("\n")
            }
            None => "complete".to_string(),
        },
        ConsumerState::Cancelled => "measurement cancelled".to_string(),
        ConsumerState::Errored => match consumer.failure() {
            Some(Failure::IdentityMismatch {
                claimed,
                detected,
                alternative,
                ..
            }) => {
                let mut text = format!(
                    "provider mismatch: you selected {claimed} but this connection belongs to {detected}"
                );
                match alternative {
                    Some(alternative) => text.push_str(&format!(
                        "\nre-run with --isp \"{alternative}\" or pass --accept-detected to use it"
                    )),
                    None => text.push_str("\nselect the provider manually and re-run"),
                }
                text
            }
            Some(Failure::Hub {
                message, retryable, ..
            }) if *retryable => format!("error: {message} (retry later)"),
            Some(failure) => format!("error: {}", failure.message()),
            None => "error".to_string(),
        },
        state => format!("stopped while {state}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ConsumerEvent;
    use speedwatch_core::stream_protocol::ProgressPayload;
    use speedwatch_core::{Phase, StreamMessage};

    #[test]
    fn bar_tracks_progress() {
        let mut consumer = StreamConsumer::new();
        assert!(progress_line(&consumer).starts_with(&format!("[{}]", "-".repeat(BAR_WIDTH))));
        consumer.reduce(ConsumerEvent::Message(StreamMessage::Progress(ProgressPayload {
            stage: Phase::Download,
            progress: 50.0,
            download: 87.3,
            upload: 0.0,
            ping: 14.2,
        })));
        let line = progress_line(&consumer);
        assert!(line.starts_with(&format!("[{}{}]", "#".repeat(12), "-".repeat(12))), "{line}");
        assert!(line.contains("download"));
        assert!(line.contains("87.30 Mbps"));
    }

    #[test]
    fn mismatch_summary_offers_alternative() {
        let mut consumer = StreamConsumer::new();
        consumer.reduce(ConsumerEvent::Failed(Failure::IdentityMismatch {
            claimed: "PLDT".to_string(),
            detected: "Globe".to_string(),
            message: "provider mismatch".to_string(),
            alternative: Some("Globe".to_string()),
        }));
        let text = summary(&consumer);
        assert!(text.contains("you selected PLDT"));
        assert!(text.contains("--accept-detected"));
    }
}
