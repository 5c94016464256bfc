use crate::tool_events::ToolProgress;
use crate::Phase;

/// One normalised step on the 0-100 scale.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressEvent {
    pub phase: Phase,
    pub progress: f64,
    pub download: f64,
    pub upload: f64,
    pub ping: f64,
}

/// Overall-scale range owned by each phase. Neighbouring ranges overlap.
pub fn phase_range(phase: Phase) -> (f64, f64) {
    match phase {
        Phase::Connecting => (0.0, 25.0),
        Phase::Ping => (5.0, 30.0),
        Phase::Download => (20.0, 70.0),
        Phase::Upload => (60.0, 95.0),
        Phase::Complete => (100.0, 100.0),
    }
}

/// Linear map of a 0-1 phase fraction into the phase's range, one decimal.
pub fn scale_fraction(phase: Phase, fraction: f64) -> f64 {
    let (low, high) = phase_range(phase);
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    ((low + fraction * (high - low)) * 10.0).round() / 10.0
}

/// Never reports less progress, or an earlier phase, than already shown.
#[derive(Debug, Clone, Default)]
pub struct MonotonicClamp {
    phase: Phase,
    floor: f64,
}

impl MonotonicClamp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, phase: Phase, progress: f64) -> (Phase, f64) {
        let progress = if progress.is_finite() {
            progress.clamp(0.0, 100.0)
        } else {
            0.0
        };
        self.phase = self.phase.max(phase);
        self.floor = self.floor.max(progress);
        (self.phase, self.floor)
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn floor(&self) -> f64 {
        self.floor
    }
}

/// Per-request translation of tool progress into [`ProgressEvent`]s.
///
/// Keeps the latest throughput and latency figures so every emitted event
/// carries a full snapshot, and goes silent once [`complete`](Self::complete)
/// has been called.
#[derive(Debug, Clone, Default)]
pub struct ProgressNormalizer {
    clamp: MonotonicClamp,
    download: f64,
    upload: f64,
    ping: f64,
    completed: bool,
}

impl ProgressNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The event sent as soon as the stream opens.
    pub fn initial(&mut self) -> Option<ProgressEvent> {
        if self.completed {
            return None;
        }
        Some(self.snapshot(Phase::Connecting, 0.0))
    }

    pub fn observe(&mut self, progress: &ToolProgress) -> Option<ProgressEvent> {
        if self.completed {
            return None;
        }
        if let Some(download) = progress.download_mbps {
            self.download = download;
        }
        if let Some(upload) = progress.upload_mbps {
            self.upload = upload;
        }
        if let Some(latency) = progress.latency_ms {
            self.ping = latency;
        }
        let overall = scale_fraction(progress.phase, progress.fraction);
        Some(self.snapshot(progress.phase, overall))
    }

    /// Latches completion. Returns the final event only the first time.
    pub fn complete(&mut self) -> Option<ProgressEvent> {
        if self.completed {
            return None;
        }
        let event = self.snapshot(Phase::Complete, 100.0);
        self.completed = true;
        Some(event)
    }

    fn snapshot(&mut self, phase: Phase, overall: f64) -> ProgressEvent {
        let (phase, progress) = self.clamp.apply(phase, overall);
        ProgressEvent {
            phase,
            progress,
            download: self.download,
            upload: self.upload,
            ping: self.ping,
        }
    }
}
