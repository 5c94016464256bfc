use chrono::{DateTime, Utc};
use serde::Serialize;
use speedwatch_core::MeasurementRequest;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Process-wide set of running measurements. Diagnostics only: nothing
/// consults it before starting a measurement.
#[derive(Clone, Default)]
pub struct InFlightRegistry {
    inner: Arc<Mutex<BTreeMap<String, InFlightEntry>>>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InFlightEntry {
    pub request_id: String,
    pub office_id: String,
    pub started_at: DateTime<Utc>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the request until the returned guard is dropped.
    pub fn enter(&self, request: &MeasurementRequest) -> InFlightGuard {
        let entry = InFlightEntry {
            request_id: request.request_id.clone(),
            office_id: request.office_id.clone(),
            started_at: Utc::now(),
        };
        if let Ok(mut map) = self.inner.lock() {
            map.insert(entry.request_id.clone(), entry);
            debug!(event = "inflight_enter", request_id = %request.request_id, active = map.len());
        }
        InFlightGuard {
            registry: self.clone(),
            request_id: request.request_id.clone(),
        }
    }

    pub fn snapshot(&self) -> Vec<InFlightEntry> {
        self.inner
            .lock()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, request_id: &str) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(request_id);
            debug!(event = "inflight_exit", request_id = %request_id, active = map.len());
        }
    }
}

pub struct InFlightGuard {
    registry: InFlightRegistry,
    request_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}
