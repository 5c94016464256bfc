use chrono::Utc;
use speedwatch_core::identity::RecordedIdentityInputs;
use speedwatch_core::{
    IdentityCatalog, MeasurementError, MeasurementRequest, MeasurementResult, OfficeRecord,
    ShapedResult, ValidationMode, UNKNOWN_IDENTITY,
};
use speedwatch_storage::{ResultSink, StorageError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq)]
pub struct SaveOutcome {
    pub saved: bool,
    pub result: Option<MeasurementResult>,
}

impl SaveOutcome {
    fn skipped() -> Self {
        Self {
            saved: false,
            result: None,
        }
    }
}

/// First-writer-wins guard for one measurement request.
pub struct PersistenceGuard {
    request: MeasurementRequest,
    office: OfficeRecord,
    catalog: Arc<IdentityCatalog>,
    sink: Arc<dyn ResultSink>,
    latch: AtomicBool,
}

impl PersistenceGuard {
    pub fn new(
        request: MeasurementRequest,
        office: OfficeRecord,
        catalog: Arc<IdentityCatalog>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            request,
            office,
            catalog,
            sink,
            latch: AtomicBool::new(false),
        }
    }

    pub fn is_latched(&self) -> bool {
        self.latch.load(Ordering::SeqCst)
    }

    /// Writes the record unless a terminal event was already accepted for this
    /// request. `detected_fallback` is the identity seen earlier in the stream,
    /// used when the result object does not carry one.
    pub fn try_save(
        &self,
        shaped: ShapedResult,
        detected_fallback: Option<&str>,
    ) -> Result<SaveOutcome, StorageError> {
        if self
            .latch
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!(
                event = "duplicate_completion",
                code = MeasurementError::DuplicateCompletion.code(),
                request_id = %self.request.request_id,
                office_id = %self.request.office_id
            );
            return Ok(SaveOutcome::skipped());
        }

        let detected = shaped
            .detected_isp
            .clone()
            .or_else(|| detected_fallback.map(str::to_string));
        let isp_name = self.catalog.resolve_recorded(&RecordedIdentityInputs {
            claimed: self.request.claimed_isp.as_deref(),
            claimed_validated: self.request.isp_validated,
            tool_detected: detected.as_deref(),
            office_default: self.office.default_isp(),
        });
        let isp_validation = self.request.claimed_isp.as_deref().map(|claimed| {
            self.catalog.validate(
                claimed,
                detected.as_deref().unwrap_or(UNKNOWN_IDENTITY),
                ValidationMode::Relaxed,
            )
        });

        let result = MeasurementResult::from_shaped(
            &self.request,
            shaped,
            isp_name,
            isp_validation,
            Utc::now(),
        );
        let saved = self.sink.create_result(&result)?;
        if saved {
            info!(
                event = "result_saved",
                request_id = %result.request_id,
                office_id = %result.office_id,
                isp = %result.isp_name,
                download_mbps = result.download_mbps,
                upload_mbps = result.upload_mbps
            );
        } else {
            info!(
                event = "duplicate_completion",
                code = MeasurementError::DuplicateCompletion.code(),
                request_id = %result.request_id,
                source = "store"
            );
        }
        Ok(SaveOutcome {
            saved,
            result: Some(result),
        })
    }
}
