pub mod config;
pub mod detector;
pub mod http;
pub mod logging;
pub mod measurement;
pub mod persistence;
pub mod registry;
pub mod supervisor;
pub mod transport;

pub use config::{load_config, Config, ToolConfig, ToolInvocation};
pub use detector::{HttpIdentityDetector, IdentityDetector};
pub use http::{router, AppState};
pub use measurement::{run_measurement, MeasurementJob, RunOutcome, RunSummary};
pub use persistence::{PersistenceGuard, SaveOutcome};
pub use registry::InFlightRegistry;
pub use supervisor::{ProcessSupervisor, SupervisorEvent, SupervisorHandle};
pub use transport::{stream_channel, StreamReceiver, StreamTransport};
