//! The grid scan: planning, the result ledger, notifications, homing and the
//! orchestrating state machine.

pub mod events;
pub mod homing;
pub mod orchestrator;
pub mod plan;
pub mod record;

pub use events::{EventBus, ScanEvent, ScanState};
pub use orchestrator::{ScanHandle, ScanOrchestrator, ScanSummary};
pub use plan::{plan, GridPlan, Position};
pub use record::{CaptureResult, RecordEntry, ScanRecord};
