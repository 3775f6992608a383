// Execution
// Up-to-date checking, execution records, progress events, and the
// concurrent scheduler

pub mod check;
pub mod events;
pub mod record;
pub mod scheduler;

pub use check::{evaluate, CheckRequest, CheckState};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use record::{ExecRecord, InputSignature, RecordStore};
pub use scheduler::{RunSummary, Scheduler};
