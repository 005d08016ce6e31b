//! Recording of upstream responses

mod recorder;
mod tee;

pub use recorder::{Completion, Recorded, Recorder, RecordingSummary};
pub use tee::{CaptureBody, CaptureOutcome};
