pub mod autopilot;
pub mod cache;
pub mod capture;
pub mod error;
pub mod fingerprint;
pub mod report;
pub mod session;
pub mod step;
pub mod tagged;

mod prompts;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use autopilot::{Autopilot, PlannerOutput, StepDelegate, SUCCESS_ACTION};
pub use cache::{cache_key, CacheEntry, ScreenFingerprint, StepCache};
pub use capture::{wait_for_stable, ScreenCapture, ScreenCapturer, StabilizeOptions};
pub use error::PilotError;
pub use fingerprint::{hierarchy_fingerprint, ImageFingerprint, SnapshotComparator};
pub use report::{AutoReport, AutoStepReport, Plan, Review, ReviewSection};
pub use session::{Pilot, Session};
pub use step::{AttemptError, PreviousStep, StepExecutor, StepOutcome, StepRequest};
pub use tagged::{find_tag, Outputs, OutputsMapping, NOT_AVAILABLE};
