//! Client side of the experiment: the schedule it walks, the identity it
//! carries, where trial payloads come from and where results go.

pub mod driver;
pub mod identity;
pub mod output;
pub mod schedule;
pub mod source;

pub use driver::{RunDriver, default_session_id, training_refs};
pub use identity::IdentityContext;
pub use output::{OutputWriter, RunOutputDir};
pub use schedule::{DicomNaming, RunSchedule, SessionSchedule};
pub use source::{ReplaySource, TrialPayload, TrialSource, WatchedFileSource};
