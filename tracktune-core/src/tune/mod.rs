//! Trial driver: trials, reporting sessions, the tuner and its analysis.

pub mod analysis;
pub mod runner;
pub mod session;
pub mod trial;

pub use analysis::{ExperimentAnalysis, Mode, ResultRow};
pub use runner::{Trainable, Tuner};
pub use session::TrialSession;
pub use trial::{Trial, TrialResult, TrialStatus};
