//! Build execution for minici.
//!
//! - [`sink`]: the multi-destination log broadcaster every build writes to
//! - [`process`]: subprocess runner bound to a cancellation token and deadline
//! - [`source`]: workspace clone/update and the build command itself

pub mod error;
pub mod process;
pub mod sink;
pub mod source;

pub use error::StepError;
pub use process::{Interrupt, RunControl, StepCommand, run_step};
pub use sink::{LogDestination, LogSink, LogSubscription, SinkError};
pub use source::{BuildJob, execute_build, marker};
