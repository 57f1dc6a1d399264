mod queue;
mod ring;

pub use queue::{Completion, Ioq, Job, JobKind, Output, SubmitError};
