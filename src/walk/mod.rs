mod ancestry;
mod bftw;
mod options;
mod record;
#[cfg(test)]
mod walk_tests;

pub use bftw::walk;
pub use options::{LinkMode, MountMode, SortOrder, WalkBuilder, WalkOptions, XdevPrune};
pub use record::{Visit, WalkAction, WalkOutcome};
