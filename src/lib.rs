//! cli-crew — parallel execution of external command-line programs.
//!
//! A fixed-size crew of workers drains a (possibly infinite) input sequence,
//! runs each item through either an arbitrary work function or a CLI
//! controller, and yields results lazily in completion order. When any item
//! fails, or the caller walks away from the result stream, every worker is
//! quiesced and every registered child-process tree is killed before the
//! error surfaces.

pub mod controller;
pub mod kill;
pub mod label;
pub mod pool;
pub mod scope;

mod control;
mod worker;

pub use controller::{
    CallerOpts, CommandFailed, CommandLineCaller, CommandTemplate, GenericCliController,
    OptionValue, PidPublisher,
};
pub use label::{FailureKind, Label, LabelError, Labeled, Reapply, WorkerFailure};
pub use pool::{LabeledPoolStream, PoolError, PoolManager, PoolStream};
pub use scope::{CleanupError, ScopedResourceStack, TempContents};
