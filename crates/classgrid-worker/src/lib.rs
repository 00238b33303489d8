//! classgrid-worker: the processing side of the task queue.
//!
//! A [`WorkerLoop`] claims one task at a time, fetches its payload from the
//! input bucket, runs the [`Classifier`], writes the result artifact,
//! publishes a `TaskResult`, and only then acknowledges the task.
//!
//! Two fleets implement the autoscaler's `Provisioner` over worker loops:
//! [`LocalFleet`] runs them as tokio tasks in the current process,
//! [`ProcessFleet`] runs each as a `classgridd worker` child process.

pub mod classifier;
pub mod error;
pub mod local;
pub mod process;
pub mod worker;

pub use classifier::{Classifier, LookupClassifier, SharedClassifier};
pub use error::{CapabilityError, WorkerError};
pub use local::LocalFleet;
pub use process::ProcessFleet;
pub use worker::{WorkerLoop, WorkerSettings};
