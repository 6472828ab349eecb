//! Infrastructure layer: queue stores, the enrichment controller and the
//! long-lived worker.

pub mod controller;
pub mod queue;
pub mod worker;

pub use controller::{Controller, ControllerConfig, ControllerError, InvocationReport};
pub use queue::{ControllerStore, InMemoryStore, PostgresStore};
pub use worker::{QueueWorker, WorkerConfig, WorkerExit, WorkerHandle};
