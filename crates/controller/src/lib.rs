#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Reconciliation controllers for qualification runs.
//!
//! [`RunController`] expands a run into execution jobs and gates its deletion;
//! [`StatusSyncer`] propagates job state back into the run. Both run on the
//! work-queue runtime in [`runtime`] and are wired together by [`Manager`].

pub mod backoff;
pub mod builder;
pub mod config;
pub mod error;
pub mod manager;
pub mod resolver;
pub mod run_controller;
pub mod runtime;
pub mod status_sync;
pub mod store;

pub use config::ControllerConfig;
pub use error::{ReconcileError, StoreError};
pub use manager::Manager;
pub use run_controller::RunController;
pub use status_sync::StatusSyncer;
