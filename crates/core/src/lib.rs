#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Shared models and pure logic for qualification runs.
//!
//! Everything in this crate is deterministic and free of I/O: the object
//! model, job naming and hashing, aggregate conditions, and the status merge
//! rule used by both controllers.

pub mod condition;
pub mod merge;
pub mod meta;
pub mod model;
pub mod naming;

mod util;

pub use meta::{ObjectKey, ObjectMeta, Resource};
pub use util::{new_ulid, now_ms};
