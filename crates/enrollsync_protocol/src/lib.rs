//! # enrollsync Protocol
//!
//! Wire types and JSON codecs for the enrollsync offline sync engine.
//!
//! This crate provides:
//! - `BatchItem` and `Operation` for outgoing local changes
//! - `SyncMapping` and `Conflict` for the remote system's verdicts
//! - Submission and job-status messages (synchronous and deferred replies)
//! - JSON encoding/decoding with camelCase keys
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod item;
mod mapping;
mod messages;

pub use error::{ProtocolError, ProtocolResult};
pub use item::{BatchItem, Operation, BOOKKEEPING_FIELDS};
pub use mapping::{Conflict, SyncMapping};
pub use messages::{
    JobState, JobStatusResponse, SubmitReply, SubmitRequest, SubmitResponse, SyncJobTicket,
};
