#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Outbound replication engine for Vellum: a background scheduler that ships
//! newly written documents and attachments to configured peer nodes.

/// Public API for the replication crate.
pub mod api;

mod batch;
mod destinations;
mod engine;
mod failure;
mod peer;
mod siblings;
mod worker;

pub use api::{
    failure_document_key, start_replication, DestinationFailureStats, ReplicationConfig,
    ReplicationHandle,
};
