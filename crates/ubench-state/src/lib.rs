//! ubench-state — durable state shared between ubench invocations.
//!
//! Backed by [redb](https://docs.rs/redb). Two small databases live in the
//! state directory:
//!
//! - `instances.redb` holds the [`InstanceStore`]: one JSON document with
//!   the ordered list of every tracked instance, rewritten as a whole inside
//!   a single write transaction on each mutation.
//! - `discovery.redb` holds the [`DiscoveryRegistry`]: one row per logical
//!   service name pointing at its last known placement.
//!
//! Separate CLI processes coordinate only through these files. Each
//! operation opens the database, runs one transaction and closes it again,
//! so redb's exclusive file lock is held for a single read-modify-write and
//! never across a scheduler or network call.
//!
//! The API is blocking. While another process holds a database, a call
//! sleeps on the current thread for up to ten seconds before returning
//! [`StateError::Locked`]; async callers pay that on one runtime worker.

mod db;
pub mod error;
pub mod instances;
pub mod registry;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use instances::InstanceStore;
pub use registry::DiscoveryRegistry;
pub use types::*;
