// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! In-memory key-value state machine core: the shared map, the replicated
//! command codec, and the snapshot codec.
//!
//! Everything in this crate is deterministic and free of I/O so that every
//! replica that applies the same command sequence ends up with the same map.

mod command;
pub mod snapshot;
mod store;

pub use command::{ApplyOutcome, Command, RESERVED_CHARS};
pub use snapshot::SnapshotError;
pub use store::KvMap;
