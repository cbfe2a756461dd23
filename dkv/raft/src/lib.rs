// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Integration with the consensus library.
//!
//! The raft node replicates encoded [`dkv_kv::Command`] text and drives the
//! state machine in commit order; this crate supplies the pieces the library
//! needs from us: log storage, the state machine adapter over the shared
//! [`KvMap`], and the peer-to-peer transport.

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use openraft::{Config, SnapshotPolicy};

use dkv_kv::{ApplyOutcome, KvMap};

pub mod api;
mod log_store;
mod network;
mod state_machine;

pub use log_store::LogStore;
pub use network::HttpNetworkFactory;
pub use openraft::BasicNode;
pub use state_machine::StateMachineStore;

pub type NodeId = u64;

openraft::declare_raft_types!(
    /// Log entries carry the encoded command text; responses carry the apply outcome.
    pub TypeConfig:
        D = String,
        R = ApplyOutcome,
);

pub type Raft = openraft::Raft<TypeConfig>;

/// Build the consensus node: in-memory log, state machine bound to `kv`
/// (reloading the newest snapshot under `snapshot_dir` if one exists), and
/// the HTTP peer transport.
///
/// The returned node is passive until it is bootstrapped or contacted by a
/// leader; serve [`api::raft_router`] on the raft address before either.
pub async fn start(node_id: NodeId, kv: KvMap, snapshot_dir: &Path) -> anyhow::Result<Raft> {
    let config = Config {
        cluster_name: "dkv".to_string(),
        snapshot_policy: SnapshotPolicy::LogsSinceLast(5000),
        // The log is volatile anyway; a short tail is only kept so slightly
        // lagging followers catch up without a full snapshot transfer.
        max_in_snapshot_log_to_keep: 100,
        ..Default::default()
    };
    let config = Arc::new(config.validate()?);

    let log_store = LogStore::default();
    let state_machine = Arc::new(StateMachineStore::open(kv, snapshot_dir)?);
    let network = HttpNetworkFactory::new()?;

    let raft = openraft::Raft::new(node_id, config, network, log_store, state_machine).await?;
    Ok(raft)
}

/// Current leader view: `(address, id)` once both are known.
pub fn leader_with_id(raft: &Raft) -> Option<(String, NodeId)> {
    let metrics = raft.metrics().borrow().clone();
    let id = metrics.current_leader?;
    let node = metrics.membership_config.membership().get_node(&id)?;
    Some((node.addr.clone(), id))
}
