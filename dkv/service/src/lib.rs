// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! The admission layer: validation, leader gating, and the operations the
//! HTTP surface exposes. All conflict rules (create-only SET, DEL of present
//! keys) are decided here, before a command is handed to consensus.

use std::collections::BTreeSet;
use std::time::Duration;

use openraft::error::{ClientWriteError, RaftError};
use openraft::{BasicNode, ChangeMembers, ServerState};
use tokio::time::timeout;

use dkv_kv::{ApplyOutcome, Command, KvMap, RESERVED_CHARS};
use dkv_raft::{NodeId, Raft};

pub mod bootstrap;

/// Admission limits and the deadline on any single consensus operation.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub key_max_len: usize,
    pub val_max_len: usize,
    pub max_map_size: usize,
    pub raft_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            key_max_len: 100,
            val_max_len: 200,
            max_map_size: 1000,
            raft_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid key: {0}")]
    InvalidKey(&'static str),
    #[error("invalid value: {0}")]
    InvalidValue(&'static str),
    #[error("max keys exceeded")]
    MapFull,
    #[error("key not found")]
    NotFound,
    #[error("key already exists")]
    AlreadyExists,
    #[error("not the leader; writes go to node {0}")]
    NotLeader(NodeId),
    #[error("leader not ready")]
    LeaderNotReady,
    #[error("no leader in the cluster")]
    NoLeader,
    #[error("consensus failure: {0}")]
    Consensus(String),
}

/// The key-value service served by every node.
///
/// Reads come straight from the local map. Writes are admitted under the
/// write lock, which stays held across the consensus round-trip so the
/// pre-checks (key presence, map size) cannot be invalidated by another
/// local writer before the command commits. The map's own mutex remains
/// free for the apply callback, so holding the write lock here cannot
/// deadlock the commit path.
pub struct KvService {
    kv: KvMap,
    raft: Option<Raft>,
    config: ServiceConfig,
    write_lock: tokio::sync::Mutex<()>,
}

impl KvService {
    pub fn new(kv: KvMap, raft: Raft, config: ServiceConfig) -> Self {
        Self {
            kv,
            raft: Some(raft),
            config,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// A service that mutates the map directly, skipping consensus entirely.
    /// Single-process test mode; snapshots taken in this mode must not feed a
    /// replicated deployment.
    pub fn debug(kv: KvMap, config: ServiceConfig) -> Self {
        Self {
            kv,
            raft: None,
            config,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Read from the node-local map. Followers may serve stale values; that
    /// is the documented contract.
    pub fn get(&self, key: &str) -> Result<String, ServiceError> {
        self.validate_key(key)?;
        self.kv.get(key).ok_or(ServiceError::NotFound)
    }

    /// Create `key`, failing if it already exists anywhere in the map.
    pub async fn set(&self, key: &str, val: &str) -> Result<(), ServiceError> {
        self.validate_key(key)?;
        self.validate_val(val)?;
        let _admission = self.write_lock.lock().await;
        self.ensure_leader()?;
        if self.kv.len() >= self.config.max_map_size {
            return Err(ServiceError::MapFull);
        }
        if self.kv.contains(key) {
            return Err(ServiceError::AlreadyExists);
        }
        self.submit(Command::Set {
            key: key.to_string(),
            val: val.to_string(),
        })
        .await
    }

    /// Delete `key`, failing if it is absent.
    pub async fn delete(&self, key: &str) -> Result<(), ServiceError> {
        self.validate_key(key)?;
        let _admission = self.write_lock.lock().await;
        self.ensure_leader()?;
        if !self.kv.contains(key) {
            return Err(ServiceError::NotFound);
        }
        self.submit(Command::Del {
            key: key.to_string(),
        })
        .await
    }

    /// Add a follower to the voter set. Re-registering a member whose
    /// `(id, addr)` already appears verbatim succeeds without touching the
    /// configuration, which is what makes the follower's retry loop safe.
    pub async fn register_follower(&self, id: NodeId, addr: &str) -> Result<(), ServiceError> {
        let Some(raft) = &self.raft else {
            return Err(ServiceError::Consensus(
                "no consensus node in debug mode".to_string(),
            ));
        };
        let metrics = raft.metrics().borrow().clone();
        if metrics.current_leader.is_none() {
            return Err(ServiceError::NoLeader);
        }
        let registered = metrics
            .membership_config
            .membership()
            .nodes()
            .any(|(node_id, node)| *node_id == id && node.addr == addr);
        if registered {
            tracing::info!(follower = id, %addr, "follower already registered");
            return Ok(());
        }

        timeout(
            self.config.raft_timeout,
            raft.add_learner(id, BasicNode::new(addr), true),
        )
        .await
        .map_err(|_| ServiceError::Consensus("add-learner timed out".to_string()))?
        .map_err(client_write_error)?;

        timeout(
            self.config.raft_timeout,
            raft.change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([id])), false),
        )
        .await
        .map_err(|_| ServiceError::Consensus("membership change timed out".to_string()))?
        .map_err(client_write_error)?;

        tracing::info!(follower = id, %addr, "follower promoted to voter");
        Ok(())
    }

    /// The members of the current configuration, `(id, address)` pairs.
    pub fn members(&self) -> Vec<(NodeId, String)> {
        match &self.raft {
            None => Vec::new(),
            Some(raft) => {
                let metrics = raft.metrics().borrow().clone();
                let membership = metrics.membership_config.membership().clone();
                membership
                    .nodes()
                    .map(|(id, node)| (*id, node.addr.clone()))
                    .collect()
            }
        }
    }

    /// Hand an admitted command to consensus (or, in debug mode, straight to
    /// the map) and wait for the applied outcome.
    async fn submit(&self, cmd: Command) -> Result<(), ServiceError> {
        tracing::debug!(key = cmd.key(), "admitted command");
        let Some(raft) = &self.raft else {
            self.kv.apply(&cmd);
            return Ok(());
        };

        let resp = match timeout(self.config.raft_timeout, raft.client_write(cmd.encode())).await {
            Err(_) => return Err(ServiceError::Consensus("apply timed out".to_string())),
            Ok(Err(e)) => return Err(client_write_error(e)),
            Ok(Ok(resp)) => resp,
        };
        match resp.data {
            ApplyOutcome::Applied => Ok(()),
            ApplyOutcome::UnknownCommand => Err(ServiceError::Consensus(
                "state machine did not recognize the command".to_string(),
            )),
        }
    }

    /// Leadership is checked at admission, before the per-key pre-checks;
    /// losing it between this check and the submission is resolved by the
    /// consensus layer failing the write, which [`client_write_error`] maps
    /// back to the same error kinds. Debug mode has no leader to gate on.
    fn ensure_leader(&self) -> Result<(), ServiceError> {
        let Some(raft) = &self.raft else {
            return Ok(());
        };
        let metrics = raft.metrics().borrow().clone();
        if metrics.state == ServerState::Leader {
            return Ok(());
        }
        match metrics.current_leader {
            Some(leader) => Err(ServiceError::NotLeader(leader)),
            None => Err(ServiceError::LeaderNotReady),
        }
    }

    fn validate_key(&self, key: &str) -> Result<(), ServiceError> {
        if key.is_empty() {
            return Err(ServiceError::InvalidKey("key must not be empty"));
        }
        if key.len() > self.config.key_max_len {
            return Err(ServiceError::InvalidKey("key size exceeded"));
        }
        if key.contains(&RESERVED_CHARS[..]) {
            return Err(ServiceError::InvalidKey("key contains a reserved character"));
        }
        Ok(())
    }

    fn validate_val(&self, val: &str) -> Result<(), ServiceError> {
        if val.len() > self.config.val_max_len {
            return Err(ServiceError::InvalidValue("value size exceeded"));
        }
        if val.contains(&RESERVED_CHARS[..]) {
            return Err(ServiceError::InvalidValue(
                "value contains a reserved character",
            ));
        }
        Ok(())
    }
}

fn client_write_error(
    err: RaftError<NodeId, ClientWriteError<NodeId, BasicNode>>,
) -> ServiceError {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => {
            match forward.leader_id {
                Some(leader) => ServiceError::NotLeader(leader),
                None => ServiceError::LeaderNotReady,
            }
        }
        other => ServiceError::Consensus(other.to_string()),
    }
}
