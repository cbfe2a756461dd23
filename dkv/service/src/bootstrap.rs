// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! One-shot cluster bring-up, run once between binding the raft listener and
//! serving the public API. Failures here are fatal to the process; runtime
//! errors never are.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context};
use backoff::ExponentialBackoffBuilder;
use openraft::error::{InitializeError, RaftError};
use openraft::BasicNode;
use serde::Serialize;

use dkv_raft::{leader_with_id, NodeId, Raft};

#[derive(Debug, Serialize)]
struct JoinRequest<'a> {
    follower_id: String,
    follower_addr: &'a str,
}

/// Leader path: make sure the snapshot directory exists, initialize the
/// cluster with this node as the sole voter, and wait for it to win its own
/// election.
pub async fn bootstrap_leader(
    raft: &Raft,
    node_id: NodeId,
    raft_addr: &str,
    snapshot_dir: &Path,
    raft_timeout: Duration,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(snapshot_dir)
        .await
        .with_context(|| format!("creating snapshot directory {}", snapshot_dir.display()))?;

    let members = BTreeMap::from([(node_id, BasicNode::new(raft_addr))]);
    match raft.initialize(members).await {
        Ok(()) => {}
        // A node restarted on top of a retained snapshot already has a
        // configuration; it only needs to win the election again.
        Err(RaftError::APIError(InitializeError::NotAllowed(_))) => {
            tracing::info!("cluster already initialized, skipping bootstrap");
        }
        Err(other) => return Err(other).context("initializing single-node cluster"),
    }

    let (addr, id) = backoff::future::retry_notify(
        retry_policy(raft_timeout),
        || async {
            leader_with_id(raft).ok_or_else(|| backoff::Error::transient(anyhow!("no leader yet")))
        },
        |err, wait: Duration| tracing::debug!(?wait, "election pending: {err}"),
    )
    .await
    .context("waiting for self-election")?;

    tracing::info!(leader_id = id, leader_addr = %addr, "leader elected");
    Ok(())
}

/// Follower path: announce ourselves to the leader's public endpoint until
/// it accepts the registration. Registration is idempotent on the leader, so
/// retrying after an ambiguous failure is safe.
pub async fn join_leader(
    join_addr: &str,
    node_id: NodeId,
    raft_addr: &str,
    raft_timeout: Duration,
) -> anyhow::Result<()> {
    let client = reqwest::Client::new();
    let url = format!("http://{join_addr}/register-follower");
    let body = JoinRequest {
        follower_id: node_id.to_string(),
        follower_addr: raft_addr,
    };

    backoff::future::retry_notify(
        retry_policy(raft_timeout),
        || async {
            let resp = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(|e| backoff::Error::transient(anyhow!(e)))?;
            if resp.status() == reqwest::StatusCode::OK {
                Ok(())
            } else {
                Err(backoff::Error::transient(anyhow!(
                    "leader answered {}",
                    resp.status()
                )))
            }
        },
        |err, wait: Duration| tracing::debug!(?wait, "join attempt failed: {err}"),
    )
    .await
    .with_context(|| format!("joining leader at {join_addr}"))?;

    tracing::info!(%url, "registered with the leader");
    Ok(())
}

fn retry_policy(max_elapsed: Duration) -> backoff::ExponentialBackoff {
    ExponentialBackoffBuilder::new()
        .with_max_elapsed_time(Some(max_elapsed))
        .build()
}
