// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

//! Service behavior against real consensus groups.

use std::net::TcpListener;
use std::path::Path;
use std::time::Duration;

use dkv_kv::KvMap;
use dkv_raft::{NodeId, Raft};
use dkv_service::{bootstrap, KvService, ServiceConfig, ServiceError};

const LEADER_ID: NodeId = 1;
const FOLLOWER_ID: NodeId = 2;

fn config() -> ServiceConfig {
    ServiceConfig {
        raft_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

/// Bind the node's raft listener on an ephemeral port and return the address
/// peers reach it under.
fn serve_raft(raft: &Raft) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let server = axum::Server::from_tcp(listener)
        .unwrap()
        .serve(dkv_raft::api::raft_router(raft.clone()).into_make_service());
    tokio::spawn(server);
    addr.to_string()
}

async fn leader_service(dir: &Path, raft_addr: &str) -> KvService {
    let kv = KvMap::new();
    let raft = dkv_raft::start(LEADER_ID, kv.clone(), dir).await.unwrap();
    bootstrap::bootstrap_leader(&raft, LEADER_ID, raft_addr, dir, Duration::from_secs(5))
        .await
        .unwrap();
    KvService::new(kv, raft, config())
}

#[tokio::test]
async fn writes_flow_through_consensus_on_the_leader() {
    let dir = tempfile::tempdir().unwrap();
    let svc = leader_service(dir.path(), "127.0.0.1:24101").await;

    svc.set("a", "b").await.unwrap();
    assert_eq!(svc.get("a").unwrap(), "b");

    assert!(matches!(
        svc.set("a", "c").await,
        Err(ServiceError::AlreadyExists)
    ));

    svc.delete("a").await.unwrap();
    assert!(matches!(svc.get("a"), Err(ServiceError::NotFound)));
}

#[tokio::test]
async fn a_new_follower_is_added_exactly_once_no_matter_how_often_it_registers() {
    let leader_dir = tempfile::tempdir().unwrap();
    let follower_dir = tempfile::tempdir().unwrap();

    let leader_kv = KvMap::new();
    let leader_raft = dkv_raft::start(LEADER_ID, leader_kv.clone(), leader_dir.path())
        .await
        .unwrap();
    let leader_addr = serve_raft(&leader_raft);

    let follower_kv = KvMap::new();
    let follower_raft = dkv_raft::start(FOLLOWER_ID, follower_kv.clone(), follower_dir.path())
        .await
        .unwrap();
    let follower_addr = serve_raft(&follower_raft);

    bootstrap::bootstrap_leader(
        &leader_raft,
        LEADER_ID,
        &leader_addr,
        leader_dir.path(),
        Duration::from_secs(5),
    )
    .await
    .unwrap();
    let svc = KvService::new(leader_kv, leader_raft, config());

    // The first call walks the full add-learner/promote-to-voter path; the
    // retried call finds the pair in the configuration and changes nothing.
    svc.register_follower(FOLLOWER_ID, &follower_addr)
        .await
        .unwrap();
    svc.register_follower(FOLLOWER_ID, &follower_addr)
        .await
        .unwrap();

    let members = svc.members();
    assert_eq!(members.len(), 2);
    assert_eq!(
        members.iter().filter(|(id, _)| *id == FOLLOWER_ID).count(),
        1
    );
    assert!(members.contains(&(FOLLOWER_ID, follower_addr.clone())));

    // Committing now takes the follower's acknowledgement, and the applied
    // write shows up in its map.
    svc.set("a", "b").await.unwrap();
    for _ in 0..100 {
        if follower_kv.get("a").is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(follower_kv.get("a"), Some("b".to_string()));
}

#[tokio::test]
async fn register_follower_is_idempotent_for_a_known_member() {
    let dir = tempfile::tempdir().unwrap();
    let raft_addr = "127.0.0.1:24102";
    let svc = leader_service(dir.path(), raft_addr).await;

    // The leader itself is already in the configuration under this exact
    // (id, addr) pair, so both calls short-circuit without a membership
    // change.
    svc.register_follower(LEADER_ID, raft_addr).await.unwrap();
    svc.register_follower(LEADER_ID, raft_addr).await.unwrap();

    let members = svc.members();
    assert_eq!(members, vec![(LEADER_ID, raft_addr.to_string())]);
}

#[tokio::test]
async fn an_unbootstrapped_node_rejects_writes() {
    let dir = tempfile::tempdir().unwrap();
    let kv = KvMap::new();
    let raft = dkv_raft::start(2, kv.clone(), dir.path()).await.unwrap();
    let svc = KvService::new(
        kv.clone(),
        raft,
        ServiceConfig {
            raft_timeout: Duration::from_millis(500),
            ..Default::default()
        },
    );

    assert!(matches!(
        svc.set("a", "b").await,
        Err(ServiceError::LeaderNotReady)
    ));
    // The admission check stopped the write before anything was submitted.
    assert!(kv.is_empty());
}
