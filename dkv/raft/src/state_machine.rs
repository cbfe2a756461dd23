// Copyright 2022-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{
    BasicNode, Entry, EntryPayload, LogId, OptionalSend, RaftSnapshotBuilder, SnapshotMeta,
    StorageError, StorageIOError, StoredMembership,
};

use dkv_kv::{snapshot as snapshot_codec, ApplyOutcome, Command, KvMap};

use crate::{NodeId, TypeConfig};

/// How many snapshots to keep on disk.
const RETAINED_SNAPSHOTS: usize = 2;

const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone)]
struct StoredSnapshot {
    meta: SnapshotMeta<NodeId, BasicNode>,
    data: Vec<u8>,
}

#[derive(Debug, Default, Clone)]
struct AppliedState {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
}

/// The raft state machine over the shared [`KvMap`].
///
/// Committed entries are decoded and applied to the map in commit order.
/// Snapshots are written to the snapshot directory as `<id>.json` (the map as
/// a JSON object) plus a `<id>.meta.json` sidecar, keeping the newest
/// [`RETAINED_SNAPSHOTS`]; [`StateMachineStore::open`] reloads the newest
/// pair, which is how a restarted node recovers its map without replaying the
/// whole log.
///
/// Lock order is `applied` before the map; both are only ever held for
/// non-blocking sections.
#[derive(Debug)]
pub struct StateMachineStore {
    kv: KvMap,
    snapshot_dir: PathBuf,
    applied: Mutex<AppliedState>,
    snapshot_idx: Mutex<u64>,
    current_snapshot: Mutex<Option<StoredSnapshot>>,
}

impl StateMachineStore {
    pub fn open(kv: KvMap, snapshot_dir: &Path) -> Result<Self, StorageError<NodeId>> {
        let sm = Self {
            kv,
            snapshot_dir: snapshot_dir.to_path_buf(),
            applied: Mutex::new(AppliedState::default()),
            snapshot_idx: Mutex::new(0),
            current_snapshot: Mutex::new(None),
        };
        if let Some(snap) = sm.load_latest_snapshot()? {
            tracing::info!(id = %snap.meta.snapshot_id, "restoring snapshot found on disk");
            sm.restore(&snap)?;
            *lock(&sm.current_snapshot) = Some(snap);
        }
        Ok(sm)
    }

    /// Replace the map and the applied markers with a snapshot's contents.
    fn restore(&self, snap: &StoredSnapshot) -> Result<(), StorageError<NodeId>> {
        let map = snapshot_codec::decode(&snap.data)
            .map_err(|e| StorageIOError::read_snapshot(Some(snap.meta.signature()), &e))?;
        let mut applied = lock(&self.applied);
        self.kv.restore(map);
        applied.last_applied = snap.meta.last_log_id;
        applied.last_membership = snap.meta.last_membership.clone();
        Ok(())
    }

    fn persist_snapshot(&self, snap: &StoredSnapshot) -> Result<(), StorageError<NodeId>> {
        let write = || -> std::io::Result<()> {
            fs::create_dir_all(&self.snapshot_dir)?;
            let payload = self
                .snapshot_dir
                .join(format!("{}.json", snap.meta.snapshot_id));
            fs::write(&payload, &snap.data)?;
            fs::write(meta_path_for(&payload), serde_json::to_vec(&snap.meta)?)?;
            prune_snapshots(&self.snapshot_dir)
        };
        write().map_err(|e| {
            StorageIOError::write_snapshot(Some(snap.meta.signature()), &e).into()
        })
    }

    fn load_latest_snapshot(&self) -> Result<Option<StoredSnapshot>, StorageError<NodeId>> {
        let read = || -> std::io::Result<Option<StoredSnapshot>> {
            if !self.snapshot_dir.is_dir() {
                return Ok(None);
            }
            let Some(payload) = newest_first(&self.snapshot_dir)?.into_iter().next() else {
                return Ok(None);
            };
            let data = fs::read(&payload)?;
            let meta = serde_json::from_slice(&fs::read(meta_path_for(&payload))?)?;
            Ok(Some(StoredSnapshot { meta, data }))
        };
        read().map_err(|e| StorageIOError::read_snapshot(None, &e).into())
    }
}

/// Snapshot payload files in the directory, most recently written first.
fn newest_first(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut payloads = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(".json") && !name.ends_with(META_SUFFIX) {
            payloads.push((entry.metadata()?.modified()?, entry.path()));
        }
    }
    payloads.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(payloads.into_iter().map(|(_, path)| path).collect())
}

fn prune_snapshots(dir: &Path) -> std::io::Result<()> {
    for stale in newest_first(dir)?.into_iter().skip(RETAINED_SNAPSHOTS) {
        fs::remove_file(&stale)?;
        // A missing sidecar is not worth failing a snapshot over.
        let _ = fs::remove_file(meta_path_for(&stale));
    }
    Ok(())
}

fn meta_path_for(payload: &Path) -> PathBuf {
    payload.with_extension("meta.json")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().expect("state machine mutex poisoned")
}

impl RaftSnapshotBuilder<TypeConfig> for Arc<StateMachineStore> {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        // Clone the map while holding the applied markers so data and meta
        // describe the same point in the log.
        let (applied, data) = {
            let applied = lock(&self.applied);
            let data = snapshot_codec::encode(&self.kv.snapshot())
                .map_err(|e| StorageIOError::read_state_machine(&e))?;
            (applied.clone(), data)
        };

        let snapshot_id = {
            let mut idx = lock(&self.snapshot_idx);
            *idx += 1;
            match applied.last_applied {
                Some(last) => format!("{}-{}-{}", last.leader_id, last.index, *idx),
                None => format!("--{}", *idx),
            }
        };
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.last_membership,
            snapshot_id,
        };

        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        };
        self.persist_snapshot(&stored)?;
        *lock(&self.current_snapshot) = Some(stored);

        tracing::debug!(id = %meta.snapshot_id, bytes = data.len(), "built snapshot");
        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStateMachine<TypeConfig> for Arc<StateMachineStore> {
    type SnapshotBuilder = Self;

    async fn applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        let applied = lock(&self.applied);
        Ok((applied.last_applied, applied.last_membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> Result<Vec<ApplyOutcome>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut outcomes = Vec::new();
        let mut applied = lock(&self.applied);
        for entry in entries {
            applied.last_applied = Some(entry.log_id);
            match entry.payload {
                EntryPayload::Blank => outcomes.push(ApplyOutcome::Applied),
                EntryPayload::Normal(raw) => match Command::decode(&raw) {
                    Some(cmd) => {
                        self.kv.apply(&cmd);
                        outcomes.push(ApplyOutcome::Applied);
                    }
                    None => {
                        tracing::warn!(index = entry.log_id.index, "unknown command in log");
                        outcomes.push(ApplyOutcome::UnknownCommand);
                    }
                },
                EntryPayload::Membership(membership) => {
                    applied.last_membership =
                        StoredMembership::new(Some(entry.log_id), membership);
                    outcomes.push(ApplyOutcome::Applied);
                }
            }
        }
        Ok(outcomes)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        tracing::info!(id = %meta.snapshot_id, "installing snapshot");
        let stored = StoredSnapshot {
            meta: meta.clone(),
            data: snapshot.into_inner(),
        };
        self.restore(&stored)?;
        self.persist_snapshot(&stored)?;
        *lock(&self.current_snapshot) = Some(stored);
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let current = lock(&self.current_snapshot);
        Ok(current.as_ref().map(|snap| Snapshot {
            meta: snap.meta.clone(),
            snapshot: Box::new(Cursor::new(snap.data.clone())),
        }))
    }
}

#[cfg(test)]
mod tests {
    use openraft::CommittedLeaderId;

    use super::*;

    fn entry(index: u64, raw: &str) -> Entry<TypeConfig> {
        Entry {
            log_id: LogId::new(CommittedLeaderId::new(1, 1), index),
            payload: EntryPayload::Normal(raw.to_string()),
        }
    }

    fn open(dir: &Path) -> Arc<StateMachineStore> {
        Arc::new(StateMachineStore::open(KvMap::new(), dir).unwrap())
    }

    #[tokio::test]
    async fn applies_commands_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open(dir.path());

        let outcomes = sm
            .apply(vec![
                entry(1, "command:SET,key:a,val:1"),
                entry(2, "command:SET,key:b,val:2"),
                entry(3, "command:DEL,key:a"),
                entry(4, "command:FLUSH"),
            ])
            .await
            .unwrap();

        assert_eq!(
            outcomes,
            vec![
                ApplyOutcome::Applied,
                ApplyOutcome::Applied,
                ApplyOutcome::Applied,
                ApplyOutcome::UnknownCommand,
            ]
        );
        assert_eq!(sm.kv.get("a"), None);
        assert_eq!(sm.kv.get("b"), Some("2".to_string()));

        let (last_applied, _) = sm.applied_state().await.unwrap();
        assert_eq!(last_applied.map(|id| id.index), Some(4));
    }

    #[tokio::test]
    async fn snapshot_roundtrips_into_a_fresh_state_machine() {
        let dir_a = tempfile::tempdir().unwrap();
        let mut source = open(dir_a.path());
        source
            .apply(vec![
                entry(1, "command:SET,key:a,val:1"),
                entry(2, "command:SET,key:b,val:2"),
            ])
            .await
            .unwrap();

        let snapshot = source.build_snapshot().await.unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let mut target = open(dir_b.path());
        target
            .install_snapshot(&snapshot.meta, snapshot.snapshot)
            .await
            .unwrap();

        assert_eq!(source.kv.snapshot(), target.kv.snapshot());
        let (last_applied, _) = target.applied_state().await.unwrap();
        assert_eq!(last_applied.map(|id| id.index), Some(2));
    }

    #[tokio::test]
    async fn reopen_restores_the_newest_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut sm = open(dir.path());
            sm.apply(vec![entry(1, "command:SET,key:a,val:1")])
                .await
                .unwrap();
            sm.build_snapshot().await.unwrap();
        }

        let reopened = open(dir.path());
        assert_eq!(reopened.kv.get("a"), Some("1".to_string()));
        let current = lock(&reopened.current_snapshot);
        assert!(current.is_some());
    }

    #[tokio::test]
    async fn keeps_only_the_newest_two_snapshots_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open(dir.path());

        for index in 1..=3u64 {
            sm.apply(vec![entry(index, &format!("command:SET,key:k{index},val:v"))])
                .await
                .unwrap();
            sm.build_snapshot().await.unwrap();
            // Distinct mtimes so retention ordering is unambiguous.
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let payloads = newest_first(dir.path()).unwrap();
        assert_eq!(payloads.len(), RETAINED_SNAPSHOTS);
        // The newest snapshot holds all three keys.
        let data = fs::read(&payloads[0]).unwrap();
        let map = snapshot_codec::decode(&data).unwrap();
        assert_eq!(map.len(), 3);
    }
}
