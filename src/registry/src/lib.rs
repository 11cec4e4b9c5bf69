// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A replicated registry of managed hosts.
//!
//! The registry maps a host address to an arbitrary value and replicates the
//! whole mapping across a set of shard tasks so that any single shard can
//! answer a read authoritatively. Each shard task exclusively owns its copy
//! of the map; all access happens by message submission, so no locks are
//! involved. A write is applied first on the shard that owns the key (chosen
//! by a stable hash) and then fanned out to every other shard, resolving only
//! once all replicas have acknowledged.
//!
//! On `stop` each shard persists the partition it owns to
//! `registry_shard_<i>.dat`; on `start` the files are loaded and merged, so
//! the mapping survives a controller restart.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// An error produced by the registry.
#[derive(Debug)]
pub enum RegistryError {
    /// The key is not present.
    NotFound,
    /// A replica failed to apply or answer. The write may be incomplete;
    /// callers treat this as transient and retry.
    Replication(anyhow::Error),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::NotFound => f.write_str("key not found"),
            RegistryError::Replication(e) => write!(f, "replication failed: {e:#}"),
        }
    }
}

impl std::error::Error for RegistryError {}

enum Command<V> {
    /// Applies `Some(value)` as an upsert, `None` as a removal.
    Apply {
        key: String,
        value: Option<V>,
        ack: oneshot::Sender<()>,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Option<V>>,
    },
    /// A point-in-time copy of the full replica, taken in one message turn.
    Entries {
        reply: oneshot::Sender<Vec<(String, V)>>,
    },
    /// The entries this shard owns, for persistence.
    Partition {
        reply: oneshot::Sender<Vec<(String, V)>>,
    },
    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// A sharded, fully replicated `address → V` registry.
///
/// The value type is generic as an implementation convenience; the fleet
/// controller instantiates it with its node record type.
pub struct Registry<V> {
    shards: Vec<mpsc::UnboundedSender<Command<V>>>,
}

impl<V> fmt::Debug for Registry<V> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl<V> Registry<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Starts a registry with `shard_count` shard tasks.
    ///
    /// # Panics
    ///
    /// Panics if `shard_count` is zero.
    pub fn start(shard_count: usize) -> Registry<V> {
        assert!(shard_count > 0, "registry requires at least one shard");
        let mut shards = Vec::with_capacity(shard_count);
        for index in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            fleet_ore::task::spawn(
                || format!("registry-shard-{index}"),
                shard_task(index, shard_count, rx),
            );
            shards.push(tx);
        }
        Registry { shards }
    }

    /// The number of shards.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn owner(&self, key: &str) -> usize {
        usize::try_from(stable_hash(key) % self.shards.len() as u64)
            .expect("shard index fits in usize")
    }

    async fn submit<R>(
        &self,
        shard: usize,
        make: impl FnOnce(oneshot::Sender<R>) -> Command<V>,
    ) -> Result<R, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.shards[shard]
            .send(make(tx))
            .map_err(|_| RegistryError::Replication(anyhow!("shard {shard} is gone")))?;
        rx.await
            .map_err(|_| RegistryError::Replication(anyhow!("shard {shard} dropped the request")))
    }

    async fn apply(&self, key: &str, value: Option<V>) -> Result<(), RegistryError> {
        // Owner first, then fan out; the call resolves only once every
        // replica has acknowledged.
        let owner = self.owner(key);
        self.submit(owner, |ack| Command::Apply {
            key: key.to_string(),
            value: value.clone(),
            ack,
        })
        .await?;
        let others = (0..self.shards.len()).filter(|i| *i != owner);
        let acks = others.map(|i| {
            self.submit(i, |ack| Command::Apply {
                key: key.to_string(),
                value: value.clone(),
                ack,
            })
        });
        futures::future::try_join_all(acks).await?;
        Ok(())
    }

    /// Registers or updates the value for `key` on every replica.
    pub async fn put(&self, key: &str, value: V) -> Result<(), RegistryError> {
        self.apply(key, Some(value)).await
    }

    /// Removes `key` from every replica.
    ///
    /// Removing an absent key is not an error.
    pub async fn remove(&self, key: &str) -> Result<(), RegistryError> {
        self.apply(key, None).await
    }

    /// Returns the value for `key`.
    pub async fn get(&self, key: &str) -> Result<V, RegistryError> {
        let owner = self.owner(key);
        self.submit(owner, |reply| Command::Get {
            key: key.to_string(),
            reply,
        })
        .await?
        .ok_or(RegistryError::NotFound)
    }

    /// Returns a point-in-time copy of all entries, each exactly once.
    ///
    /// The copy is taken by a single shard in one message turn, so a
    /// concurrent write is either entirely visible or entirely absent.
    /// Order is unspecified.
    pub async fn entries(&self) -> Result<Vec<(String, V)>, RegistryError> {
        self.submit(0, |reply| Command::Entries { reply }).await
    }

    /// Persists each shard's owned partition to `registry_shard_<i>.dat`
    /// under `dir`.
    pub async fn snapshot(&self, dir: &Path) -> Result<(), anyhow::Error> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;
        for shard in 0..self.shards.len() {
            let partition = self
                .submit(shard, |reply| Command::Partition { reply })
                .await?;
            let path = shard_file(dir, shard);
            let mut buf = Vec::new();
            for (key, value) in &partition {
                let value = serde_json::to_string(value).context("encoding registry value")?;
                write_frame(&mut buf, key.as_bytes());
                write_frame(&mut buf, value.as_bytes());
            }
            tokio::fs::write(&path, buf)
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            debug!(
                "snapshotted {} registry entries to {}",
                partition.len(),
                path.display()
            );
        }
        Ok(())
    }

    /// Loads and merges every `registry_shard_<i>.dat` file under `dir`.
    ///
    /// Files written by a deployment with a different shard count merge
    /// cleanly; ownership is recomputed on the way in.
    pub async fn restore(&self, dir: &Path) -> Result<usize, anyhow::Error> {
        let mut restored = 0;
        for path in shard_files(dir).await? {
            let buf = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let mut buf = &buf[..];
            while !buf.is_empty() {
                let key = read_frame(&mut buf)
                    .with_context(|| format!("corrupt frame in {}", path.display()))?;
                let value = read_frame(&mut buf)
                    .with_context(|| format!("corrupt frame in {}", path.display()))?;
                let value: V = serde_json::from_str(&value)
                    .with_context(|| format!("corrupt value in {}", path.display()))?;
                self.put(&key, value).await?;
                restored += 1;
            }
        }
        if restored > 0 {
            info!("restored {restored} registry entries from {}", dir.display());
        }
        Ok(restored)
    }

    /// Stops all shard tasks. Pending writes are drained first.
    pub async fn stop(self) {
        for shard in 0..self.shards.len() {
            // A shard that is already gone has nothing to drain.
            let _ = self.submit(shard, |ack| Command::Stop { ack }).await;
        }
    }
}

async fn shard_task<V: Clone>(
    index: usize,
    shard_count: usize,
    mut rx: mpsc::UnboundedReceiver<Command<V>>,
) {
    let mut map = BTreeMap::new();
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Apply { key, value, ack } => {
                match value {
                    Some(value) => {
                        map.insert(key, value);
                    }
                    None => {
                        map.remove(&key);
                    }
                }
                let _ = ack.send(());
            }
            Command::Get { key, reply } => {
                let _ = reply.send(map.get(&key).cloned());
            }
            Command::Entries { reply } => {
                let entries = map.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                let _ = reply.send(entries);
            }
            Command::Partition { reply } => {
                let owned = map
                    .iter()
                    .filter(|(k, _)| stable_hash(k) % shard_count as u64 == index as u64)
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let _ = reply.send(owned);
            }
            Command::Stop { ack } => {
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// FNV-1a. The owning shard of a key must not depend on hasher seeding, so
/// the standard library's hasher is not an option here.
fn stable_hash(key: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325_u64;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn shard_file(dir: &Path, shard: usize) -> PathBuf {
    dir.join(format!("registry_shard_{shard}.dat"))
}

async fn shard_files(dir: &Path) -> Result<Vec<PathBuf>, anyhow::Error> {
    let mut files = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(anyhow::Error::new(e).context(format!("reading {}", dir.display()))),
    };
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("registry_shard_") && name.ends_with(".dat") {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}

fn write_frame(buf: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).expect("registry string fits in u32");
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn read_frame(buf: &mut &[u8]) -> Result<String, anyhow::Error> {
    if buf.len() < 4 {
        return Err(anyhow!("truncated length prefix"));
    }
    let (len, rest) = buf.split_at(4);
    let len = usize::try_from(u32::from_be_bytes(len.try_into().expect("four bytes")))
        .expect("u32 fits in usize");
    if rest.len() < len {
        return Err(anyhow!("truncated frame body"));
    }
    let (body, rest) = rest.split_at(len);
    *buf = rest;
    String::from_utf8(body.to_vec()).context("frame is not UTF-8")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_remove_round_trip() {
        let registry: Registry<String> = Registry::start(4);
        registry.put("10.0.0.1", "web".to_string()).await.unwrap();
        assert_eq!(registry.get("10.0.0.1").await.unwrap(), "web");

        registry.put("10.0.0.1", "web_2".to_string()).await.unwrap();
        assert_eq!(registry.get("10.0.0.1").await.unwrap(), "web_2");

        registry.remove("10.0.0.1").await.unwrap();
        assert!(matches!(
            registry.get("10.0.0.1").await,
            Err(RegistryError::NotFound)
        ));
        // Removing again is fine.
        registry.remove("10.0.0.1").await.unwrap();
    }

    #[tokio::test]
    async fn entries_sees_each_entry_exactly_once() {
        let registry: Registry<String> = Registry::start(3);
        for i in 0..32 {
            registry
                .put(&format!("10.0.1.{i}"), format!("svc{i}"))
                .await
                .unwrap();
        }
        let mut entries = registry.entries().await.unwrap();
        entries.sort();
        assert_eq!(entries.len(), 32);
        entries.dedup_by(|a, b| a.0 == b.0);
        assert_eq!(entries.len(), 32);
    }

    #[tokio::test]
    async fn snapshot_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();

        let registry: Registry<String> = Registry::start(4);
        registry.put("10.0.0.1", "web".to_string()).await.unwrap();
        registry.put("10.0.0.2", "db".to_string()).await.unwrap();
        registry.snapshot(dir.path()).await.unwrap();
        registry.stop().await;

        // Restart with a different shard count; partitions must merge.
        let registry: Registry<String> = Registry::start(2);
        let restored = registry.restore(dir.path()).await.unwrap();
        assert_eq!(restored, 2);
        assert_eq!(registry.get("10.0.0.1").await.unwrap(), "web");
        assert_eq!(registry.get("10.0.0.2").await.unwrap(), "db");
    }

    #[tokio::test]
    async fn restore_from_missing_directory_is_empty() {
        let registry: Registry<String> = Registry::start(2);
        let restored = registry
            .restore(Path::new("/nonexistent/registry"))
            .await
            .unwrap();
        assert_eq!(restored, 0);
    }

    #[tokio::test]
    async fn concurrent_put_is_atomic_in_entries() {
        let registry = std::sync::Arc::new(Registry::<String>::start(4));
        let writer = {
            let registry = std::sync::Arc::clone(&registry);
            tokio::spawn(async move {
                for i in 0..64 {
                    registry
                        .put(&format!("10.0.2.{i}"), format!("svc{i}"))
                        .await
                        .unwrap();
                }
            })
        };
        // Snapshots taken mid-stream never tear: each is a copy made in a
        // single shard turn, so every visible entry is fully written.
        for _ in 0..16 {
            let entries = registry.entries().await.unwrap();
            for (key, value) in entries {
                let i = key.rsplit('.').next().unwrap();
                assert_eq!(value, format!("svc{i}"));
            }
        }
        writer.await.unwrap();
        assert_eq!(registry.entries().await.unwrap().len(), 64);
    }
}
