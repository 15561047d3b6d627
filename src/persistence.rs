//! # Persisted State
//!
//! What survives a restart, per role:
//!
//! | Role | File | Contents |
//! |------|------|----------|
//! | active | `dht-active.dat` | versioned snapshot: local id, routing contacts, database |
//! | passive | `dht-passive.dat` | contact records, most recently seen first, ending in `End` |
//!
//! Files are bincode, written to a temporary sibling and renamed into place
//! so a crash mid-write never leaves a truncated file behind. Every failure
//! is logged and absorbed: a node that cannot read its state starts empty,
//! and one that cannot write it simply loses it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::DhtError;
use crate::identity::{Contact, Identity};
use crate::storage::ValueEntity;

pub const ACTIVE_STATE_FILE: &str = "dht-active.dat";
pub const PASSIVE_STATE_FILE: &str = "dht-passive.dat";

/// Upper bound on a state file read back from disk.
const MAX_STATE_FILE_SIZE: u64 = 64 * 1024 * 1024;

fn file_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_STATE_FILE_SIZE)
        .with_fixint_encoding()
}

/// Full state of an active node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActiveSnapshot {
    pub version: u32,
    pub local_id: Identity,
    pub contacts: Vec<Contact>,
    pub values: Vec<ValueEntity>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum ContactRecord {
    Contact(Contact),
    End,
}

// ============================================================================
// File plumbing
// ============================================================================

async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = file_options().serialize(value).context("encode state")?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }

    let temp = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp)
            .await
            .with_context(|| format!("create {}", temp.display()))?;
        file.write_all(&bytes).await.with_context(|| format!("write {}", temp.display()))?;
        file.sync_all().await.with_context(|| format!("flush {}", temp.display()))?;
    }
    if let Err(e) = fs::rename(&temp, path).await {
        let _ = fs::remove_file(&temp).await;
        return Err(e).with_context(|| format!("rename {} -> {}", temp.display(), path.display()));
    }
    Ok(())
}

async fn read_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let value = file_options()
        .deserialize(&bytes)
        .with_context(|| format!("decode {}", path.display()))?;
    Ok(Some(value))
}

async fn remove_file(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("remove {}", path.display())),
    }
}

fn failure(e: anyhow::Error) -> DhtError {
    DhtError::PersistenceFailure(format!("{e:#}"))
}

// ============================================================================
// Active role
// ============================================================================

pub fn active_path(dir: &Path) -> PathBuf {
    dir.join(ACTIVE_STATE_FILE)
}

pub fn passive_path(dir: &Path) -> PathBuf {
    dir.join(PASSIVE_STATE_FILE)
}

pub async fn save_active(dir: &Path, snapshot: &ActiveSnapshot) -> Result<(), DhtError> {
    let path = active_path(dir);
    write_atomic(&path, snapshot).await.map_err(failure)?;
    debug!(
        path = %path.display(),
        contacts = snapshot.contacts.len(),
        values = snapshot.values.len(),
        "saved active snapshot"
    );
    Ok(())
}

/// Load the active snapshot. Missing, unreadable and other-version files
/// all yield `None`.
pub async fn load_active(dir: &Path, version: u32) -> Option<ActiveSnapshot> {
    let path = active_path(dir);
    match read_file::<ActiveSnapshot>(&path).await {
        Ok(Some(snapshot)) if snapshot.version == version => {
            debug!(
                path = %path.display(),
                id = %snapshot.local_id.short(),
                contacts = snapshot.contacts.len(),
                "loaded active snapshot"
            );
            Some(snapshot)
        }
        Ok(Some(snapshot)) => {
            debug!(found = snapshot.version, expected = version, "discarding snapshot of another version");
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!(error = %failure(e), "ignoring unreadable active snapshot");
            None
        }
    }
}

// ============================================================================
// Passive role
// ============================================================================

/// Persist up to `max` contacts, or delete the file when fewer than `min`
/// are known.
pub async fn save_passive(dir: &Path, contacts: &[Contact], max: usize, min: usize) -> Result<(), DhtError> {
    let path = passive_path(dir);
    if contacts.len() < min {
        remove_file(&path).await.map_err(failure)?;
        debug!(known = contacts.len(), min, "too few contacts, discarded passive list");
        return Ok(());
    }

    let mut records: Vec<ContactRecord> = contacts.iter().take(max).cloned().map(ContactRecord::Contact).collect();
    records.push(ContactRecord::End);
    write_atomic(&path, &records).await.map_err(failure)?;
    debug!(path = %path.display(), saved = records.len() - 1, "saved passive contact list");
    Ok(())
}

/// Contacts up to the `End` record, at most `max` of them.
pub async fn load_passive(dir: &Path, max: usize) -> Vec<Contact> {
    let path = passive_path(dir);
    let records = match read_file::<Vec<ContactRecord>>(&path).await {
        Ok(Some(records)) => records,
        Ok(None) => return Vec::new(),
        Err(e) => {
            warn!(error = %failure(e), "ignoring unreadable passive contact list");
            return Vec::new();
        }
    };

    let contacts: Vec<Contact> = records
        .into_iter()
        .map_while(|record| match record {
            ContactRecord::Contact(contact) => Some(contact),
            ContactRecord::End => None,
        })
        .take(max)
        .collect();
    debug!(path = %path.display(), loaded = contacts.len(), "loaded passive contact list");
    contacts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{DhtValue, ValueType};
    use crate::storage::Database;
    use std::net::SocketAddr;
    use tokio::time::Duration;

    fn contact(n: u8) -> Contact {
        let addr: SocketAddr = format!("10.0.0.{n}:4000").parse().unwrap();
        Contact::seen_now(Identity::from_bytes([n; 20]), addr)
    }

    fn entities() -> Vec<ValueEntity> {
        let mut db = Database::new(Duration::from_secs(60), None, None);
        let key = Identity::from_content(b"file");
        db.store(DhtValue::new(key, contact(1), ValueType::Text, b"v".to_vec()), true);
        db.entities().cloned().collect()
    }

    #[tokio::test]
    async fn active_snapshot_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ActiveSnapshot {
            version: 3,
            local_id: Identity::from_bytes([9; 20]),
            contacts: vec![contact(1), contact(2)],
            values: entities(),
        };
        save_active(dir.path(), &snapshot).await.unwrap();

        let loaded = load_active(dir.path(), 3).await.unwrap();
        assert_eq!(loaded.local_id, snapshot.local_id);
        assert_eq!(loaded.contacts, snapshot.contacts);
        assert_eq!(loaded.values, snapshot.values);
        assert!(!dir.path().join("dht-active.tmp").exists());
    }

    #[tokio::test]
    async fn other_version_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ActiveSnapshot {
            version: 1,
            local_id: Identity::random(),
            contacts: Vec::new(),
            values: Vec::new(),
        };
        save_active(dir.path(), &snapshot).await.unwrap();
        assert!(load_active(dir.path(), 2).await.is_none());
    }

    #[tokio::test]
    async fn corrupt_files_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(active_path(dir.path()), b"\x01\x02garbage").unwrap();
        std::fs::write(passive_path(dir.path()), b"\xff\xff\xff\xff").unwrap();
        assert!(load_active(dir.path(), 0).await.is_none());
        assert!(load_passive(dir.path(), 40).await.is_empty());
        assert!(load_active(&dir.path().join("missing"), 0).await.is_none());
    }

    #[tokio::test]
    async fn passive_list_is_capped_and_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let contacts: Vec<_> = (1..=10).map(contact).collect();
        save_passive(dir.path(), &contacts, 4, 2).await.unwrap();

        let loaded = load_passive(dir.path(), 40).await;
        assert_eq!(loaded, contacts[..4].to_vec());
        assert_eq!(load_passive(dir.path(), 2).await, contacts[..2].to_vec());
    }

    #[tokio::test]
    async fn passive_list_below_minimum_is_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let contacts: Vec<_> = (1..=3).map(contact).collect();
        save_passive(dir.path(), &contacts, 40, 2).await.unwrap();
        assert!(passive_path(dir.path()).exists());

        save_passive(dir.path(), &contacts[..1], 40, 2).await.unwrap();
        assert!(!passive_path(dir.path()).exists());
        assert!(load_passive(dir.path(), 40).await.is_empty());
    }

    #[tokio::test]
    async fn double_save_leaves_a_readable_file() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = ActiveSnapshot {
            version: 0,
            local_id: Identity::random(),
            contacts: vec![contact(5)],
            values: Vec::new(),
        };
        save_active(dir.path(), &snapshot).await.unwrap();
        save_active(dir.path(), &snapshot).await.unwrap();
        assert_eq!(load_active(dir.path(), 0).await.unwrap().contacts.len(), 1);
    }
}
