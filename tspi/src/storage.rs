// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Persistent key storage: UUID to (parent UUID, wrapped blob) bindings
//!
//! One store per namespace. A store is either memory-only or backed by a JSON
//! file that is rewritten atomically after every change.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_human_bytes as hex_bytes;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::types::{KeyUuid, PsType};

const STORE_VERSION: u32 = 1;

/// One registered key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKey {
    pub parent_ps: PsType,
    pub parent: KeyUuid,
    #[serde(with = "hex_bytes")]
    pub blob: Vec<u8>,
}

/// Registration as reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyInfo {
    pub ps: PsType,
    pub uuid: KeyUuid,
    pub parent_ps: PsType,
    pub parent: KeyUuid,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    keys: BTreeMap<KeyUuid, StoredKey>,
}

#[derive(Debug)]
pub struct KeyStore {
    ps: PsType,
    path: Option<PathBuf>,
    keys: BTreeMap<KeyUuid, StoredKey>,
}

impl KeyStore {
    pub fn in_memory(ps: PsType) -> Self {
        Self {
            ps,
            path: None,
            keys: BTreeMap::new(),
        }
    }

    /// Open a file-backed store; a missing file is an empty store
    pub fn open(ps: PsType, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let keys = if path.exists() {
            let contents = fs_err::read(&path)?;
            let file: StoreFile = serde_json::from_slice(&contents)?;
            if file.version != STORE_VERSION {
                return Err(Error::Storage(format!(
                    "{}: unsupported store version {}",
                    path.display(),
                    file.version
                )));
            }
            file.keys
        } else {
            BTreeMap::new()
        };
        debug!(%ps, path = %path.display(), count = keys.len(), "opened key store");
        Ok(Self {
            ps,
            path: Some(path),
            keys,
        })
    }

    pub fn get(&self, uuid: &KeyUuid) -> Option<&StoredKey> {
        self.keys.get(uuid)
    }

    pub fn contains(&self, uuid: &KeyUuid) -> bool {
        self.keys.contains_key(uuid)
    }

    pub fn insert(&mut self, uuid: KeyUuid, key: StoredKey) -> Result<()> {
        self.keys.insert(uuid, key);
        self.save()
    }

    pub fn remove(&mut self, uuid: &KeyUuid) -> Result<Option<StoredKey>> {
        let removed = self.keys.remove(uuid);
        if removed.is_some() {
            self.save()?;
        }
        Ok(removed)
    }

    pub fn update_blob(&mut self, uuid: &KeyUuid, blob: Vec<u8>) -> Result<()> {
        match self.keys.get_mut(uuid) {
            Some(entry) => {
                entry.blob = blob;
                self.save()
            }
            None => Err(Error::NotRegistered {
                ps: self.ps,
                uuid: *uuid,
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyUuid, &StoredKey)> {
        self.keys.iter()
    }

    pub fn infos(&self) -> Vec<KeyInfo> {
        self.keys
            .iter()
            .map(|(uuid, k)| KeyInfo {
                ps: self.ps,
                uuid: *uuid,
                parent_ps: k.parent_ps,
                parent: k.parent,
            })
            .collect()
    }

    /// Write the store back to its file, if it has one
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs_err::create_dir_all(&dir)?;

        let file = StoreFile {
            version: STORE_VERSION,
            keys: self.keys.clone(),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &file)?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(path).map_err(|e| {
            warn!("failed to persist key store {}: {e}", path.display());
            Error::Storage(format!("failed to persist {}: {e}", path.display()))
        })?;
        debug!(ps = %self.ps, path = %path.display(), "saved key store");
        Ok(())
    }
}
