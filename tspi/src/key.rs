// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Key objects and persistent registration

use tracing::{debug, info};

use crate::auth::AuthValue;
use crate::constants::*;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::marshal::Unmarshal;
use crate::policy::{PolicyTarget, PolicyUsage, SecretMode, WELL_KNOWN_SECRET};
use crate::storage::{KeyInfo, StoredKey};
use crate::types::*;

#[derive(Debug)]
pub(crate) struct KeyObject {
    pub(crate) flags: KeyFlags,
    pub(crate) blob: Option<Vec<u8>>,
    pub(crate) pub_key: Option<Vec<u8>>,
    /// Device handle while loaded
    pub(crate) tpm_handle: Option<u32>,
    pub(crate) policy: Option<PolicyHandle>,
    /// Registration this object was materialized from, if any
    pub(crate) id: Option<(PsType, KeyUuid)>,
    /// Parent by persistent identity only; the parent object may come and go
    pub(crate) parent_id: Option<(PsType, KeyUuid)>,
}

impl KeyObject {
    pub(crate) fn new(flags: KeyFlags) -> Self {
        Self {
            flags,
            blob: None,
            pub_key: None,
            tpm_handle: None,
            policy: None,
            id: None,
            parent_id: None,
        }
    }

    pub(crate) fn srk(policy: PolicyHandle) -> Self {
        Self {
            flags: KeyFlags::storage().with_authorization(true),
            blob: None,
            pub_key: None,
            tpm_handle: Some(tpm_kh::SRK),
            policy: Some(policy),
            id: Some((PsType::System, KeyUuid::SRK)),
            parent_id: None,
        }
    }

    fn from_stored(ps: PsType, uuid: KeyUuid, stored: &StoredKey) -> Result<Self> {
        let blob = KeyBlob::from_bytes(&stored.blob)?;
        Ok(Self {
            flags: blob.key_flags(),
            blob: Some(stored.blob.clone()),
            pub_key: Some(blob.pub_key),
            tpm_handle: None,
            policy: None,
            id: Some((ps, uuid)),
            parent_id: Some((stored.parent_ps, stored.parent)),
        })
    }
}

impl Context {
    pub(crate) fn key(&self, key: KeyHandle) -> Result<&KeyObject> {
        self.keys
            .get(key.0)
            .ok_or_else(|| Error::invalid_handle(format!("{key} is not a live key object")))
    }

    pub(crate) fn key_mut(&mut self, key: KeyHandle) -> Result<&mut KeyObject> {
        self.keys
            .get_mut(key.0)
            .ok_or_else(|| Error::invalid_handle(format!("{key} is not a live key object")))
    }

    /// Device handle of a loaded key
    pub(crate) fn loaded_handle(&self, key: KeyHandle) -> Result<u32> {
        let k = self.key(key)?;
        k.tpm_handle.ok_or_else(|| Error::NotLoaded {
            uuid: match k.id {
                Some((_, uuid)) => uuid.to_string(),
                None => key.to_string(),
            },
        })
    }

    /// Create an empty key object; nothing touches the device yet
    pub fn create_key_object(&mut self, flags: KeyFlags) -> KeyHandle {
        KeyHandle(self.keys.insert(KeyObject::new(flags)))
    }

    /// Destroy a key object, flushing it from the device if loaded
    pub fn close_key(&mut self, key: KeyHandle) -> Result<()> {
        if key == self.srk {
            return Err(Error::bad_parameter("the SRK cannot be closed"));
        }
        if self.key(key)?.tpm_handle.is_some() {
            self.unload_key(key)?;
        }
        if let Some(k) = self.keys.remove(key.0) {
            if let Some(id) = k.id {
                if self.by_uuid.get(&id) == Some(&key) {
                    self.by_uuid.remove(&id);
                }
            }
            if let Some(policy) = k.policy {
                if let Some(p) = self.policies.get_mut(policy.0) {
                    p.bound = None;
                }
            }
        }
        self.challenges.remove(&key);
        Ok(())
    }

    /// Give the SRK the all-zero secret
    pub fn set_srk_secret_well_known(&mut self) -> Result<()> {
        let policy = match self.key(self.srk)?.policy {
            Some(policy) => policy,
            None => {
                let policy = self.create_policy(PolicyUsage::Usage);
                self.assign_policy(policy, PolicyTarget::Key(self.srk))?;
                policy
            }
        };
        self.set_secret(policy, SecretMode::Sha1, &WELL_KNOWN_SECRET)
    }

    pub fn is_loaded(&self, key: KeyHandle) -> Result<bool> {
        Ok(self.key(key)?.tpm_handle.is_some())
    }

    pub fn key_flags(&self, key: KeyHandle) -> Result<KeyFlags> {
        Ok(self.key(key)?.flags)
    }

    /// Persistent identity the object is bound to, if any
    pub fn key_uuid(&self, key: KeyHandle) -> Result<Option<(PsType, KeyUuid)>> {
        Ok(self.key(key)?.id)
    }

    pub fn public_key(&self, key: KeyHandle) -> Result<Vec<u8>> {
        self.key(key)?
            .pub_key
            .clone()
            .ok_or_else(|| Error::bad_parameter(format!("{key} has not been created")))
    }

    pub fn key_blob(&self, key: KeyHandle) -> Result<Vec<u8>> {
        self.key(key)?
            .blob
            .clone()
            .ok_or_else(|| Error::bad_parameter(format!("{key} has not been created")))
    }

    /// Create the key on the device under a loaded parent.
    ///
    /// The key stays unloaded; its wrapped blob is kept on the object.
    pub fn create_key(&mut self, key: KeyHandle, parent: KeyHandle) -> Result<()> {
        let k = self.key(key)?;
        if k.blob.is_some() {
            return Err(Error::bad_parameter(format!("{key} already created")));
        }
        let flags = k.flags;
        let parent_handle = self.loaded_handle(parent)?;
        let parent_auth = self.require_key_auth(parent)?;
        let usage_auth = if flags.requires_auth {
            self.require_key_auth(key)?
        } else {
            AuthValue::well_known()
        };

        let blob = self.tpm_create_wrap_key(parent_handle, &parent_auth, &usage_auth, &flags)?;
        let parsed = KeyBlob::from_bytes(&blob)?;
        let parent_id = self.key(parent)?.id;

        let k = self.key_mut(key)?;
        k.pub_key = Some(parsed.pub_key);
        k.blob = Some(blob);
        k.parent_id = parent_id;
        debug!("created {key} under {parent}");
        Ok(())
    }

    /// Load a created key under an explicitly named, loaded parent
    pub fn load_key(&mut self, key: KeyHandle, parent: KeyHandle) -> Result<()> {
        if self.key(key)?.tpm_handle.is_some() {
            return Ok(());
        }
        let parent_auth = self.require_key_auth(parent)?;
        self.load_with_auth(key, parent, &parent_auth)
    }

    pub(crate) fn load_with_auth(
        &mut self,
        key: KeyHandle,
        parent: KeyHandle,
        parent_auth: &AuthValue,
    ) -> Result<()> {
        let parent_handle = self.loaded_handle(parent)?;
        let blob = self.key_blob(key)?;
        let handle = self.tpm_load_key2(parent_handle, parent_auth, &blob)?;
        self.key_mut(key)?.tpm_handle = Some(handle);
        Ok(())
    }

    pub fn unload_key(&mut self, key: KeyHandle) -> Result<()> {
        if key == self.srk {
            return Err(Error::bad_parameter("the SRK cannot be unloaded"));
        }
        let handle = self.loaded_handle(key)?;
        self.tpm_flush_specific(handle, tpm_rt::KEY)?;
        self.key_mut(key)?.tpm_handle = None;
        Ok(())
    }

    /// Re-wrap `key` under the secret of `new_policy` and bind the policy to it.
    ///
    /// A loaded key is reloaded from the new blob; a registered key has its
    /// stored blob replaced.
    pub fn change_auth(
        &mut self,
        key: KeyHandle,
        parent: KeyHandle,
        new_policy: PolicyHandle,
    ) -> Result<()> {
        if key == self.srk {
            return Err(Error::bad_parameter("the SRK secret is owned by the device owner"));
        }
        let new_auth = self
            .policy(new_policy)?
            .secret
            .clone()
            .ok_or_else(|| Error::bad_parameter(format!("{new_policy} has no secret")))?;
        let blob = self.key_blob(key)?;
        let parent_handle = self.loaded_handle(parent)?;
        let parent_auth = self.require_key_auth(parent)?;
        let old_auth = self.require_key_auth(key)?;

        let new_blob =
            self.tpm_change_auth(parent_handle, &parent_auth, &old_auth, &new_auth, &blob)?;
        let parsed = KeyBlob::from_bytes(&new_blob)?;

        let was_loaded = self.key(key)?.tpm_handle.is_some();
        if was_loaded {
            self.unload_key(key)?;
        }
        let id = {
            let k = self.key_mut(key)?;
            k.blob = Some(new_blob.clone());
            k.pub_key = Some(parsed.pub_key);
            k.id
        };
        if let Some((ps, uuid)) = id {
            if self.store(ps).contains(&uuid) {
                self.store_mut(ps).update_blob(&uuid, new_blob)?;
            }
        }
        self.assign_policy(new_policy, PolicyTarget::Key(key))?;
        if was_loaded {
            self.load_with_auth(key, parent, &parent_auth)?;
        }
        info!("changed authorization of {key}");
        Ok(())
    }

    // ==================== Registration ====================

    fn is_registered(&self, ps: PsType, uuid: &KeyUuid) -> bool {
        (ps == PsType::System && *uuid == KeyUuid::SRK) || self.store(ps).contains(uuid)
    }

    /// Bind `key` to `uuid` in `ps`, under the registered parent.
    ///
    /// An existing binding is reported as [`Error::AlreadyRegistered`]; the
    /// existing key must then be fetched with
    /// [`get_registered_key_by_uuid`](Self::get_registered_key_by_uuid).
    pub fn register_key(
        &mut self,
        key: KeyHandle,
        ps: impl IntoPsType,
        uuid: KeyUuid,
        parent_ps: impl IntoPsType,
        parent_uuid: KeyUuid,
    ) -> Result<()> {
        let ps = ps.into_ps_type()?;
        let parent_ps = parent_ps.into_ps_type()?;
        if (ps, uuid) == (parent_ps, parent_uuid) {
            return Err(Error::bad_parameter(format!("{uuid} cannot be its own parent")));
        }
        let blob = self.key_blob(key)?;
        if self.is_registered(ps, &uuid) {
            return Err(Error::AlreadyRegistered { ps, uuid });
        }
        if let Some((bound_ps, bound)) = self.key(key)?.id {
            return Err(Error::bad_parameter(format!(
                "{key} is already registered as {bound} in {bound_ps} storage"
            )));
        }
        if !self.is_registered(parent_ps, &parent_uuid) {
            return Err(Error::NotRegistered {
                ps: parent_ps,
                uuid: parent_uuid,
            });
        }

        // Stale links left by unregistered keys may still point at `uuid`
        let mut cursor = (parent_ps, parent_uuid);
        let mut seen = vec![cursor];
        while let Some(stored) = self.store(cursor.0).get(&cursor.1) {
            cursor = (stored.parent_ps, stored.parent);
            if cursor == (ps, uuid) {
                return Err(Error::HierarchyCycle { uuid });
            }
            if seen.contains(&cursor) {
                return Err(Error::HierarchyCycle { uuid: cursor.1 });
            }
            seen.push(cursor);
        }

        self.store_mut(ps).insert(
            uuid,
            StoredKey {
                parent_ps,
                parent: parent_uuid,
                blob,
            },
        )?;
        let k = self.key_mut(key)?;
        k.id = Some((ps, uuid));
        k.parent_id = Some((parent_ps, parent_uuid));
        self.by_uuid.insert((ps, uuid), key);
        info!("registered {uuid} in {ps} storage under {parent_uuid}");
        Ok(())
    }

    /// Remove a registration, handing back a key object for it in `out`
    pub fn unregister_key(
        &mut self,
        ps: impl IntoPsType,
        uuid: KeyUuid,
        out: Option<&mut Option<KeyHandle>>,
    ) -> Result<()> {
        let ps = ps.into_ps_type()?;
        let Some(out) = out else {
            return Err(Error::bad_parameter("unregister needs an output slot for the key"));
        };
        if ps == PsType::System && uuid == KeyUuid::SRK {
            return Err(Error::bad_parameter("the SRK cannot be unregistered"));
        }
        let stored = self
            .store_mut(ps)
            .remove(&uuid)?
            .ok_or(Error::NotRegistered { ps, uuid })?;

        let key = match self.by_uuid.remove(&(ps, uuid)) {
            Some(key) if self.keys.contains(key.0) => key,
            _ => KeyHandle(self.keys.insert(KeyObject::from_stored(ps, uuid, &stored)?)),
        };
        // The object outlives the binding
        self.key_mut(key)?.id = None;
        *out = Some(key);
        info!("unregistered {uuid} from {ps} storage");
        Ok(())
    }

    /// Key object for a registered UUID, created on first use
    pub fn get_registered_key_by_uuid(
        &mut self,
        ps: impl IntoPsType,
        uuid: KeyUuid,
    ) -> Result<KeyHandle> {
        let ps = ps.into_ps_type()?;
        if let Some(key) = self.by_uuid.get(&(ps, uuid)) {
            if self.keys.contains(key.0) {
                return Ok(*key);
            }
        }
        let stored = self
            .store(ps)
            .get(&uuid)
            .ok_or(Error::NotRegistered { ps, uuid })?;
        let object = KeyObject::from_stored(ps, uuid, stored)?;
        let key = KeyHandle(self.keys.insert(object));
        self.by_uuid.insert((ps, uuid), key);
        Ok(key)
    }

    /// Registered key whose public key equals `pub_key`
    pub fn find_by_public_info(
        &mut self,
        ps: impl IntoPsType,
        pub_key: &[u8],
    ) -> Result<Option<KeyHandle>> {
        let ps = ps.into_ps_type()?;
        let mut found = None;
        for (uuid, stored) in self.store(ps).iter() {
            let blob = KeyBlob::from_bytes(&stored.blob)?;
            if blob.pub_key == pub_key {
                found = Some(*uuid);
                break;
            }
        }
        match found {
            Some(uuid) => Ok(Some(self.get_registered_key_by_uuid(ps, uuid)?)),
            None => Ok(None),
        }
    }

    pub fn registered_keys(&self, ps: impl IntoPsType) -> Result<Vec<KeyInfo>> {
        let ps = ps.into_ps_type()?;
        Ok(self.store(ps).infos())
    }
}
