// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Top-level service provider context
//!
//! A context owns the device connection, the object arenas for keys,
//! policies, delegation families and transport sessions, and both persistent
//! storage namespaces. Handles from one context are rejected by another.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::arena::{next_tag, Arena};
use crate::auth::Nonce;
use crate::config::ContextConfig;
use crate::constants::*;
use crate::delegation::{DelegationCapacity, Family};
use crate::device::{FileDevice, TpmResponse, Transmit};
use crate::error::{Error, Result};
use crate::key::KeyObject;
use crate::policy::{Policy, PolicyTarget, PolicyUsage};
use crate::storage::KeyStore;
use crate::transport::TransportSession;
use crate::types::*;

pub struct Context {
    device: Box<dyn Transmit>,
    config: ContextConfig,
    released: bool,
    pub(crate) keys: Arena<KeyObject>,
    pub(crate) policies: Arena<Policy>,
    pub(crate) families: Arena<Family>,
    pub(crate) transports: Arena<TransportSession>,
    pub(crate) system_ps: KeyStore,
    pub(crate) user_ps: KeyStore,
    /// Key objects already materialized for registered UUIDs
    pub(crate) by_uuid: HashMap<(PsType, KeyUuid), KeyHandle>,
    /// Outstanding load challenges
    pub(crate) challenges: HashMap<KeyHandle, Nonce>,
    pub(crate) owner_policy: PolicyHandle,
    pub(crate) default_policy: PolicyHandle,
    pub(crate) srk: KeyHandle,
    pub(crate) active_transport: Option<TransportHandle>,
    pub(crate) capacity: Option<DelegationCapacity>,
}

impl Context {
    /// Connect to the configured device, or auto-detect one
    pub fn connect(config: ContextConfig) -> Result<Self> {
        let device = match &config.device {
            Some(path) => FileDevice::open(path)?,
            None => FileDevice::detect()?,
        };
        debug!("connected to TPM device {}", device.path());
        Self::with_device(device, config)
    }

    /// Build a context over an already-open device
    pub fn with_device(device: impl Transmit + 'static, config: ContextConfig) -> Result<Self> {
        let tag = next_tag();
        let system_ps = match &config.system_ps_path {
            Some(path) => KeyStore::open(PsType::System, path)?,
            None => KeyStore::in_memory(PsType::System),
        };
        let user_ps = match &config.user_ps_path {
            Some(path) => KeyStore::open(PsType::User, path)?,
            None => KeyStore::in_memory(PsType::User),
        };

        let mut keys = Arena::with_tag(tag);
        let mut policies = Arena::with_tag(tag);

        let mut owner = Policy::new(PolicyUsage::Owner);
        owner.bound = Some(PolicyTarget::Owner);
        let owner_policy = PolicyHandle(policies.insert(owner));
        let default_policy = PolicyHandle(policies.insert(Policy::new(PolicyUsage::Usage)));
        let srk_policy = PolicyHandle(policies.insert(Policy::new(PolicyUsage::Usage)));

        let srk = KeyHandle(keys.insert(KeyObject::srk(srk_policy)));
        if let Some(p) = policies.get_mut(srk_policy.0) {
            p.bound = Some(PolicyTarget::Key(srk));
        }

        let mut by_uuid = HashMap::new();
        by_uuid.insert((PsType::System, KeyUuid::SRK), srk);

        Ok(Self {
            device: Box::new(device),
            config,
            released: false,
            keys,
            policies,
            families: Arena::with_tag(tag),
            transports: Arena::with_tag(tag),
            system_ps,
            user_ps,
            by_uuid,
            challenges: HashMap::new(),
            owner_policy,
            default_policy,
            srk,
            active_transport: None,
            capacity: None,
        })
    }

    /// Release the context: abandon any live transport, flush loaded keys and
    /// write back file-backed storage.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        if let Some(session) = self.active_transport {
            if let Err(e) = self.abandon_transport(session) {
                warn!("failed to abandon {session} on close: {e}");
            }
        }

        let loaded: Vec<(KeyHandle, u32)> = self
            .keys
            .iter()
            .filter_map(|(idx, k)| k.tpm_handle.map(|h| (KeyHandle(idx), h)))
            .filter(|(key, _)| *key != self.srk)
            .collect();
        for (key, handle) in loaded {
            if let Err(e) = self.tpm_flush_specific(handle, tpm_rt::KEY) {
                warn!("failed to flush {key} (0x{handle:08x}) on close: {e}");
            }
        }

        self.system_ps.save()?;
        self.user_ps.save()?;
        debug!(
            keys = self.keys.len(),
            policies = self.policies.len(),
            "context closed"
        );
        Ok(())
    }

    pub fn config(&self) -> &ContextConfig {
        &self.config
    }

    /// The storage root key; always loaded
    pub fn srk(&self) -> KeyHandle {
        self.srk
    }

    pub(crate) fn store(&self, ps: PsType) -> &KeyStore {
        match ps {
            PsType::System => &self.system_ps,
            PsType::User => &self.user_ps,
        }
    }

    pub(crate) fn store_mut(&mut self, ps: PsType) -> &mut KeyStore {
        match ps {
            PsType::System => &mut self.system_ps,
            PsType::User => &mut self.user_ps,
        }
    }

    /// Send one framed command to the device as-is
    pub(crate) fn transmit(&mut self, command: &[u8]) -> Result<TpmResponse> {
        let raw = self.device.transmit(command)?;
        TpmResponse::parse(&raw)
    }

    /// Send a command, through the active transport session if there is one
    pub(crate) fn submit(&mut self, ordinal: TpmOrd, command: &[u8]) -> Result<TpmResponse> {
        debug!("{ordinal:?} command: {} bytes", command.len());
        let response = match self.active_transport {
            Some(session) if !ordinal.is_transport_control() => {
                self.execute_in_session(session, command)?
            }
            _ => self.transmit(command)?,
        };
        response.ensure_success(ordinal)?;
        Ok(response)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("failed to release context: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedTpm;

    #[test]
    fn test_handles_are_context_scoped() {
        let sim = SimulatedTpm::new();
        let mut a = Context::with_device(sim.clone(), ContextConfig::default()).unwrap();
        let mut b = Context::with_device(sim, ContextConfig::default()).unwrap();

        let key = a.create_key_object(KeyFlags::storage());
        let err = b.public_key(key).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::InvalidHandle);
        let policy = a.create_policy(PolicyUsage::Usage);
        assert!(b.flush_secret(policy).is_err());
        assert!(a.flush_secret(policy).is_ok());
    }

    #[test]
    fn test_srk_is_loaded_and_bound() {
        let ctx = Context::with_device(SimulatedTpm::new(), ContextConfig::default()).unwrap();
        assert!(ctx.is_loaded(ctx.srk()).unwrap());
        assert!(ctx.policy_of(PolicyTarget::Key(ctx.srk())).unwrap().is_some());
        assert_ne!(ctx.owner_policy(), ctx.default_policy());
    }

    #[test]
    fn test_close_flushes_loaded_keys() {
        let sim = SimulatedTpm::new();
        let mut ctx = Context::with_device(sim.clone(), ContextConfig::default()).unwrap();
        ctx.set_srk_secret_well_known().unwrap();
        let key = ctx.create_key_object(KeyFlags::storage());
        ctx.create_key(key, ctx.srk()).unwrap();
        ctx.load_key(key, ctx.srk()).unwrap();
        assert_eq!(sim.loaded_key_count(), 1);

        ctx.close().unwrap();
        assert_eq!(sim.loaded_key_count(), 0);
    }
}
