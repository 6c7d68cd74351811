// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Key hierarchy resolution
//!
//! Loading a registered key walks its stored parent links toward the SRK,
//! loading each missing ancestor first. Loading a key takes its parent's
//! secret; when that secret is not held the walk stops and hands back a
//! [`LoadAuthChallenge`] for the parent. Ancestors loaded before the stop stay
//! loaded, so the retry resumes where the walk stopped.

use tracing::debug;

use crate::auth::{fresh_nonce, AuthValue};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::policy::PolicyTarget;
use crate::types::*;

impl Context {
    /// Authorization value for using `key`, if the secret is held.
    ///
    /// Keys that never require authorization use the well-known value. Others
    /// use their bound policy, or the default policy when none is bound.
    pub(crate) fn key_auth(&self, key: KeyHandle) -> Result<Option<AuthValue>> {
        let k = self.key(key)?;
        if !k.flags.requires_auth {
            return Ok(Some(AuthValue::well_known()));
        }
        let policy = k.policy.unwrap_or(self.default_policy);
        Ok(self.policy(policy)?.secret.clone())
    }

    /// Like [`key_auth`](Self::key_auth), but a missing secret becomes
    /// [`Error::AuthorizationRequired`]
    pub(crate) fn require_key_auth(&mut self, key: KeyHandle) -> Result<AuthValue> {
        match self.key_auth(key)? {
            Some(auth) => Ok(auth),
            None => Err(Error::AuthorizationRequired(self.issue_challenge(key)?)),
        }
    }

    fn issue_challenge(&mut self, key: KeyHandle) -> Result<LoadAuthChallenge> {
        let id = self.key(key)?.id;
        let nonce = fresh_nonce();
        self.challenges.insert(key, nonce);
        let challenge = LoadAuthChallenge { key, id, nonce };
        debug!("authorization needed: {challenge}");
        Ok(challenge)
    }

    /// Load a key, bringing in any unloaded ancestors first
    pub fn load(&mut self, key: KeyRef) -> Result<Resolution> {
        match key {
            KeyRef::Uuid(ps, uuid) => {
                let mut path = Vec::new();
                self.resolve_uuid(ps, uuid, &mut path)
            }
            KeyRef::Handle(key) => self.resolve_handle(key),
        }
    }

    pub fn load_key_by_uuid(&mut self, ps: impl IntoPsType, uuid: KeyUuid) -> Result<Resolution> {
        let ps = ps.into_ps_type()?;
        self.load(KeyRef::Uuid(ps, uuid))
    }

    /// Answer a challenge with a policy holding the missing secret.
    ///
    /// The policy is bound to the challenged key; repeat the original load
    /// afterwards.
    pub fn supply_auth(&mut self, challenge: &LoadAuthChallenge, policy: PolicyHandle) -> Result<()> {
        match self.challenges.get(&challenge.key) {
            Some(nonce) if *nonce == challenge.nonce => {}
            _ => {
                return Err(Error::bad_parameter(format!(
                    "no outstanding challenge matches {challenge}"
                )))
            }
        }
        if self.policy(policy)?.secret.is_none() {
            return Err(Error::bad_parameter(format!("{policy} has no secret")));
        }
        self.assign_policy(policy, PolicyTarget::Key(challenge.key))?;
        self.challenges.remove(&challenge.key);
        debug!("authorization supplied for {}", challenge.key);
        Ok(())
    }

    fn resolve_handle(&mut self, key: KeyHandle) -> Result<Resolution> {
        let (loaded, id, parent_id) = {
            let k = self.key(key)?;
            (k.tpm_handle.is_some(), k.id, k.parent_id)
        };
        if loaded {
            return Ok(Resolution::Loaded(key));
        }
        if let Some((ps, uuid)) = id {
            if self.by_uuid.get(&(ps, uuid)) == Some(&key) {
                return self.load(KeyRef::Uuid(ps, uuid));
            }
        }
        let Some((parent_ps, parent_uuid)) = parent_id else {
            return Err(Error::bad_parameter(format!(
                "{key} has no registered parent; load it with an explicit parent"
            )));
        };
        let mut path = Vec::new();
        match self.resolve_uuid(parent_ps, parent_uuid, &mut path)? {
            Resolution::Loaded(parent) => self.load_under(key, parent),
            pending => Ok(pending),
        }
    }

    fn resolve_uuid(
        &mut self,
        ps: PsType,
        uuid: KeyUuid,
        path: &mut Vec<(PsType, KeyUuid)>,
    ) -> Result<Resolution> {
        if path.contains(&(ps, uuid)) {
            return Err(Error::HierarchyCycle { uuid });
        }
        let key = self.get_registered_key_by_uuid(ps, uuid)?;
        if self.key(key)?.tpm_handle.is_some() {
            return Ok(Resolution::Loaded(key));
        }
        let Some((parent_ps, parent_uuid)) = self.key(key)?.parent_id else {
            return Err(Error::NotRegistered { ps, uuid });
        };

        path.push((ps, uuid));
        debug!("resolving {uuid}: parent {parent_uuid} first");
        match self.resolve_uuid(parent_ps, parent_uuid, path)? {
            Resolution::Loaded(parent) => self.load_under(key, parent),
            pending => Ok(pending),
        }
    }

    fn load_under(&mut self, key: KeyHandle, parent: KeyHandle) -> Result<Resolution> {
        let Some(parent_auth) = self.key_auth(parent)? else {
            return Ok(Resolution::NeedsAuth(self.issue_challenge(parent)?));
        };
        self.load_with_auth(key, parent, &parent_auth)?;
        debug!("loaded {key} under {parent}");
        Ok(Resolution::Loaded(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ContextConfig;
    use crate::policy::{PolicyUsage, SecretMode};
    use crate::sim::SimulatedTpm;
    use crate::ErrorKind;

    #[test]
    fn test_srk_secret_challenge() {
        let mut ctx = Context::with_device(SimulatedTpm::new(), ContextConfig::default()).unwrap();
        let key = ctx.create_key_object(KeyFlags::storage());
        let srk = ctx.srk();

        let err = ctx.create_key(key, srk).unwrap_err();
        let Error::AuthorizationRequired(challenge) = err else {
            panic!("expected a challenge, got {err:?}");
        };
        assert_eq!(challenge.key(), srk);
        assert_eq!(challenge.uuid(), Some(KeyUuid::SRK));
    }

    #[test]
    fn test_stale_challenge_rejected() {
        let mut ctx = Context::with_device(SimulatedTpm::new(), ContextConfig::default()).unwrap();
        let key = ctx.create_key_object(KeyFlags::storage());
        let srk = ctx.srk();
        let Err(Error::AuthorizationRequired(first)) = ctx.create_key(key, srk) else {
            panic!("expected a challenge");
        };
        let Err(Error::AuthorizationRequired(second)) = ctx.create_key(key, srk) else {
            panic!("expected a challenge");
        };

        let policy = ctx.create_policy(PolicyUsage::Usage);
        ctx.set_secret(policy, SecretMode::Sha1, &[0u8; 20]).unwrap();
        let err = ctx.supply_auth(&first, policy).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadParameter);
        ctx.supply_auth(&second, policy).unwrap();
        ctx.create_key(key, srk).unwrap();
    }

    #[test]
    fn test_supply_auth_needs_secret() {
        let mut ctx = Context::with_device(SimulatedTpm::new(), ContextConfig::default()).unwrap();
        let key = ctx.create_key_object(KeyFlags::storage());
        let srk = ctx.srk();
        let Err(Error::AuthorizationRequired(challenge)) = ctx.create_key(key, srk) else {
            panic!("expected a challenge");
        };
        let empty = ctx.create_policy(PolicyUsage::Usage);
        assert!(ctx.supply_auth(&challenge, empty).is_err());
    }

    #[test]
    fn test_unknown_uuid_is_invalid_handle() {
        let mut ctx = Context::with_device(SimulatedTpm::new(), ContextConfig::default()).unwrap();
        let err = ctx
            .load_key_by_uuid(PsType::User, KeyUuid::random())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidHandle);
    }

    #[test]
    fn test_srk_resolves_without_device() {
        let sim = SimulatedTpm::new();
        let mut ctx = Context::with_device(sim.clone(), ContextConfig::default()).unwrap();
        let before = sim.command_count();
        let resolution = ctx.load_key_by_uuid(PsType::System, KeyUuid::SRK).unwrap();
        assert_eq!(resolution, Resolution::Loaded(ctx.srk()));
        assert_eq!(sim.command_count(), before);
    }
}
