// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Policy objects: an authorization secret plus what it is bound to

use tracing::debug;

use crate::auth::{sha1, AuthValue, AUTH_SIZE};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::{DelegationBlob, KeyHandle, PolicyHandle};

/// Secret of keys and owners that were never given a real one
pub const WELL_KNOWN_SECRET: [u8; AUTH_SIZE] = [0u8; AUTH_SIZE];

/// How the caller-supplied secret bytes become an authorization value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretMode {
    /// Arbitrary bytes, hashed with SHA-1
    Plain,
    /// Already a 20-byte SHA-1 digest, used as-is
    Sha1,
}

/// What a policy authorizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyUsage {
    /// Device-owner privilege
    Owner,
    /// Use of a single key
    Usage,
}

/// Binding point of a policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyTarget {
    Owner,
    Key(KeyHandle),
}

#[derive(Debug)]
pub(crate) struct Policy {
    pub(crate) usage: PolicyUsage,
    pub(crate) mode: Option<SecretMode>,
    pub(crate) secret: Option<AuthValue>,
    pub(crate) bound: Option<PolicyTarget>,
    pub(crate) delegation: Option<DelegationBlob>,
}

impl Policy {
    pub(crate) fn new(usage: PolicyUsage) -> Self {
        Self {
            usage,
            mode: None,
            secret: None,
            bound: None,
            delegation: None,
        }
    }
}

/// Turn caller bytes into the 20-byte authorization value
pub fn derive_auth(mode: SecretMode, secret: &[u8]) -> Result<AuthValue> {
    match mode {
        SecretMode::Plain => Ok(AuthValue::from_digest(sha1(&[secret]))),
        SecretMode::Sha1 => {
            let digest: [u8; AUTH_SIZE] = secret.try_into().map_err(|_| {
                Error::bad_parameter(format!(
                    "SHA-1 mode secret must be {AUTH_SIZE} bytes, got {}",
                    secret.len()
                ))
            })?;
            Ok(AuthValue::from_digest(digest))
        }
    }
}

impl Context {
    pub(crate) fn policy(&self, policy: PolicyHandle) -> Result<&Policy> {
        self.policies
            .get(policy.0)
            .ok_or_else(|| Error::invalid_handle(format!("{policy} is not a live policy")))
    }

    pub(crate) fn policy_mut(&mut self, policy: PolicyHandle) -> Result<&mut Policy> {
        self.policies
            .get_mut(policy.0)
            .ok_or_else(|| Error::invalid_handle(format!("{policy} is not a live policy")))
    }

    /// Create an unbound policy with no secret
    pub fn create_policy(&mut self, usage: PolicyUsage) -> PolicyHandle {
        PolicyHandle(self.policies.insert(Policy::new(usage)))
    }

    /// Destroy a policy, detaching it and zeroing its secret
    pub fn close_policy(&mut self, policy: PolicyHandle) -> Result<()> {
        if policy == self.owner_policy || policy == self.default_policy {
            return Err(Error::bad_parameter(
                "the owner and default policies live as long as the context",
            ));
        }
        self.detach_policy(policy)?;
        // Dropping the policy zeroes the auth value
        self.policies.remove(policy.0);
        Ok(())
    }

    pub fn set_secret(&mut self, policy: PolicyHandle, mode: SecretMode, secret: &[u8]) -> Result<()> {
        let auth = derive_auth(mode, secret)?;
        let p = self.policy_mut(policy)?;
        p.mode = Some(mode);
        p.secret = Some(auth);
        debug!(%policy, ?mode, "policy secret set");
        Ok(())
    }

    pub fn flush_secret(&mut self, policy: PolicyHandle) -> Result<()> {
        let p = self.policy_mut(policy)?;
        p.mode = None;
        p.secret = None;
        Ok(())
    }

    pub fn secret_mode(&self, policy: PolicyHandle) -> Result<Option<SecretMode>> {
        Ok(self.policy(policy)?.mode)
    }

    pub fn policy_usage(&self, policy: PolicyHandle) -> Result<PolicyUsage> {
        Ok(self.policy(policy)?.usage)
    }

    /// Bind `policy` to `target`.
    ///
    /// Any previous binding of the policy, and any policy previously bound to
    /// the target, is released first.
    pub fn assign_policy(&mut self, policy: PolicyHandle, target: PolicyTarget) -> Result<()> {
        self.policy(policy)?;
        if let PolicyTarget::Key(key) = target {
            self.key(key)?;
        }
        self.detach_policy(policy)?;

        match target {
            PolicyTarget::Owner => {
                let previous = std::mem::replace(&mut self.owner_policy, policy);
                if previous != policy {
                    if let Some(p) = self.policies.get_mut(previous.0) {
                        p.bound = None;
                    }
                }
            }
            PolicyTarget::Key(key) => {
                let previous = self.key_mut(key)?.policy.replace(policy);
                if let Some(previous) = previous.filter(|p| *p != policy) {
                    if let Some(p) = self.policies.get_mut(previous.0) {
                        p.bound = None;
                    }
                }
            }
        }
        self.policy_mut(policy)?.bound = Some(target);
        debug!(%policy, ?target, "policy assigned");
        Ok(())
    }

    /// The policy currently bound to `target`, if any
    pub fn policy_of(&self, target: PolicyTarget) -> Result<Option<PolicyHandle>> {
        match target {
            PolicyTarget::Owner => Ok(Some(self.owner_policy)),
            PolicyTarget::Key(key) => Ok(self.key(key)?.policy),
        }
    }

    pub fn owner_policy(&self) -> PolicyHandle {
        self.owner_policy
    }

    pub fn default_policy(&self) -> PolicyHandle {
        self.default_policy
    }

    /// The delegation blob last created under `policy`
    pub fn policy_delegation(&self, policy: PolicyHandle) -> Result<Option<DelegationBlob>> {
        Ok(self.policy(policy)?.delegation.clone())
    }

    fn detach_policy(&mut self, policy: PolicyHandle) -> Result<()> {
        let bound = self.policy_mut(policy)?.bound.take();
        if let Some(PolicyTarget::Key(key)) = bound {
            if let Ok(k) = self.key_mut(key) {
                if k.policy == Some(policy) {
                    k.policy = None;
                }
            }
        }
        Ok(())
    }

    /// Current authorization value of the owner, if its secret is set
    pub(crate) fn owner_auth(&self) -> Result<AuthValue> {
        self.policy(self.owner_policy)?
            .secret
            .clone()
            .ok_or(Error::OwnerAuthRequired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_secret_is_hashed() {
        let auth = derive_auth(SecretMode::Plain, b"password").unwrap();
        assert_eq!(auth.as_bytes(), &sha1(&[b"password"]));
    }

    #[test]
    fn test_sha1_secret_length_checked() {
        assert!(derive_auth(SecretMode::Sha1, &WELL_KNOWN_SECRET).is_ok());
        let err = derive_auth(SecretMode::Sha1, b"short").unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadParameter);
    }
}
