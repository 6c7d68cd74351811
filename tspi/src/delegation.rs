// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Owner delegation: families and the delegate table
//!
//! Family slots are a fixed device resource. Every family created here must
//! be invalidated again on every exit path; [`Context::with_family`] does that
//! for scoped use.

use tracing::{debug, info, warn};

use crate::constants::*;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::types::*;

/// Device table sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegationCapacity {
    pub family_rows: u32,
    pub delegate_rows: u32,
}

/// What a delegation grants use of
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationTarget {
    Owner,
    Key(KeyHandle),
}

#[derive(Debug)]
pub(crate) struct Family {
    label: u8,
    family_id: u32,
    enabled: bool,
    valid: bool,
}

impl Context {
    fn family(&self, family: FamilyHandle) -> Result<&Family> {
        self.families
            .get(family.0)
            .ok_or_else(|| Error::invalid_handle(format!("{family} is not a delegation family")))
    }

    fn family_mut(&mut self, family: FamilyHandle) -> Result<&mut Family> {
        self.families
            .get_mut(family.0)
            .ok_or_else(|| Error::invalid_handle(format!("{family} is not a delegation family")))
    }

    /// Family and delegate table sizes reported by the device
    pub fn delegation_capacity(&mut self) -> Result<DelegationCapacity> {
        if let Some(capacity) = self.capacity {
            return Ok(capacity);
        }
        let capacity = DelegationCapacity {
            family_rows: self.tpm_get_capability_property(tpm_cap::PROP_FAMILY_ROWS)?,
            delegate_rows: self.tpm_get_capability_property(tpm_cap::PROP_DELEGATE_ROWS)?,
        };
        debug!(?capacity, "delegation table capacity");
        self.capacity = Some(capacity);
        Ok(capacity)
    }

    pub fn family_id(&self, family: FamilyHandle) -> Result<u32> {
        Ok(self.family(family)?.family_id)
    }

    pub fn family_label(&self, family: FamilyHandle) -> Result<u8> {
        Ok(self.family(family)?.label)
    }

    pub fn family_enabled(&self, family: FamilyHandle) -> Result<bool> {
        Ok(self.family(family)?.enabled)
    }

    /// Whether the family still holds a device slot
    pub fn family_valid(&self, family: FamilyHandle) -> Result<bool> {
        Ok(self.family(family)?.valid)
    }

    /// Claim a family slot on the device under owner authorization
    pub fn create_family(&mut self, label: u8) -> Result<FamilyHandle> {
        if self
            .families
            .iter()
            .any(|(_, f)| f.valid && f.label == label)
        {
            return Err(Error::bad_parameter(format!(
                "family label {label} is already in use"
            )));
        }
        let owner_auth = self.owner_auth()?;
        let reply = match self.tpm_delegate_manage(&owner_auth, 0, FamilyOp::Create, &[label]) {
            Ok(reply) => reply,
            Err(e) if e.code() == Some(tpm_rc::NOSPACE) => return Err(Error::NoFreeFamilySlot),
            Err(e) => return Err(e),
        };
        let family_id: [u8; 4] = reply.as_slice().try_into().map_err(|_| {
            Error::protocol(format!("family id: expected 4 bytes, got {}", reply.len()))
        })?;
        let family_id = u32::from_be_bytes(family_id);

        let family = FamilyHandle(self.families.insert(Family {
            label,
            family_id,
            enabled: false,
            valid: true,
        }));
        info!("created delegation family {family_id} (label {label})");
        Ok(family)
    }

    pub fn set_family_state(&mut self, family: FamilyHandle, enabled: bool) -> Result<()> {
        let f = self.family(family)?;
        if !f.valid {
            return Err(Error::invalid_handle(format!("{family} was invalidated")));
        }
        let family_id = f.family_id;
        let owner_auth = self.owner_auth()?;
        self.tpm_delegate_manage(&owner_auth, family_id, FamilyOp::Enable, &[enabled as u8])?;
        self.family_mut(family)?.enabled = enabled;
        debug!("family {family_id} enabled: {enabled}");
        Ok(())
    }

    /// Create a delegation blob in `family`, protected by the secret of `policy`.
    ///
    /// The blob is labelled with the family label and also kept on the policy.
    pub fn create_delegation(
        &mut self,
        family: FamilyHandle,
        policy: PolicyHandle,
        target: DelegationTarget,
        per1: u32,
        per2: u32,
    ) -> Result<DelegationBlob> {
        let f = self.family(family)?;
        if !f.valid {
            return Err(Error::invalid_handle(format!("{family} was invalidated")));
        }
        let (label, family_id) = (f.label, f.family_id);
        let delegate_auth = self
            .policy(policy)?
            .secret
            .clone()
            .ok_or_else(|| Error::bad_parameter(format!("{policy} has no secret")))?;

        let data = match target {
            DelegationTarget::Owner => {
                let owner_auth = self.owner_auth()?;
                self.tpm_create_delegation(
                    None,
                    &owner_auth,
                    false,
                    label,
                    family_id,
                    per1,
                    per2,
                    &delegate_auth,
                )?
            }
            DelegationTarget::Key(key) => {
                let handle = self.loaded_handle(key)?;
                let key_auth = self.require_key_auth(key)?;
                self.tpm_create_delegation(
                    Some(handle),
                    &key_auth,
                    false,
                    label,
                    family_id,
                    per1,
                    per2,
                    &delegate_auth,
                )?
            }
        };
        let blob = DelegationBlob::from_bytes(data)?;
        self.policy_mut(policy)?.delegation = Some(blob.clone());
        debug!(
            "created {:?} delegation in family {family_id}",
            blob.scope()
        );
        Ok(blob)
    }

    /// Store an owner delegation in table row `row`.
    ///
    /// Without `overwrite` an occupied row is left alone and
    /// [`Error::RowOccupied`] is returned.
    pub fn cache(&mut self, row: u32, blob: &DelegationBlob, overwrite: bool) -> Result<()> {
        if blob.scope() != DelegateScope::Owner {
            return Err(Error::bad_parameter(
                "only owner delegations can be cached in the delegate table",
            ));
        }
        let capacity = self.delegation_capacity()?;
        if row >= capacity.delegate_rows {
            return Err(Error::bad_parameter(format!(
                "row {row} is outside the delegate table ({} rows)",
                capacity.delegate_rows
            )));
        }
        if !overwrite && self.read_tables()?.row(row).is_some() {
            return Err(Error::RowOccupied { row });
        }
        let owner_auth = self.owner_auth()?;
        self.tpm_load_owner_delegation(&owner_auth, row, blob.as_bytes())?;
        info!("cached delegation of family {} in row {row}", blob.family_id());
        Ok(())
    }

    /// Copies of the family table and the occupied delegate rows
    pub fn read_tables(&mut self) -> Result<DelegationTables> {
        self.tpm_read_table()
    }

    /// Give the family slot back to the device.
    ///
    /// Calling this on a family that is already invalid, or that the device no
    /// longer knows, succeeds without effect.
    pub fn invalidate(&mut self, family: FamilyHandle) -> Result<()> {
        let f = self.family(family)?;
        if !f.valid {
            return Ok(());
        }
        let family_id = f.family_id;
        let owner_auth = self.owner_auth()?;
        match self.tpm_delegate_manage(&owner_auth, family_id, FamilyOp::Invalidate, &[]) {
            Ok(_) => info!("invalidated delegation family {family_id}"),
            Err(e) if e.code() == Some(tpm_rc::BADINDEX) => {
                debug!("family {family_id} already gone on the device")
            }
            Err(e) => return Err(e),
        }
        let f = self.family_mut(family)?;
        f.valid = false;
        f.enabled = false;
        Ok(())
    }

    /// Run `f` with a fresh family that is invalidated however `f` returns
    pub fn with_family<T>(
        &mut self,
        label: u8,
        f: impl FnOnce(&mut Context, FamilyHandle) -> Result<T>,
    ) -> Result<T> {
        let family = self.create_family(label)?;
        let result = f(self, family);
        match (self.invalidate(family), result) {
            (Ok(()), result) => result,
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(original)) => {
                warn!("failed to invalidate family {family}: {e}");
                Err(original)
            }
        }
    }
}
