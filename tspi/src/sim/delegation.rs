// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Family and delegate tables

use super::{sized, RcResult, Request, SimState};
use crate::auth::{hmac_sha256, AuthValue, Nonce, AUTH_SIZE};
use crate::constants::*;
use crate::marshal::{Marshal, ResponseBuffer, Unmarshal};
use crate::types::{DelegateEntry, DelegatePublic, DelegationTables, FamilyEntry};

pub(super) struct SimFamily {
    label: u8,
    family_id: u32,
    verification_count: u32,
    flags: u32,
}

pub(super) struct SimDelegate {
    public: DelegatePublic,
}

/// Device-sealed delegation blob: public part, seal nonce, sealed secret and
/// an integrity tag over all three
struct SealedDelegation {
    public: DelegatePublic,
    nonce: Nonce,
    sealed: [u8; AUTH_SIZE],
}

impl SealedDelegation {
    fn tag(&self, blob_key: &[u8; 32]) -> [u8; 32] {
        hmac_sha256(
            blob_key,
            &[
                self.public.to_bytes().as_slice(),
                self.nonce.as_slice(),
                self.sealed.as_slice(),
            ],
        )
    }

    fn seal(public: DelegatePublic, auth: &AuthValue, blob_key: &[u8; 32]) -> Vec<u8> {
        let nonce: Nonce = rand::random();
        let sealed = auth.seal(&AuthValue::from_digest(blob_key_auth(blob_key)), &nonce);
        let blob = Self {
            public,
            nonce,
            sealed,
        };
        let mut out = public.to_bytes();
        out.extend_from_slice(&blob.nonce);
        out.extend_from_slice(&blob.sealed);
        out.extend_from_slice(&blob.tag(blob_key));
        out
    }

    fn open(data: &[u8], blob_key: &[u8; 32]) -> RcResult<(DelegatePublic, AuthValue)> {
        let mut buf = ResponseBuffer::new(data);
        let public = DelegatePublic::unmarshal(&mut buf).map_err(|_| tpm_rc::BAD_PARAMETER)?;
        let nonce: Nonce = buf.get_array().map_err(|_| tpm_rc::BAD_PARAMETER)?;
        let sealed: [u8; AUTH_SIZE] = buf.get_array().map_err(|_| tpm_rc::BAD_PARAMETER)?;
        let tag: [u8; 32] = buf.get_array().map_err(|_| tpm_rc::BAD_PARAMETER)?;
        buf.finish().map_err(|_| tpm_rc::BAD_PARAMETER)?;

        let blob = Self {
            public,
            nonce,
            sealed,
        };
        if blob.tag(blob_key) != tag {
            return Err(tpm_rc::BAD_PARAMETER);
        }
        let shared = AuthValue::from_digest(blob_key_auth(blob_key));
        Ok((public, AuthValue::unseal(&sealed, &shared, &nonce)))
    }
}

fn blob_key_auth(blob_key: &[u8; 32]) -> [u8; AUTH_SIZE] {
    let mut out = [0u8; AUTH_SIZE];
    out.copy_from_slice(&blob_key[..AUTH_SIZE]);
    out
}

impl SimState {
    fn family_slot(&mut self, family_id: u32) -> RcResult<&mut SimFamily> {
        self.families
            .iter_mut()
            .flatten()
            .find(|f| f.family_id == family_id)
            .ok_or(tpm_rc::BADINDEX)
    }

    pub(super) fn delegate_manage(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let family_id = p.u32()?;
        let op = p.u32()?;
        let data = p.sized()?;
        p.finish()?;
        self.verify_owner(request)?;

        let op = FamilyOp::from_u32(op).ok_or(tpm_rc::BAD_PARAMETER)?;
        let flag = |data: &[u8]| match data {
            [v] => Ok(*v != 0),
            _ => Err(tpm_rc::BAD_PARAMETER),
        };
        match op {
            FamilyOp::Create => {
                let [label] = data.as_slice() else {
                    return Err(tpm_rc::BAD_PARAMETER);
                };
                let slot = self
                    .families
                    .iter_mut()
                    .find(|slot| slot.is_none())
                    .ok_or(tpm_rc::NOSPACE)?;
                let family_id = self.next_family_id;
                *slot = Some(SimFamily {
                    label: *label,
                    family_id,
                    verification_count: 0,
                    flags: 0,
                });
                self.next_family_id += 1;
                Ok(sized(&family_id.to_be_bytes()))
            }
            FamilyOp::Enable => {
                let enable = flag(&data)?;
                let family = self.family_slot(family_id)?;
                if family.flags & family_flags::ADMIN_LOCK != 0 {
                    return Err(tpm_rc::DELEGATE_FAMILY);
                }
                if enable {
                    family.flags |= family_flags::ENABLE;
                } else {
                    family.flags &= !family_flags::ENABLE;
                }
                Ok(sized(&[]))
            }
            FamilyOp::Admin => {
                let lock = flag(&data)?;
                let family = self.family_slot(family_id)?;
                if lock {
                    family.flags |= family_flags::ADMIN_LOCK;
                }
                Ok(sized(&[]))
            }
            FamilyOp::Invalidate => {
                let slot = self
                    .families
                    .iter_mut()
                    .find(|slot| matches!(slot, Some(f) if f.family_id == family_id))
                    .ok_or(tpm_rc::BADINDEX)?;
                *slot = None;
                // Rows of a dead family are no longer usable
                for row in self.delegates.iter_mut() {
                    if matches!(row, Some(d) if d.public.family_id == family_id) {
                        *row = None;
                    }
                }
                Ok(sized(&[]))
            }
        }
    }

    pub(super) fn create_delegation(
        &mut self,
        request: &Request<'_>,
        for_key: bool,
    ) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let key = if for_key { Some(p.u32()?) } else { None };
        let increment = p.u8()? != 0;
        let label = p.u8()?;
        let family_id = p.u32()?;
        let per1 = p.u32()?;
        let per2 = p.u32()?;
        let enc_auth = p.array()?;
        p.finish()?;

        request.expect_auths(1)?;
        let (scope, shared) = match key {
            Some(handle) => {
                let id = self.loaded_object(handle)?;
                self.verify_key(request, 0, &id)?;
                (DelegateScope::Key, self.object(&id)?.usage_auth.clone())
            }
            None => {
                self.verify_owner(request)?;
                (DelegateScope::Owner, self.config.owner_auth.clone())
            }
        };
        let delegate_auth = AuthValue::unseal(&enc_auth, &shared, request.nonce(0)?);

        let family = self.family_slot(family_id)?;
        if family.flags & family_flags::ENABLE == 0 {
            return Err(tpm_rc::DELEGATE_FAMILY);
        }
        if increment {
            family.verification_count += 1;
        }
        let public = DelegatePublic {
            scope,
            label,
            family_id,
            verification_count: family.verification_count,
            per1,
            per2,
        };
        let blob = SealedDelegation::seal(public, &delegate_auth, &self.blob_key);
        Ok(sized(&blob))
    }

    /// Overwrites the row unconditionally
    pub(super) fn load_owner_delegation(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let row = p.u32()?;
        let blob = p.sized()?;
        p.finish()?;
        self.verify_owner(request)?;

        if row as usize >= self.delegates.len() {
            return Err(tpm_rc::BADINDEX);
        }
        let (public, _) = SealedDelegation::open(&blob, &self.blob_key)?;
        if public.scope != DelegateScope::Owner {
            return Err(tpm_rc::BAD_PARAMETER);
        }
        let family = self.family_slot(public.family_id).map_err(|_| tpm_rc::DELEGATE_FAMILY)?;
        if family.verification_count != public.verification_count {
            return Err(tpm_rc::DELEGATE_FAMILY);
        }
        self.delegates[row as usize] = Some(SimDelegate { public });
        Ok(Vec::new())
    }

    pub(super) fn read_table(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        request.params().finish()?;
        request.expect_auths(0)?;
        let tables = DelegationTables {
            families: self
                .families
                .iter()
                .flatten()
                .map(|f| FamilyEntry {
                    label: f.label,
                    family_id: f.family_id,
                    verification_count: f.verification_count,
                    flags: f.flags,
                })
                .collect(),
            delegates: self
                .delegates
                .iter()
                .enumerate()
                .filter_map(|(row, d)| {
                    d.as_ref().map(|d| DelegateEntry {
                        row: row as u32,
                        public: d.public,
                    })
                })
                .collect(),
        };
        Ok(tables.to_bytes())
    }
}
