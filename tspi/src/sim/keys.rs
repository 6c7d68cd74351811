// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Wrapped keys and load slots

use tracing::trace;

use super::{sized, RcResult, Request, SimState};
use crate::auth::AuthValue;
use crate::constants::*;
use crate::marshal::{Marshal, Unmarshal};
use crate::types::KeyBlob;

/// Device-side identity of a wrapped key; travels as the blob's private part
pub(super) type ObjectId = [u8; 16];

pub(super) const SRK_OBJECT: ObjectId = [0u8; 16];

const MIN_KEY_BITS: u32 = 512;
const MAX_KEY_BITS: u32 = 4096;

#[derive(Clone)]
pub(super) struct SimKey {
    pub(super) usage: KeyUsage,
    flags: u32,
    auth_usage: u8,
    key_bits: u32,
    pub_key: Vec<u8>,
    /// Stands in for the private key when signing
    pub(super) private: [u8; 32],
    pub(super) usage_auth: AuthValue,
    parent: ObjectId,
}

impl SimKey {
    pub(super) fn srk(usage_auth: AuthValue) -> Self {
        Self {
            usage: KeyUsage::Storage,
            flags: 0,
            auth_usage: auth_usage::ALWAYS,
            key_bits: 2048,
            pub_key: random_bytes(256),
            private: rand::random(),
            usage_auth,
            parent: SRK_OBJECT,
        }
    }

    fn blob(&self, id: &ObjectId) -> Vec<u8> {
        KeyBlob {
            usage: self.usage,
            flags: self.flags,
            auth_usage: self.auth_usage,
            key_bits: self.key_bits,
            pub_key: self.pub_key.clone(),
            enc_data: id.to_vec(),
        }
        .to_bytes()
    }
}

fn random_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random::<u8>()).collect()
}

impl SimState {
    /// Object behind a loaded handle
    pub(super) fn loaded_object(&self, handle: u32) -> RcResult<ObjectId> {
        if handle == tpm_kh::SRK {
            return Ok(SRK_OBJECT);
        }
        self.loaded
            .get(&handle)
            .copied()
            .ok_or(tpm_rc::INVALID_KEYHANDLE)
    }

    pub(super) fn object(&self, id: &ObjectId) -> RcResult<&SimKey> {
        self.objects.get(id).ok_or(tpm_rc::INVALID_KEYHANDLE)
    }

    /// Check trailer `index` for use of `id`; keys without auth accept any
    pub(super) fn verify_key(&self, request: &Request<'_>, index: usize, id: &ObjectId) -> RcResult<()> {
        let key = self.object(id)?;
        if key.auth_usage == auth_usage::NEVER {
            request.nonce(index)?;
            return Ok(());
        }
        request.verify(index, &key.usage_auth)
    }

    /// Resolve a blob produced under `parent`
    fn unwrap_blob(&self, blob: &[u8], parent: &ObjectId) -> RcResult<ObjectId> {
        let parsed = KeyBlob::from_bytes(blob).map_err(|_| tpm_rc::BAD_PARAMETER)?;
        let id: ObjectId = parsed
            .enc_data
            .as_slice()
            .try_into()
            .map_err(|_| tpm_rc::DECRYPT_ERROR)?;
        match self.objects.get(&id) {
            Some(key) if key.parent == *parent && id != SRK_OBJECT => Ok(id),
            _ => Err(tpm_rc::DECRYPT_ERROR),
        }
    }

    pub(super) fn create_wrap_key(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let parent_handle = p.u32()?;
        let enc_auth = p.array()?;
        let usage = p.u16()?;
        let flags = p.u32()?;
        let key_auth_usage = p.u8()?;
        let key_bits = p.u32()?;
        p.finish()?;

        request.expect_auths(1)?;
        let parent = self.loaded_object(parent_handle)?;
        self.verify_key(request, 0, &parent)?;
        let parent_key = self.object(&parent)?;
        if parent_key.usage != KeyUsage::Storage {
            return Err(tpm_rc::INVALID_KEYUSAGE);
        }
        let usage = KeyUsage::from_u16(usage).ok_or(tpm_rc::BAD_PARAMETER)?;
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&key_bits) || key_bits % 8 != 0 {
            return Err(tpm_rc::BAD_PARAMETER);
        }
        if key_auth_usage != auth_usage::NEVER && key_auth_usage != auth_usage::ALWAYS {
            return Err(tpm_rc::BAD_PARAMETER);
        }
        let usage_auth = AuthValue::unseal(&enc_auth, &parent_key.usage_auth, request.nonce(0)?);

        let key = SimKey {
            usage,
            flags,
            auth_usage: key_auth_usage,
            key_bits,
            pub_key: random_bytes(key_bits as usize / 8),
            private: rand::random(),
            usage_auth,
            parent,
        };
        let id: ObjectId = rand::random();
        let blob = key.blob(&id);
        self.objects.insert(id, key);
        trace!("wrapped new {usage:?} key");
        Ok(sized(&blob))
    }

    pub(super) fn load_key2(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let parent_handle = p.u32()?;
        let blob = p.sized()?;
        p.finish()?;

        request.expect_auths(1)?;
        let parent = self.loaded_object(parent_handle)?;
        self.verify_key(request, 0, &parent)?;
        let id = self.unwrap_blob(&blob, &parent)?;
        if self.loaded.len() >= self.config.max_keys as usize {
            return Err(tpm_rc::RESOURCES);
        }
        let handle = self.next_key_handle;
        self.next_key_handle += 1;
        self.loaded.insert(handle, id);
        Ok(handle.to_be_bytes().to_vec())
    }

    pub(super) fn flush_specific(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let handle = p.u32()?;
        let resource_type = p.u32()?;
        p.finish()?;

        match resource_type {
            tpm_rt::KEY if handle == tpm_kh::SRK => Err(tpm_rc::BAD_PARAMETER),
            tpm_rt::KEY => self
                .loaded
                .remove(&handle)
                .map(|_| Vec::new())
                .ok_or(tpm_rc::INVALID_KEYHANDLE),
            tpm_rt::TRANS => self
                .transports
                .remove(&handle)
                .map(|_| Vec::new())
                .ok_or(tpm_rc::INVALID_AUTHHANDLE),
            _ => Err(tpm_rc::BAD_PARAMETER),
        }
    }

    /// New blob for the same key material under a new secret; the old blob
    /// stays usable
    pub(super) fn change_auth(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let parent_handle = p.u32()?;
        let enc_new_auth = p.array()?;
        let blob = p.sized()?;
        p.finish()?;

        request.expect_auths(2)?;
        let parent = self.loaded_object(parent_handle)?;
        self.verify_key(request, 0, &parent)?;
        let id = self.unwrap_blob(&blob, &parent)?;
        self.verify_key(request, 1, &id)?;

        let parent_auth = &self.object(&parent)?.usage_auth;
        let new_auth = AuthValue::unseal(&enc_new_auth, parent_auth, request.nonce(0)?);
        let mut key = self.object(&id)?.clone();
        key.usage_auth = new_auth;
        let new_id: ObjectId = rand::random();
        let new_blob = key.blob(&new_id);
        self.objects.insert(new_id, key);
        Ok(sized(&new_blob))
    }
}

#[cfg(test)]
mod tests {
    use super::super::{SimulatedTpm, FIRST_KEY_HANDLE};
    use super::*;
    use crate::device::{Authorization, TpmCommand, TpmResponse, Transmit};
    use crate::marshal::ResponseBuffer;

    fn run(sim: &mut SimulatedTpm, command: &[u8]) -> TpmResponse {
        TpmResponse::parse(&sim.transmit(command).unwrap()).unwrap()
    }

    fn wrap_key(sim: &mut SimulatedTpm, parent: u32, usage: KeyUsage) -> TpmResponse {
        let srk_auth = AuthValue::well_known();
        let auth = Authorization::new(&srk_auth);
        let mut cmd = TpmCommand::new(TpmOrd::CreateWrapKey);
        cmd.add_handle(parent);
        cmd.add_bytes(&AuthValue::well_known().seal(&srk_auth, &auth.nonce_odd));
        cmd.add_u16(usage.to_u16());
        cmd.add_u32(0);
        cmd.add_u8(auth_usage::NEVER);
        cmd.add_u32(2048);
        run(sim, &cmd.finalize_authorized(&[auth]))
    }

    fn load(sim: &mut SimulatedTpm, parent: u32, blob: &[u8]) -> TpmResponse {
        let auth_value = AuthValue::well_known();
        let mut cmd = TpmCommand::new(TpmOrd::LoadKey2);
        cmd.add_handle(parent);
        cmd.add_sized(blob);
        run(sim, &cmd.finalize_authorized(&[Authorization::new(&auth_value)]))
    }

    #[test]
    fn test_wrap_and_load() {
        let mut sim = SimulatedTpm::new();
        let response = wrap_key(&mut sim, tpm_kh::SRK, KeyUsage::Storage);
        assert!(response.is_success());
        let blob = ResponseBuffer::new(&response.data).get_sized().unwrap();
        assert_eq!(KeyBlob::from_bytes(&blob).unwrap().pub_key.len(), 256);

        let response = load(&mut sim, tpm_kh::SRK, &blob);
        assert!(response.is_success());
        assert_eq!(response.data, FIRST_KEY_HANDLE.to_be_bytes().to_vec());
        assert_eq!(sim.loaded_key_count(), 1);
    }

    #[test]
    fn test_load_under_wrong_parent() {
        let mut sim = SimulatedTpm::new();
        let response = wrap_key(&mut sim, tpm_kh::SRK, KeyUsage::Storage);
        let parent_blob = ResponseBuffer::new(&response.data).get_sized().unwrap();
        let parent = load(&mut sim, tpm_kh::SRK, &parent_blob);
        let parent = ResponseBuffer::new(&parent.data).get_u32().unwrap();

        let response = wrap_key(&mut sim, tpm_kh::SRK, KeyUsage::Signing);
        let blob = ResponseBuffer::new(&response.data).get_sized().unwrap();
        let response = load(&mut sim, parent, &blob);
        assert_eq!(response.response_code, tpm_rc::DECRYPT_ERROR);
    }

    #[test]
    fn test_signing_key_cannot_parent() {
        let mut sim = SimulatedTpm::new();
        let response = wrap_key(&mut sim, tpm_kh::SRK, KeyUsage::Signing);
        let blob = ResponseBuffer::new(&response.data).get_sized().unwrap();
        let handle = load(&mut sim, tpm_kh::SRK, &blob);
        let handle = ResponseBuffer::new(&handle.data).get_u32().unwrap();

        let response = wrap_key(&mut sim, handle, KeyUsage::Storage);
        assert_eq!(response.response_code, tpm_rc::INVALID_KEYUSAGE);
    }

    #[test]
    fn test_flush_srk_rejected() {
        let mut sim = SimulatedTpm::new();
        let mut cmd = TpmCommand::new(TpmOrd::FlushSpecific);
        cmd.add_handle(tpm_kh::SRK);
        cmd.add_u32(tpm_rt::KEY);
        assert_eq!(run(&mut sim, &cmd.finalize()).response_code, tpm_rc::BAD_PARAMETER);

        let mut cmd = TpmCommand::new(TpmOrd::FlushSpecific);
        cmd.add_handle(0x0100_0042);
        cmd.add_u32(tpm_rt::KEY);
        assert_eq!(
            run(&mut sim, &cmd.finalize()).response_code,
            tpm_rc::INVALID_KEYHANDLE
        );
    }
}
