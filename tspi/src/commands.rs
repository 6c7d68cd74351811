// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 command implementations
//!
//! One method per device command. Each builds the frame, attaches the
//! authorizations it needs and parses the reply; policy decisions live in the
//! callers.

use tracing::debug;

use crate::auth::{AuthValue, Nonce};
use crate::constants::*;
use crate::context::Context;
use crate::device::*;
use crate::error::{Error, Result};
use crate::marshal::*;
use crate::types::*;

impl Context {
    // ==================== Key Operations ====================

    /// CreateWrapKey: create a key wrapped by `parent`
    pub(crate) fn tpm_create_wrap_key(
        &mut self,
        parent: u32,
        parent_auth: &AuthValue,
        usage_auth: &AuthValue,
        flags: &KeyFlags,
    ) -> Result<Vec<u8>> {
        let auth = Authorization::new(parent_auth);

        let mut cmd = TpmCommand::new(TpmOrd::CreateWrapKey);
        cmd.add_handle(parent);
        // Usage secret travels sealed under the parent secret
        cmd.add_bytes(&usage_auth.seal(parent_auth, &auth.nonce_odd));
        cmd.add_u16(flags.usage.to_u16());
        cmd.add_u32(flags.device_flags());
        cmd.add_u8(flags.auth_usage());
        cmd.add_u32(flags.key_bits);

        let response = self.submit(TpmOrd::CreateWrapKey, &cmd.finalize_authorized(&[auth]))?;
        let mut buf = response.data_buffer();
        let blob = buf.get_sized()?;
        debug!("created {:?} key blob: {} bytes", flags.usage, blob.len());
        Ok(blob)
    }

    /// LoadKey2: load a wrapped key, returning its device handle
    pub(crate) fn tpm_load_key2(
        &mut self,
        parent: u32,
        parent_auth: &AuthValue,
        blob: &[u8],
    ) -> Result<u32> {
        let mut cmd = TpmCommand::new(TpmOrd::LoadKey2);
        cmd.add_handle(parent);
        cmd.add_sized(blob);

        let auth = Authorization::new(parent_auth);
        let response = self.submit(TpmOrd::LoadKey2, &cmd.finalize_authorized(&[auth]))?;
        let handle = response.data_buffer().get_u32()?;
        debug!("loaded key under 0x{parent:08x}: handle 0x{handle:08x}");
        Ok(handle)
    }

    /// FlushSpecific: release a device resource
    pub(crate) fn tpm_flush_specific(&mut self, handle: u32, resource_type: u32) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmOrd::FlushSpecific);
        cmd.add_handle(handle);
        cmd.add_u32(resource_type);

        self.submit(TpmOrd::FlushSpecific, &cmd.finalize())?;
        debug!("flushed 0x{handle:08x}");
        Ok(())
    }

    /// ChangeAuth: re-wrap `blob` with a new usage secret
    pub(crate) fn tpm_change_auth(
        &mut self,
        parent: u32,
        parent_auth: &AuthValue,
        old_auth: &AuthValue,
        new_auth: &AuthValue,
        blob: &[u8],
    ) -> Result<Vec<u8>> {
        let parent_session = Authorization::new(parent_auth);
        let key_session = Authorization::new(old_auth);

        let mut cmd = TpmCommand::new(TpmOrd::ChangeAuth);
        cmd.add_handle(parent);
        cmd.add_bytes(&new_auth.seal(parent_auth, &parent_session.nonce_odd));
        cmd.add_sized(blob);

        let response = self.submit(
            TpmOrd::ChangeAuth,
            &cmd.finalize_authorized(&[parent_session, key_session]),
        )?;
        Ok(response.data_buffer().get_sized()?)
    }

    // ==================== Capabilities ====================

    pub(crate) fn tpm_get_capability_property(&mut self, property: u32) -> Result<u32> {
        let mut cmd = TpmCommand::new(TpmOrd::GetCapability);
        cmd.add_u32(tpm_cap::PROPERTY);
        cmd.add_u32(property);

        let response = self.submit(TpmOrd::GetCapability, &cmd.finalize())?;
        let value = response.data_buffer().get_sized()?;
        let value: [u8; 4] = value.as_slice().try_into().map_err(|_| {
            Error::protocol(format!(
                "capability 0x{property:x}: expected 4 bytes, got {}",
                value.len()
            ))
        })?;
        Ok(u32::from_be_bytes(value))
    }

    // ==================== Transport ====================

    /// EstablishTransport: open a session, returning its handle and nonce_even.
    ///
    /// With an encryption key the secret is sealed under that key's secret;
    /// without one the session is integrity-only and the secret goes in clear.
    pub(crate) fn tpm_establish_transport(
        &mut self,
        enc_key: Option<(u32, &AuthValue)>,
        attributes: u32,
        secret: &AuthValue,
    ) -> Result<(u32, Nonce)> {
        let mut cmd = TpmCommand::new(TpmOrd::EstablishTransport);
        let bytes = match enc_key {
            Some((handle, key_auth)) => {
                let auth = Authorization::new(key_auth);
                cmd.add_handle(handle);
                cmd.add_u32(attributes);
                cmd.add_sized(&secret.seal(key_auth, &auth.nonce_odd));
                cmd.finalize_authorized(&[auth])
            }
            None => {
                cmd.add_handle(tpm_kh::TRANSPORT);
                cmd.add_u32(attributes);
                cmd.add_sized(secret.as_bytes());
                cmd.finalize()
            }
        };

        let response = self.submit(TpmOrd::EstablishTransport, &bytes)?;
        let mut buf = response.data_buffer();
        let handle = buf.get_u32()?;
        let nonce_even = buf.get_array()?;
        Ok((handle, nonce_even))
    }

    /// ReleaseTransportSigned: close a session and fetch the device's log digest
    pub(crate) fn tpm_release_transport_signed(
        &mut self,
        sign_key: Option<(u32, &AuthValue)>,
        trans: u32,
        anti_replay: &Nonce,
    ) -> Result<([u8; 32], Vec<u8>)> {
        let mut cmd = TpmCommand::new(TpmOrd::ReleaseTransportSigned);
        let bytes = match sign_key {
            Some((handle, key_auth)) => {
                cmd.add_handle(handle);
                cmd.add_handle(trans);
                cmd.add_bytes(anti_replay);
                cmd.finalize_authorized(&[Authorization::new(key_auth)])
            }
            None => {
                cmd.add_handle(tpm_kh::TRANSPORT);
                cmd.add_handle(trans);
                cmd.add_bytes(anti_replay);
                cmd.finalize()
            }
        };

        let response = self.submit(TpmOrd::ReleaseTransportSigned, &bytes)?;
        let mut buf = response.data_buffer();
        let digest = buf.get_array()?;
        let signature = buf.get_sized()?;
        Ok((digest, signature))
    }

    // ==================== Delegation ====================

    /// Delegate_Manage under owner authorization
    pub(crate) fn tpm_delegate_manage(
        &mut self,
        owner_auth: &AuthValue,
        family_id: u32,
        op: FamilyOp,
        op_data: &[u8],
    ) -> Result<Vec<u8>> {
        let mut cmd = TpmCommand::new(TpmOrd::DelegateManage);
        cmd.add_u32(family_id);
        cmd.add_u32(op.to_u32());
        cmd.add_sized(op_data);

        let auth = Authorization::new(owner_auth);
        let response = self.submit(TpmOrd::DelegateManage, &cmd.finalize_authorized(&[auth]))?;
        Ok(response.data_buffer().get_sized()?)
    }

    /// Delegate_CreateOwnerDelegation or Delegate_CreateKeyDelegation.
    ///
    /// `key` is `None` for owner delegations; otherwise the key whose use is
    /// being delegated, authorized with its own secret.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn tpm_create_delegation(
        &mut self,
        key: Option<u32>,
        auth_value: &AuthValue,
        increment: bool,
        label: u8,
        family_id: u32,
        per1: u32,
        per2: u32,
        delegate_auth: &AuthValue,
    ) -> Result<Vec<u8>> {
        let ordinal = match key {
            Some(_) => TpmOrd::DelegateCreateKeyDelegation,
            None => TpmOrd::DelegateCreateOwnerDelegation,
        };
        let auth = Authorization::new(auth_value);

        let mut cmd = TpmCommand::new(ordinal);
        if let Some(handle) = key {
            cmd.add_handle(handle);
        }
        cmd.add_u8(increment as u8);
        cmd.add_u8(label);
        cmd.add_u32(family_id);
        cmd.add_u32(per1);
        cmd.add_u32(per2);
        cmd.add_bytes(&delegate_auth.seal(auth_value, &auth.nonce_odd));

        let response = self.submit(ordinal, &cmd.finalize_authorized(&[auth]))?;
        Ok(response.data_buffer().get_sized()?)
    }

    /// Delegate_LoadOwnerDelegation: write a blob into a delegate table row
    pub(crate) fn tpm_load_owner_delegation(
        &mut self,
        owner_auth: &AuthValue,
        row: u32,
        blob: &[u8],
    ) -> Result<()> {
        let mut cmd = TpmCommand::new(TpmOrd::DelegateLoadOwnerDelegation);
        cmd.add_u32(row);
        cmd.add_sized(blob);

        let auth = Authorization::new(owner_auth);
        self.submit(
            TpmOrd::DelegateLoadOwnerDelegation,
            &cmd.finalize_authorized(&[auth]),
        )?;
        Ok(())
    }

    /// Delegate_ReadTable: public contents of both tables
    pub(crate) fn tpm_read_table(&mut self) -> Result<DelegationTables> {
        let cmd = TpmCommand::new(TpmOrd::DelegateReadTable);
        let response = self.submit(TpmOrd::DelegateReadTable, &cmd.finalize())?;
        let mut buf = response.data_buffer();
        let tables = DelegationTables::unmarshal(&mut buf)?;
        buf.finish()?;
        Ok(tables)
    }
}
