// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Identifiers, handles and device structures shared across the core

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arena::ArenaIndex;
use crate::auth::Nonce;
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// Persistent key identifier (TSS_UUID)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyUuid(Uuid);

impl KeyUuid {
    /// Well-known identifier of the storage root key
    pub const SRK: KeyUuid = KeyUuid::from_bytes([0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for KeyUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0.hyphenated(), f)
    }
}

impl fmt::Debug for KeyUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyUuid({})", self)
    }
}

impl FromStr for KeyUuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::bad_parameter(format!("invalid uuid {s:?}: {e}")))
    }
}

/// Raw persistent-storage flags as callers pass them (TSS_PS_TYPE)
pub mod ps_flag {
    pub const USER: u32 = 1;
    pub const SYSTEM: u32 = 2;
}

/// Persistent storage namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PsType {
    User,
    System,
}

impl PsType {
    pub fn to_u32(self) -> u32 {
        match self {
            PsType::User => ps_flag::USER,
            PsType::System => ps_flag::SYSTEM,
        }
    }
}

impl TryFrom<u32> for PsType {
    type Error = Error;

    fn try_from(flag: u32) -> Result<Self> {
        match flag {
            ps_flag::USER => Ok(PsType::User),
            ps_flag::SYSTEM => Ok(PsType::System),
            other => Err(Error::bad_parameter(format!(
                "invalid persistent storage type 0x{other:x}"
            ))),
        }
    }
}

impl fmt::Display for PsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PsType::User => f.write_str("user"),
            PsType::System => f.write_str("system"),
        }
    }
}

/// Anything accepted where a storage namespace is expected.
///
/// Raw flags are checked here, so a combined `USER | SYSTEM` value is
/// rejected before any storage lookup happens.
pub trait IntoPsType {
    fn into_ps_type(self) -> Result<PsType>;
}

impl IntoPsType for PsType {
    fn into_ps_type(self) -> Result<PsType> {
        Ok(self)
    }
}

impl IntoPsType for u32 {
    fn into_ps_type(self) -> Result<PsType> {
        PsType::try_from(self)
    }
}

/// Attributes of a key object before it is created on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyFlags {
    pub usage: KeyUsage,
    pub key_bits: u32,
    pub requires_auth: bool,
    pub migratable: bool,
    pub volatile: bool,
}

impl Default for KeyFlags {
    fn default() -> Self {
        Self::storage()
    }
}

impl KeyFlags {
    pub fn new(usage: KeyUsage) -> Self {
        Self {
            usage,
            key_bits: 2048,
            requires_auth: false,
            migratable: false,
            volatile: false,
        }
    }

    pub fn storage() -> Self {
        Self::new(KeyUsage::Storage)
    }

    pub fn signing() -> Self {
        Self::new(KeyUsage::Signing)
    }

    pub fn bind() -> Self {
        Self::new(KeyUsage::Bind)
    }

    pub fn with_authorization(mut self, requires_auth: bool) -> Self {
        self.requires_auth = requires_auth;
        self
    }

    pub fn migratable(mut self, migratable: bool) -> Self {
        self.migratable = migratable;
        self
    }

    pub fn volatile(mut self, volatile: bool) -> Self {
        self.volatile = volatile;
        self
    }

    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    pub(crate) fn device_flags(&self) -> u32 {
        let mut flags = 0;
        if self.migratable {
            flags |= key_flags::MIGRATABLE;
        }
        if self.volatile {
            flags |= key_flags::VOLATILE;
        }
        flags
    }

    pub(crate) fn auth_usage(&self) -> u8 {
        if self.requires_auth {
            auth_usage::ALWAYS
        } else {
            auth_usage::NEVER
        }
    }
}

macro_rules! object_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) ArenaIndex);

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:?})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

object_handle!(
    /// Key object owned by a [`Context`](crate::Context)
    KeyHandle
);
object_handle!(
    /// Policy object owned by a [`Context`](crate::Context)
    PolicyHandle
);
object_handle!(
    /// Delegation family owned by a [`Context`](crate::Context)
    FamilyHandle
);
object_handle!(
    /// Transport session owned by a [`Context`](crate::Context)
    TransportHandle
);

/// How a caller names the key to load
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRef {
    Uuid(PsType, KeyUuid),
    Handle(KeyHandle),
}

/// Issued when loading stops at a key whose secret has not been supplied.
///
/// Hand it back through [`Context::supply_auth`](crate::Context::supply_auth)
/// together with a policy holding the secret, then repeat the load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadAuthChallenge {
    pub(crate) key: KeyHandle,
    pub(crate) id: Option<(PsType, KeyUuid)>,
    pub(crate) nonce: Nonce,
}

impl LoadAuthChallenge {
    /// The key whose authorization is missing
    pub fn key(&self) -> KeyHandle {
        self.key
    }

    pub fn uuid(&self) -> Option<KeyUuid> {
        self.id.map(|(_, uuid)| uuid)
    }

    pub fn ps_type(&self) -> Option<PsType> {
        self.id.map(|(ps, _)| ps)
    }

    pub fn nonce(&self) -> &Nonce {
        &self.nonce
    }
}

impl fmt::Display for LoadAuthChallenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some((ps, uuid)) => write!(f, "key {uuid} ({ps}) needs its secret"),
            None => write!(f, "key {} needs its secret", self.key),
        }
    }
}

/// Outcome of a load that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Loaded(KeyHandle),
    NeedsAuth(LoadAuthChallenge),
}

impl Resolution {
    /// Treat a pending challenge as an error
    pub fn into_loaded(self) -> Result<KeyHandle> {
        match self {
            Resolution::Loaded(key) => Ok(key),
            Resolution::NeedsAuth(challenge) => Err(Error::AuthorizationRequired(challenge)),
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Resolution::Loaded(_))
    }
}

/// Wrapped key as produced by CreateWrapKey (TPM_KEY12 subset)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBlob {
    pub usage: KeyUsage,
    pub flags: u32,
    pub auth_usage: u8,
    pub key_bits: u32,
    pub pub_key: Vec<u8>,
    pub enc_data: Vec<u8>,
}

impl KeyBlob {
    pub fn requires_auth(&self) -> bool {
        self.auth_usage != auth_usage::NEVER
    }

    pub fn migratable(&self) -> bool {
        self.flags & key_flags::MIGRATABLE != 0
    }

    pub fn key_flags(&self) -> KeyFlags {
        KeyFlags {
            usage: self.usage,
            key_bits: self.key_bits,
            requires_auth: self.requires_auth(),
            migratable: self.migratable(),
            volatile: self.flags & key_flags::VOLATILE != 0,
        }
    }
}

impl Marshal for KeyBlob {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(blob_tag::KEY12);
        buf.put_u16(self.usage.to_u16());
        buf.put_u32(self.flags);
        buf.put_u8(self.auth_usage);
        buf.put_u32(self.key_bits);
        buf.put_sized(&self.pub_key);
        buf.put_sized(&self.enc_data);
    }
}

impl Unmarshal for KeyBlob {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        if tag != blob_tag::KEY12 {
            return Err(Error::bad_parameter(format!("not a key blob: tag 0x{tag:04x}")));
        }
        let usage_raw = buf.get_u16()?;
        let usage = KeyUsage::from_u16(usage_raw)
            .ok_or_else(|| Error::bad_parameter(format!("unknown key usage 0x{usage_raw:04x}")))?;
        Ok(Self {
            usage,
            flags: buf.get_u32()?,
            auth_usage: buf.get_u8()?,
            key_bits: buf.get_u32()?,
            pub_key: buf.get_sized()?,
            enc_data: buf.get_sized()?,
        })
    }
}

/// Public header of a delegation blob (TPM_DELEGATE_PUBLIC subset)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegatePublic {
    pub scope: DelegateScope,
    pub label: u8,
    pub family_id: u32,
    pub verification_count: u32,
    pub per1: u32,
    pub per2: u32,
}

impl Marshal for DelegatePublic {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u16(blob_tag::DELEGATE_BLOB);
        buf.put_u8(self.scope as u8);
        buf.put_u8(self.label);
        buf.put_u32(self.family_id);
        buf.put_u32(self.verification_count);
        buf.put_u32(self.per1);
        buf.put_u32(self.per2);
    }
}

impl Unmarshal for DelegatePublic {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let tag = buf.get_u16()?;
        if tag != blob_tag::DELEGATE_BLOB {
            return Err(Error::bad_parameter(format!(
                "not a delegation blob: tag 0x{tag:04x}"
            )));
        }
        let scope_raw = buf.get_u8()?;
        let scope = DelegateScope::from_u8(scope_raw)
            .ok_or_else(|| Error::bad_parameter(format!("unknown delegation scope {scope_raw}")))?;
        Ok(Self {
            scope,
            label: buf.get_u8()?,
            family_id: buf.get_u32()?,
            verification_count: buf.get_u32()?,
            per1: buf.get_u32()?,
            per2: buf.get_u32()?,
        })
    }
}

/// Delegation blob as returned by the device; the trailing bytes are opaque
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegationBlob {
    public: DelegatePublic,
    data: Vec<u8>,
}

impl DelegationBlob {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let public = DelegatePublic::from_bytes(&data)?;
        Ok(Self { public, data })
    }

    pub fn public(&self) -> &DelegatePublic {
        &self.public
    }

    pub fn scope(&self) -> DelegateScope {
        self.public.scope
    }

    pub fn family_id(&self) -> u32 {
        self.public.family_id
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Row of the device family table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FamilyEntry {
    pub label: u8,
    pub family_id: u32,
    pub verification_count: u32,
    pub flags: u32,
}

impl FamilyEntry {
    pub fn enabled(&self) -> bool {
        self.flags & family_flags::ENABLE != 0
    }
}

impl Marshal for FamilyEntry {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u8(self.label);
        buf.put_u32(self.family_id);
        buf.put_u32(self.verification_count);
        buf.put_u32(self.flags);
    }
}

impl Unmarshal for FamilyEntry {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            label: buf.get_u8()?,
            family_id: buf.get_u32()?,
            verification_count: buf.get_u32()?,
            flags: buf.get_u32()?,
        })
    }
}

/// Occupied row of the device delegate table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelegateEntry {
    pub row: u32,
    pub public: DelegatePublic,
}

impl Marshal for DelegateEntry {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.row);
        self.public.marshal(buf);
    }
}

impl Unmarshal for DelegateEntry {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        Ok(Self {
            row: buf.get_u32()?,
            public: DelegatePublic::unmarshal(buf)?,
        })
    }
}

/// Snapshot of both delegation tables, in row order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelegationTables {
    pub families: Vec<FamilyEntry>,
    pub delegates: Vec<DelegateEntry>,
}

impl DelegationTables {
    pub fn family(&self, family_id: u32) -> Option<&FamilyEntry> {
        self.families.iter().find(|f| f.family_id == family_id)
    }

    pub fn row(&self, row: u32) -> Option<&DelegateEntry> {
        self.delegates.iter().find(|d| d.row == row)
    }
}

impl Marshal for DelegationTables {
    fn marshal(&self, buf: &mut CommandBuffer) {
        buf.put_u32(self.families.len() as u32);
        for f in &self.families {
            f.marshal(buf);
        }
        buf.put_u32(self.delegates.len() as u32);
        for d in &self.delegates {
            d.marshal(buf);
        }
    }
}

impl Unmarshal for DelegationTables {
    fn unmarshal(buf: &mut ResponseBuffer) -> Result<Self> {
        let family_count = buf.get_u32()? as usize;
        let families = (0..family_count)
            .map(|_| FamilyEntry::unmarshal(buf))
            .collect::<Result<Vec<_>>>()?;
        let delegate_count = buf.get_u32()? as usize;
        let delegates = (0..delegate_count)
            .map(|_| DelegateEntry::unmarshal(buf))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            families,
            delegates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_text_form() {
        assert_eq!(
            KeyUuid::SRK.to_string(),
            "00000000-0000-0000-0000-000000000001"
        );
        let uuid: KeyUuid = "12345678-9abc-def0-1122-334455667788".parse().unwrap();
        assert_eq!(uuid.to_string(), "12345678-9abc-def0-1122-334455667788");
        assert!("1234".parse::<KeyUuid>().is_err());
    }

    #[test]
    fn test_random_uuids_are_v4() {
        let a = KeyUuid::random();
        assert_eq!(a.0.get_version_num(), 4);
        assert_ne!(a, KeyUuid::random());
        assert_eq!(KeyUuid::from_bytes(*a.as_bytes()), a);
    }

    #[test]
    fn test_uuid_serde_as_string() {
        let json = serde_json::to_string(&KeyUuid::SRK).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000001\"");
        let back: KeyUuid = serde_json::from_str(&json).unwrap();
        assert_eq!(back, KeyUuid::SRK);
    }

    #[test]
    fn test_combined_ps_flag_rejected() {
        assert_eq!(ps_flag::USER.into_ps_type().unwrap(), PsType::User);
        assert_eq!(ps_flag::SYSTEM.into_ps_type().unwrap(), PsType::System);
        let err = (ps_flag::USER | ps_flag::SYSTEM).into_ps_type().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::BadParameter);
        assert!(0u32.into_ps_type().is_err());
    }

    #[test]
    fn test_key_blob_layout() {
        let blob = KeyBlob {
            usage: KeyUsage::Storage,
            flags: key_flags::MIGRATABLE,
            auth_usage: auth_usage::ALWAYS,
            key_bits: 2048,
            pub_key: vec![0xAB; 4],
            enc_data: vec![0xCD; 2],
        };
        let bytes = blob.to_bytes();
        assert_eq!(&bytes[0..4], &[0x00, 0x28, 0x00, 0x11]);
        let parsed = KeyBlob::from_bytes(&bytes).unwrap();
        assert!(parsed.requires_auth());
        assert!(parsed.migratable());
        assert_eq!(parsed.key_flags().usage, KeyUsage::Storage);
    }

    #[test]
    fn test_delegation_blob_rejects_key_blob() {
        let key = KeyBlob {
            usage: KeyUsage::Signing,
            flags: 0,
            auth_usage: auth_usage::NEVER,
            key_bits: 512,
            pub_key: vec![],
            enc_data: vec![],
        };
        assert!(DelegationBlob::from_bytes(key.to_bytes()).is_err());
    }
}
