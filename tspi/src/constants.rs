// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TPM 1.2 ordinals, tags, handles and result codes

/// Command ordinals (TPM_ORD)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TpmOrd {
    ChangeAuth = 0x0000000C,
    CreateWrapKey = 0x0000001F,
    LoadKey2 = 0x00000041,
    GetCapability = 0x00000065,
    FlushSpecific = 0x000000BA,
    DelegateManage = 0x000000D2,
    DelegateCreateKeyDelegation = 0x000000D4,
    DelegateCreateOwnerDelegation = 0x000000D5,
    DelegateLoadOwnerDelegation = 0x000000D8,
    DelegateReadTable = 0x000000DB,
    EstablishTransport = 0x000000E6,
    ExecuteTransport = 0x000000E7,
    ReleaseTransportSigned = 0x000000E8,
}

impl TpmOrd {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x0000000C => Some(TpmOrd::ChangeAuth),
            0x0000001F => Some(TpmOrd::CreateWrapKey),
            0x00000041 => Some(TpmOrd::LoadKey2),
            0x00000065 => Some(TpmOrd::GetCapability),
            0x000000BA => Some(TpmOrd::FlushSpecific),
            0x000000D2 => Some(TpmOrd::DelegateManage),
            0x000000D4 => Some(TpmOrd::DelegateCreateKeyDelegation),
            0x000000D5 => Some(TpmOrd::DelegateCreateOwnerDelegation),
            0x000000D8 => Some(TpmOrd::DelegateLoadOwnerDelegation),
            0x000000DB => Some(TpmOrd::DelegateReadTable),
            0x000000E6 => Some(TpmOrd::EstablishTransport),
            0x000000E7 => Some(TpmOrd::ExecuteTransport),
            0x000000E8 => Some(TpmOrd::ReleaseTransportSigned),
            _ => None,
        }
    }

    /// Ordinals that manage the transport channel itself and are never wrapped.
    pub fn is_transport_control(self) -> bool {
        matches!(
            self,
            TpmOrd::EstablishTransport | TpmOrd::ExecuteTransport | TpmOrd::ReleaseTransportSigned
        )
    }
}

/// Command and response header tags (TPM_TAG)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum TpmTag {
    RquCommand = 0x00C1,
    RquAuth1 = 0x00C2,
    RquAuth2 = 0x00C3,
    RspCommand = 0x00C4,
    RspAuth1 = 0x00C5,
    RspAuth2 = 0x00C6,
}

impl TpmTag {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x00C1 => Some(TpmTag::RquCommand),
            0x00C2 => Some(TpmTag::RquAuth1),
            0x00C3 => Some(TpmTag::RquAuth2),
            0x00C4 => Some(TpmTag::RspCommand),
            0x00C5 => Some(TpmTag::RspAuth1),
            0x00C6 => Some(TpmTag::RspAuth2),
            _ => None,
        }
    }

    /// Request tag carrying `count` authorization trailers.
    pub fn request(count: usize) -> Option<Self> {
        match count {
            0 => Some(TpmTag::RquCommand),
            1 => Some(TpmTag::RquAuth1),
            2 => Some(TpmTag::RquAuth2),
            _ => None,
        }
    }

    pub fn auth_count(self) -> usize {
        match self {
            TpmTag::RquCommand | TpmTag::RspCommand => 0,
            TpmTag::RquAuth1 | TpmTag::RspAuth1 => 1,
            TpmTag::RquAuth2 | TpmTag::RspAuth2 => 2,
        }
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            TpmTag::RspCommand | TpmTag::RspAuth1 | TpmTag::RspAuth2
        )
    }
}

/// Result codes (TPM_RESULT)
pub mod tpm_rc {
    pub const SUCCESS: u32 = 0x00000000;
    pub const AUTHFAIL: u32 = 0x00000001;
    pub const BADINDEX: u32 = 0x00000002;
    pub const BAD_PARAMETER: u32 = 0x00000003;
    pub const FAIL: u32 = 0x00000009;
    pub const BAD_ORDINAL: u32 = 0x0000000A;
    pub const INVALID_KEYHANDLE: u32 = 0x0000000C;
    pub const NOSPACE: u32 = 0x00000011;
    pub const RESOURCES: u32 = 0x00000015;
    pub const AUTH2FAIL: u32 = 0x0000001D;
    pub const BADTAG: u32 = 0x0000001E;
    pub const DECRYPT_ERROR: u32 = 0x00000021;
    pub const INVALID_AUTHHANDLE: u32 = 0x00000022;
    pub const INVALID_KEYUSAGE: u32 = 0x00000024;
    pub const BAD_COUNTER: u32 = 0x00000045;
    pub const DELEGATE_FAMILY: u32 = 0x00000052;
}

/// Reserved key handles (TPM_KH)
pub mod tpm_kh {
    pub const SRK: u32 = 0x40000000;
    pub const OWNER: u32 = 0x40000001;
    /// Stands in for a key handle when a transport is neither encrypted nor signed
    pub const TRANSPORT: u32 = 0x40000003;
}

/// Resource types for FlushSpecific (TPM_RESOURCE_TYPE)
pub mod tpm_rt {
    pub const KEY: u32 = 0x00000001;
    pub const TRANS: u32 = 0x00000004;
}

/// Key usage (TPM_KEY_USAGE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum KeyUsage {
    Signing = 0x0010,
    Storage = 0x0011,
    Identity = 0x0012,
    Bind = 0x0014,
    Legacy = 0x0015,
}

impl KeyUsage {
    pub fn to_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Option<Self> {
        match v {
            0x0010 => Some(KeyUsage::Signing),
            0x0011 => Some(KeyUsage::Storage),
            0x0012 => Some(KeyUsage::Identity),
            0x0014 => Some(KeyUsage::Bind),
            0x0015 => Some(KeyUsage::Legacy),
            _ => None,
        }
    }
}

/// Key flag bits (TPM_KEY_FLAGS)
pub mod key_flags {
    pub const MIGRATABLE: u32 = 0x00000002;
    pub const VOLATILE: u32 = 0x00000004;
}

/// Key authorization usage (TPM_AUTH_DATA_USAGE)
pub mod auth_usage {
    pub const NEVER: u8 = 0x00;
    pub const ALWAYS: u8 = 0x01;
}

/// Transport attributes (TPM_TRANSPORT_ATTRIBUTES)
pub mod transport_attr {
    pub const ENCRYPT: u32 = 0x00000001;
    pub const LOG: u32 = 0x00000002;
}

/// Delegate_Manage operations (TPM_FAMILY_OPERATION)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FamilyOp {
    Create = 0x00000001,
    Enable = 0x00000002,
    Admin = 0x00000003,
    Invalidate = 0x00000004,
}

impl FamilyOp {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x00000001 => Some(FamilyOp::Create),
            0x00000002 => Some(FamilyOp::Enable),
            0x00000003 => Some(FamilyOp::Admin),
            0x00000004 => Some(FamilyOp::Invalidate),
            _ => None,
        }
    }
}

/// Family table flags (TPM_FAMILY_FLAGS)
pub mod family_flags {
    pub const ADMIN_LOCK: u32 = 0x00000001;
    pub const ENABLE: u32 = 0x00000002;
}

/// GetCapability areas and properties
pub mod tpm_cap {
    pub const PROPERTY: u32 = 0x00000005;
    pub const PROP_MAX_KEYS: u32 = 0x00000110;
    pub const PROP_FAMILY_ROWS: u32 = 0x0000011E;
    pub const PROP_DELEGATE_ROWS: u32 = 0x0000011F;
}

/// Delegation blob scope tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DelegateScope {
    Owner = 0x01,
    Key = 0x02,
}

impl DelegateScope {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(DelegateScope::Owner),
            0x02 => Some(DelegateScope::Key),
            _ => None,
        }
    }
}

/// Structure tags carried at the front of device blobs
pub mod blob_tag {
    pub const KEY12: u16 = 0x0028;
    pub const DELEGATE_BLOB: u16 = 0x0019;
}
