// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Context configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{KeyUuid, PsType};

pub const ENV_DEVICE: &str = "TSPI_DEVICE";
pub const ENV_SYSTEM_PS: &str = "TSPI_SYSTEM_PS";
pub const ENV_USER_PS: &str = "TSPI_USER_PS";

/// Registered keys used to protect transport sessions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportKeys {
    /// Namespace the transport keys are registered in
    pub ps: PsType,
    /// Storage key that carries the session secret
    pub wrap_key: KeyUuid,
    /// Signing key that signs the released log
    pub sign_key: KeyUuid,
}

impl Default for TransportKeys {
    fn default() -> Self {
        Self {
            ps: PsType::System,
            wrap_key: KeyUuid::from_bytes(*b"tspi-trans-wrap\0"),
            sign_key: KeyUuid::from_bytes(*b"tspi-trans-sign\0"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Device endpoint; auto-detected when unset
    pub device: Option<String>,
    /// JSON file backing the system namespace; in memory when unset
    pub system_ps_path: Option<PathBuf>,
    /// JSON file backing the user namespace; in memory when unset
    pub user_ps_path: Option<PathBuf>,
    pub transport: TransportKeys,
}

impl ContextConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs_err::read(path.as_ref())?;
        Ok(serde_json::from_slice(&contents)?)
    }

    /// Defaults overlaid with `TSPI_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    pub fn with_env(mut self) -> Self {
        if let Ok(device) = std::env::var(ENV_DEVICE) {
            self.device = Some(device);
        }
        if let Ok(path) = std::env::var(ENV_SYSTEM_PS) {
            self.system_ps_path = Some(path.into());
        }
        if let Ok(path) = std::env::var(ENV_USER_PS) {
            self.user_ps_path = Some(path.into());
        }
        self
    }
}
