// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! TCG service provider core for TPM 1.2 devices
//!
//! This crate manages key hierarchies, transport sessions and owner
//! delegation on top of a device that speaks the TPM 1.2 wire protocol.
//!
//! ## Features
//!
//! - **Key hierarchy**: create, load, register and resolve keys by UUID,
//!   loading missing ancestors and pausing when a parent secret is missing
//! - **Persistent storage**: user and system namespaces, in memory or backed
//!   by JSON files
//! - **Transport sessions**: encrypted, logged command channels whose log is
//!   checked against the device on release
//! - **Delegation**: family lifecycle and the owner delegate table
//! - **Blob encoding**: self-describing DER envelope for opaque byte blobs
//! - **Simulated device**: [`sim::SimulatedTpm`] for tests and demos
//!
//! ## Example
//!
//! ```no_run
//! use tspi::{Context, ContextConfig, KeyFlags};
//!
//! let mut ctx = Context::connect(ContextConfig::from_env())?;
//! ctx.set_srk_secret_well_known()?;
//! let key = ctx.create_key_object(KeyFlags::signing());
//! ctx.create_key(key, ctx.srk())?;
//! # Ok::<(), tspi::Error>(())
//! ```

mod arena;
mod auth;
pub mod blob;
mod commands;
mod config;
mod constants;
mod context;
mod delegation;
pub mod device;
mod error;
mod key;
pub mod marshal;
mod policy;
mod resolver;
pub mod sim;
mod storage;
mod transport;
mod types;

pub use auth::{AuthValue, Nonce};
pub use blob::BlobType;
pub use config::{ContextConfig, TransportKeys, ENV_DEVICE, ENV_SYSTEM_PS, ENV_USER_PS};
pub use constants::*;
pub use context::Context;
pub use delegation::{DelegationCapacity, DelegationTarget};
pub use error::{Error, ErrorKind, Result};
pub use policy::{derive_auth, PolicyTarget, PolicyUsage, SecretMode, WELL_KNOWN_SECRET};
pub use storage::KeyInfo;
pub use transport::{LogDigest, TransportReceipt, TransportState};
pub use types::*;

pub use device::{FileDevice, TpmCommand, TpmResponse, Transmit};
