// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! In-process TPM 1.2 device model
//!
//! [`SimulatedTpm`] speaks the same framed protocol as a hardware device and
//! implements the commands this crate sends: wrapped keys, transport
//! sessions and the delegation tables. Clones share one device, so several
//! contexts (or a test holding a clone) observe the same state.

mod delegation;
mod keys;
mod transport;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::trace;

use crate::auth::{command_hmac, AuthValue, Nonce, AUTH_SIZE};
use crate::constants::*;
use crate::device::{encode_response, Transmit, AUTH_TRAILER_SIZE, HEADER_SIZE};
use crate::error::Result;
use crate::marshal::ResponseBuffer;

use self::delegation::{SimDelegate, SimFamily};
use self::keys::{ObjectId, SimKey, SRK_OBJECT};
use self::transport::SimTransport;

/// Device result: the response body, or a TPM result code
type RcResult<T> = std::result::Result<T, u32>;

const FIRST_KEY_HANDLE: u32 = 0x0100_0000;
const FIRST_TRANS_HANDLE: u32 = 0x0200_0000;

/// Device provisioning
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub owner_auth: AuthValue,
    pub srk_auth: AuthValue,
    pub family_rows: u32,
    pub delegate_rows: u32,
    /// Loaded key slots, not counting the SRK
    pub max_keys: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            owner_auth: AuthValue::well_known(),
            srk_auth: AuthValue::well_known(),
            family_rows: 8,
            delegate_rows: 2,
            max_keys: 16,
        }
    }
}

/// Simulated device; cheap to clone, clones share state
#[derive(Clone)]
pub struct SimulatedTpm {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTpm {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(SimState::new(config))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Frames received, counting a wrapped command once
    pub fn command_count(&self) -> u64 {
        self.lock().commands
    }

    /// Every ordinal executed so far, wrapped ones included, in order
    pub fn executed_ordinals(&self) -> Vec<TpmOrd> {
        self.lock().ordinals.clone()
    }

    /// Keys occupying load slots, not counting the SRK
    pub fn loaded_key_count(&self) -> usize {
        self.lock().loaded.len()
    }

    pub fn live_family_count(&self) -> usize {
        self.lock().families.iter().flatten().count()
    }

    /// Indices of occupied delegate table rows
    pub fn occupied_delegate_rows(&self) -> Vec<u32> {
        self.lock()
            .delegates
            .iter()
            .enumerate()
            .filter(|(_, d)| d.is_some())
            .map(|(row, _)| row as u32)
            .collect()
    }

    pub fn open_transport_count(&self) -> usize {
        self.lock().transports.len()
    }
}

impl Transmit for SimulatedTpm {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.lock();
        state.commands += 1;
        Ok(state.execute(command))
    }
}

pub(crate) struct SimState {
    config: SimConfig,
    objects: HashMap<ObjectId, SimKey>,
    loaded: BTreeMap<u32, ObjectId>,
    next_key_handle: u32,
    transports: HashMap<u32, SimTransport>,
    next_trans_handle: u32,
    families: Vec<Option<SimFamily>>,
    next_family_id: u32,
    delegates: Vec<Option<SimDelegate>>,
    /// Seals delegation blobs to this device
    blob_key: [u8; 32],
    commands: u64,
    ordinals: Vec<TpmOrd>,
}

/// A parsed request frame
struct Request<'a> {
    ordinal: TpmOrd,
    params: &'a [u8],
    auths: Vec<(Nonce, [u8; AUTH_SIZE])>,
}

impl Request<'_> {
    fn params(&self) -> Params<'_> {
        Params(ResponseBuffer::new(self.params))
    }

    fn nonce(&self, index: usize) -> RcResult<&Nonce> {
        self.auths
            .get(index)
            .map(|(nonce, _)| nonce)
            .ok_or(tpm_rc::BADTAG)
    }

    /// Check trailer `index` against `auth`
    fn verify(&self, index: usize, auth: &AuthValue) -> RcResult<()> {
        let (nonce, hmac) = self.auths.get(index).ok_or(tpm_rc::BADTAG)?;
        if command_hmac(auth, self.ordinal.to_u32(), self.params, nonce) != *hmac {
            return Err(if index == 0 {
                tpm_rc::AUTHFAIL
            } else {
                tpm_rc::AUTH2FAIL
            });
        }
        Ok(())
    }

    fn expect_auths(&self, count: usize) -> RcResult<()> {
        if self.auths.len() != count {
            return Err(tpm_rc::BADTAG);
        }
        Ok(())
    }
}

/// Parameter cursor that fails with BAD_PARAMETER
struct Params<'a>(ResponseBuffer<'a>);

impl Params<'_> {
    fn u8(&mut self) -> RcResult<u8> {
        self.0.get_u8().map_err(|_| tpm_rc::BAD_PARAMETER)
    }

    fn u16(&mut self) -> RcResult<u16> {
        self.0.get_u16().map_err(|_| tpm_rc::BAD_PARAMETER)
    }

    fn u32(&mut self) -> RcResult<u32> {
        self.0.get_u32().map_err(|_| tpm_rc::BAD_PARAMETER)
    }

    fn array<const N: usize>(&mut self) -> RcResult<[u8; N]> {
        self.0.get_array().map_err(|_| tpm_rc::BAD_PARAMETER)
    }

    fn sized(&mut self) -> RcResult<Vec<u8>> {
        self.0.get_sized().map_err(|_| tpm_rc::BAD_PARAMETER)
    }

    fn finish(&self) -> RcResult<()> {
        self.0.finish().map_err(|_| tpm_rc::BAD_PARAMETER)
    }
}

fn parse_request(command: &[u8]) -> RcResult<Request<'_>> {
    if command.len() < HEADER_SIZE {
        return Err(tpm_rc::BADTAG);
    }
    let mut header = ResponseBuffer::new(&command[..HEADER_SIZE]);
    let tag = header
        .get_u16()
        .ok()
        .and_then(TpmTag::from_u16)
        .filter(|t| !t.is_response())
        .ok_or(tpm_rc::BADTAG)?;
    let size = header.get_u32().map_err(|_| tpm_rc::BADTAG)? as usize;
    let ordinal = header.get_u32().map_err(|_| tpm_rc::BADTAG)?;
    if size != command.len() {
        return Err(tpm_rc::BAD_PARAMETER);
    }
    let ordinal = TpmOrd::from_u32(ordinal).ok_or(tpm_rc::BAD_ORDINAL)?;

    let count = tag.auth_count();
    let params_end = command
        .len()
        .checked_sub(count * AUTH_TRAILER_SIZE)
        .filter(|end| *end >= HEADER_SIZE)
        .ok_or(tpm_rc::BADTAG)?;
    let mut auths = Vec::with_capacity(count);
    for trailer in command[params_end..].chunks_exact(AUTH_TRAILER_SIZE) {
        let mut nonce = [0u8; AUTH_SIZE];
        let mut hmac = [0u8; AUTH_SIZE];
        nonce.copy_from_slice(&trailer[..AUTH_SIZE]);
        hmac.copy_from_slice(&trailer[AUTH_SIZE..]);
        auths.push((nonce, hmac));
    }
    Ok(Request {
        ordinal,
        params: &command[HEADER_SIZE..params_end],
        auths,
    })
}

impl SimState {
    fn new(config: SimConfig) -> Self {
        let mut objects = HashMap::new();
        objects.insert(SRK_OBJECT, SimKey::srk(config.srk_auth.clone()));
        Self {
            families: (0..config.family_rows).map(|_| None).collect(),
            delegates: (0..config.delegate_rows).map(|_| None).collect(),
            config,
            objects,
            loaded: BTreeMap::new(),
            next_key_handle: FIRST_KEY_HANDLE,
            transports: HashMap::new(),
            next_trans_handle: FIRST_TRANS_HANDLE,
            next_family_id: 1,
            blob_key: rand::random(),
            commands: 0,
            ordinals: Vec::new(),
        }
    }

    /// Run one frame and encode the reply; failures become result codes
    fn execute(&mut self, command: &[u8]) -> Vec<u8> {
        let result = parse_request(command).and_then(|request| {
            self.ordinals.push(request.ordinal);
            self.dispatch(&request)
        });
        match result {
            Ok(body) => encode_response(TpmTag::RspCommand, tpm_rc::SUCCESS, &body),
            Err(code) => {
                trace!("simulated device returns 0x{code:08x}");
                encode_response(TpmTag::RspCommand, code, &[])
            }
        }
    }

    fn dispatch(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        match request.ordinal {
            TpmOrd::CreateWrapKey => self.create_wrap_key(request),
            TpmOrd::LoadKey2 => self.load_key2(request),
            TpmOrd::FlushSpecific => self.flush_specific(request),
            TpmOrd::ChangeAuth => self.change_auth(request),
            TpmOrd::GetCapability => self.get_capability(request),
            TpmOrd::EstablishTransport => self.establish_transport(request),
            TpmOrd::ExecuteTransport => self.execute_transport(request),
            TpmOrd::ReleaseTransportSigned => self.release_transport(request),
            TpmOrd::DelegateManage => self.delegate_manage(request),
            TpmOrd::DelegateCreateOwnerDelegation => self.create_delegation(request, false),
            TpmOrd::DelegateCreateKeyDelegation => self.create_delegation(request, true),
            TpmOrd::DelegateLoadOwnerDelegation => self.load_owner_delegation(request),
            TpmOrd::DelegateReadTable => self.read_table(request),
        }
    }

    fn verify_owner(&self, request: &Request<'_>) -> RcResult<()> {
        request.expect_auths(1)?;
        request.verify(0, &self.config.owner_auth)
    }

    fn get_capability(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let area = p.u32()?;
        let property = p.u32()?;
        p.finish()?;
        if area != tpm_cap::PROPERTY {
            return Err(tpm_rc::BAD_PARAMETER);
        }
        let value = match property {
            tpm_cap::PROP_MAX_KEYS => self.config.max_keys,
            tpm_cap::PROP_FAMILY_ROWS => self.config.family_rows,
            tpm_cap::PROP_DELEGATE_ROWS => self.config.delegate_rows,
            _ => return Err(tpm_rc::BAD_PARAMETER),
        };
        Ok(sized(&value.to_be_bytes()))
    }
}

/// Size-prefixed body field
fn sized(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + data.len());
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out
}
