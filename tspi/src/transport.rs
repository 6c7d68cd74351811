// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Transport sessions
//!
//! While a session is active every command the context sends is carried
//! inside ExecuteTransport. Both ends fold each exchange into a SHA-256 hash
//! chain; releasing the session returns the device's chain, which must equal
//! the host's before anything done under the session is trusted.

use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::auth::{fresh_nonce, sha256, AuthValue, Nonce};
use crate::constants::*;
use crate::context::Context;
use crate::device::{TpmCommand, TpmResponse, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::types::*;

pub type LogDigest = [u8; 32];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Active,
    Finalized,
}

/// Direction of a wrapped body, mixed into the stream nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Command = 0,
    Response = 1,
}

/// Encrypt or decrypt the body of a wrapped frame in place
pub(crate) fn apply_session_cipher(key: &[u8; 32], seq: u32, direction: Direction, frame: &mut [u8]) {
    if frame.len() <= HEADER_SIZE {
        return;
    }
    let mut nonce = [0u8; 12];
    nonce[..4].copy_from_slice(&seq.to_be_bytes());
    nonce[4] = direction as u8;
    let mut cipher = ChaCha20::new(key.into(), &nonce.into());
    cipher.apply_keystream(&mut frame[HEADER_SIZE..]);
}

pub(crate) fn session_key(secret: &[u8], nonce_even: &Nonce) -> Zeroizing<[u8; 32]> {
    Zeroizing::new(sha256(&[secret, nonce_even]))
}

/// Fold one exchange into the log chain
pub(crate) fn extend_log(log: &mut LogDigest, seq: u32, command: &[u8], response: &[u8]) {
    let entry = sha256(&[&seq.to_be_bytes(), &sha256(&[command]), &sha256(&[response])]);
    *log = sha256(&[log.as_slice(), &entry]);
}

/// Proof returned by a successful finalize
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportReceipt {
    pub digest: LogDigest,
    pub anti_replay: Nonce,
    /// Empty for sessions opened without a signing key
    pub signature: Vec<u8>,
    pub commands: u32,
}

pub(crate) struct TransportSession {
    state: TransportState,
    sign_key: Option<KeyHandle>,
    handle: u32,
    session_key: Option<Zeroizing<[u8; 32]>>,
    seq: u32,
    log: LogDigest,
    commands: u32,
    /// Set once the device no longer holds the session
    released: bool,
}

impl Context {
    fn session(&self, session: TransportHandle) -> Result<&TransportSession> {
        self.transports
            .get(session.0)
            .ok_or_else(|| Error::invalid_handle(format!("{session} is not a transport session")))
    }

    fn session_mut(&mut self, session: TransportHandle) -> Result<&mut TransportSession> {
        self.transports
            .get_mut(session.0)
            .ok_or_else(|| Error::invalid_handle(format!("{session} is not a transport session")))
    }

    pub fn transport_state(&self, session: TransportHandle) -> Result<TransportState> {
        Ok(self.session(session)?.state)
    }

    /// Host view of the running log digest
    pub fn transport_log(&self, session: TransportHandle) -> Result<LogDigest> {
        Ok(self.session(session)?.log)
    }

    pub fn active_transport(&self) -> Option<TransportHandle> {
        self.active_transport
    }

    /// Open a transport session.
    ///
    /// `wrap` encrypts command bodies under a session key bound to the
    /// configured storage key; `sign` has the configured signing key sign the
    /// log on release. At least one must be requested.
    pub fn begin_transport(&mut self, wrap: bool, sign: bool) -> Result<TransportHandle> {
        if !wrap && !sign {
            return Err(Error::bad_parameter(
                "a transport session needs wrapping, signing or both",
            ));
        }
        if let Some(active) = self.active_transport {
            return Err(Error::bad_parameter(format!(
                "{active} is still active on this context"
            )));
        }

        let keys = self.config().transport.clone();
        let wrap_key = if wrap {
            Some(self.transport_key(keys.ps, keys.wrap_key, KeyFlags::storage())?)
        } else {
            None
        };
        let sign_key = if sign {
            Some(self.transport_key(keys.ps, keys.sign_key, KeyFlags::signing())?)
        } else {
            None
        };

        let session = TransportHandle(self.transports.insert(TransportSession {
            state: TransportState::Uninitialized,
            sign_key,
            handle: 0,
            session_key: None,
            seq: 0,
            log: [0u8; 32],
            commands: 0,
            released: false,
        }));

        match self.establish(wrap_key) {
            Ok((handle, session_key)) => {
                let s = self.session_mut(session)?;
                s.handle = handle;
                s.session_key = session_key;
                s.state = TransportState::Active;
                self.active_transport = Some(session);
                info!("transport {session} established (wrap: {wrap}, sign: {sign})");
                Ok(session)
            }
            Err(e) => {
                self.transports.remove(session.0);
                Err(e)
            }
        }
    }

    fn establish(
        &mut self,
        wrap_key: Option<KeyHandle>,
    ) -> Result<(u32, Option<Zeroizing<[u8; 32]>>)> {
        let mut attributes = transport_attr::LOG;
        let secret = AuthValue::from_digest(fresh_nonce());
        match wrap_key {
            Some(key) => {
                attributes |= transport_attr::ENCRYPT;
                let handle = self.loaded_handle(key)?;
                let key_auth = self.require_key_auth(key)?;
                let (trans, nonce_even) =
                    self.tpm_establish_transport(Some((handle, &key_auth)), attributes, &secret)?;
                Ok((trans, Some(session_key(secret.as_bytes(), &nonce_even))))
            }
            None => {
                let (trans, _) = self.tpm_establish_transport(None, attributes, &secret)?;
                Ok((trans, None))
            }
        }
    }

    /// Find the registered transport key, or create and register it
    fn transport_key(&mut self, ps: PsType, uuid: KeyUuid, flags: KeyFlags) -> Result<KeyHandle> {
        match self.load(KeyRef::Uuid(ps, uuid)) {
            Ok(resolution) => return resolution.into_loaded(),
            Err(Error::NotRegistered { .. }) if self.store(ps).get(&uuid).is_none() => {}
            Err(e) => return Err(e),
        }

        debug!("creating transport key {uuid}");
        let key = self.create_key_object(flags);
        let srk = self.srk();
        self.create_key(key, srk)?;
        match self.register_key(key, ps, uuid, PsType::System, KeyUuid::SRK) {
            Ok(()) => {}
            Err(Error::AlreadyRegistered { .. }) => {
                self.close_key(key)?;
                let existing = self.get_registered_key_by_uuid(ps, uuid)?;
                return self.load(KeyRef::Handle(existing))?.into_loaded();
            }
            Err(e) => return Err(e),
        }
        self.load(KeyRef::Handle(key))?.into_loaded()
    }

    /// Send one framed command under `session`, returning the device reply
    pub fn transport_execute(
        &mut self,
        session: TransportHandle,
        command: &[u8],
    ) -> Result<TpmResponse> {
        self.execute_in_session(session, command)
    }

    pub(crate) fn execute_in_session(
        &mut self,
        session: TransportHandle,
        command: &[u8],
    ) -> Result<TpmResponse> {
        let s = self.session(session)?;
        match s.state {
            TransportState::Active => {}
            TransportState::Finalized => {
                return Err(Error::SessionFinalized {
                    session: session.to_string(),
                })
            }
            TransportState::Uninitialized => {
                return Err(Error::bad_parameter(format!("{session} is not established")))
            }
        }
        if command.len() < HEADER_SIZE {
            return Err(Error::bad_parameter("wrapped command is shorter than a header"));
        }
        let seq = s.seq + 1;
        let trans = s.handle;
        let key = s.session_key.clone();

        let mut wrapped = command.to_vec();
        if let Some(key) = &key {
            apply_session_cipher(key, seq, Direction::Command, &mut wrapped);
        }
        let mut cmd = TpmCommand::new(TpmOrd::ExecuteTransport);
        cmd.add_handle(trans);
        cmd.add_u32(seq);
        cmd.add_sized(&wrapped);

        let outer = self.transmit(&cmd.finalize())?;
        outer.ensure_success(TpmOrd::ExecuteTransport)?;
        let mut inner = outer.data_buffer().get_sized()?;
        if let Some(key) = &key {
            apply_session_cipher(key, seq, Direction::Response, &mut inner);
        }
        let response = TpmResponse::parse(&inner)?;

        let s = self.session_mut(session)?;
        s.seq = seq;
        s.commands += 1;
        extend_log(&mut s.log, seq, command, &inner);
        debug!("transport {session} seq {seq}: inner result 0x{:08x}", response.response_code);
        Ok(response)
    }

    /// Close the session and check the device log against the host log.
    ///
    /// The session is finalized before the device is asked, so it cannot be
    /// reused even when the release or the check fails. A failed release
    /// flushes the device session instead.
    pub fn finalize_transport(&mut self, session: TransportHandle) -> Result<TransportReceipt> {
        let s = self.session_mut(session)?;
        if s.state != TransportState::Active {
            return Err(Error::SessionFinalized {
                session: session.to_string(),
            });
        }
        s.state = TransportState::Finalized;
        s.session_key = None;
        let (trans, sign_key, host_log, commands) = (s.handle, s.sign_key, s.log, s.commands);
        if self.active_transport == Some(session) {
            self.active_transport = None;
        }

        let anti_replay = fresh_nonce();
        let released = match sign_key {
            Some(key) => self.loaded_handle(key).and_then(|handle| {
                let key_auth = self.require_key_auth(key)?;
                self.tpm_release_transport_signed(Some((handle, &key_auth)), trans, &anti_replay)
            }),
            None => self.tpm_release_transport_signed(None, trans, &anti_replay),
        };
        let (digest, signature) = match released {
            Ok(reply) => {
                self.session_mut(session)?.released = true;
                reply
            }
            Err(e) => {
                warn!("transport {session} release failed: {e}");
                self.flush_transport(session)?;
                return Err(e);
            }
        };

        if digest != host_log {
            warn!("transport {session} log mismatch");
            return Err(Error::IntegrityFailure {
                expected: hex::encode(host_log),
                actual: hex::encode(digest),
            });
        }
        info!("transport {session} released after {commands} commands");
        Ok(TransportReceipt {
            digest,
            anti_replay,
            signature,
            commands,
        })
    }

    /// Drop a session without verification, releasing device resources best-effort
    pub fn abandon_transport(&mut self, session: TransportHandle) -> Result<()> {
        let s = self.session_mut(session)?;
        s.state = TransportState::Finalized;
        s.session_key = None;
        if self.active_transport == Some(session) {
            self.active_transport = None;
        }
        if !self.session(session)?.released {
            self.flush_transport(session)?;
            info!("transport {session} abandoned");
        }
        Ok(())
    }

    /// Best-effort flush of a session the device may still hold
    fn flush_transport(&mut self, session: TransportHandle) -> Result<()> {
        let trans = self.session(session)?.handle;
        match self.tpm_flush_specific(trans, tpm_rt::TRANS) {
            Ok(()) => self.session_mut(session)?.released = true,
            Err(e) => warn!("failed to flush transport 0x{trans:08x}: {e}"),
        }
        Ok(())
    }
}
