// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Transport sessions on the device side

use zeroize::Zeroizing;

use super::{sized, RcResult, Request, SimState};
use crate::auth::{hmac_sha256, AuthValue, AUTH_SIZE};
use crate::constants::*;
use crate::device::{encode_response, HEADER_SIZE};
use crate::transport::{apply_session_cipher, extend_log, session_key, Direction, LogDigest};

pub(super) struct SimTransport {
    key: Option<Zeroizing<[u8; 32]>>,
    last_seq: u32,
    log: LogDigest,
}

impl SimState {
    pub(super) fn establish_transport(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let enc_key = p.u32()?;
        let attributes = p.u32()?;
        let secret = p.sized()?;
        p.finish()?;

        let encrypt = attributes & transport_attr::ENCRYPT != 0;
        let secret: [u8; AUTH_SIZE] = secret
            .as_slice()
            .try_into()
            .map_err(|_| tpm_rc::BAD_PARAMETER)?;
        let secret = if enc_key == tpm_kh::TRANSPORT {
            request.expect_auths(0)?;
            if encrypt {
                return Err(tpm_rc::BAD_PARAMETER);
            }
            AuthValue::from_digest(secret)
        } else {
            request.expect_auths(1)?;
            let id = self.loaded_object(enc_key)?;
            self.verify_key(request, 0, &id)?;
            let key = self.object(&id)?;
            if key.usage != KeyUsage::Storage {
                return Err(tpm_rc::INVALID_KEYUSAGE);
            }
            AuthValue::unseal(&secret, &key.usage_auth, request.nonce(0)?)
        };

        let nonce_even: [u8; AUTH_SIZE] = rand::random();
        let key = encrypt.then(|| session_key(secret.as_bytes(), &nonce_even));
        let handle = self.next_trans_handle;
        self.next_trans_handle += 1;
        self.transports.insert(
            handle,
            SimTransport {
                key,
                last_seq: 0,
                log: [0u8; 32],
            },
        );

        let mut body = handle.to_be_bytes().to_vec();
        body.extend_from_slice(&nonce_even);
        Ok(body)
    }

    /// Unwrap, run and log one inner command.
    ///
    /// Inner failures are carried in the wrapped reply; the outer frame only
    /// fails when the session or the counter is wrong.
    pub(super) fn execute_transport(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let trans = p.u32()?;
        let seq = p.u32()?;
        let mut inner = p.sized()?;
        p.finish()?;
        request.expect_auths(0)?;

        let session = self.transports.get(&trans).ok_or(tpm_rc::INVALID_AUTHHANDLE)?;
        if seq <= session.last_seq {
            return Err(tpm_rc::BAD_COUNTER);
        }
        let key = session.key.clone();
        if let Some(key) = &key {
            apply_session_cipher(key, seq, Direction::Command, &mut inner);
        }

        let wrapped_control = inner.len() >= HEADER_SIZE
            && TpmOrd::from_u32(u32::from_be_bytes([inner[6], inner[7], inner[8], inner[9]]))
                .is_some_and(TpmOrd::is_transport_control);
        let mut reply = if wrapped_control {
            encode_response(TpmTag::RspCommand, tpm_rc::BAD_ORDINAL, &[])
        } else {
            self.execute(&inner)
        };

        // The inner command may have flushed this very session
        if let Some(session) = self.transports.get_mut(&trans) {
            session.last_seq = seq;
            extend_log(&mut session.log, seq, &inner, &reply);
        }
        if let Some(key) = &key {
            apply_session_cipher(key, seq, Direction::Response, &mut reply);
        }
        Ok(sized(&reply))
    }

    pub(super) fn release_transport(&mut self, request: &Request<'_>) -> RcResult<Vec<u8>> {
        let mut p = request.params();
        let sign_key = p.u32()?;
        let trans = p.u32()?;
        let anti_replay: [u8; AUTH_SIZE] = p.array()?;
        p.finish()?;

        let signer = if sign_key == tpm_kh::TRANSPORT {
            request.expect_auths(0)?;
            None
        } else {
            request.expect_auths(1)?;
            let id = self.loaded_object(sign_key)?;
            self.verify_key(request, 0, &id)?;
            let key = self.object(&id)?;
            if key.usage != KeyUsage::Signing {
                return Err(tpm_rc::INVALID_KEYUSAGE);
            }
            Some(key.private)
        };
        let session = self.transports.remove(&trans).ok_or(tpm_rc::INVALID_AUTHHANDLE)?;

        let signature = match signer {
            Some(private) => {
                hmac_sha256(&private, &[session.log.as_slice(), anti_replay.as_slice()]).to_vec()
            }
            None => Vec::new(),
        };
        let mut body = session.log.to_vec();
        body.extend_from_slice(&sized(&signature));
        Ok(body)
    }
}
