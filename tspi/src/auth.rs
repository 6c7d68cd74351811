// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Authorization values and the digests built from them

use hmac::{Hmac, Mac};
use sha1::{Digest, Sha1};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

pub const AUTH_SIZE: usize = 20;

/// Caller nonce carried in every authorization trailer
pub type Nonce = [u8; AUTH_SIZE];

pub fn fresh_nonce() -> Nonce {
    rand::random()
}

/// 20-byte authorization value (TPM_AUTHDATA), zeroed on drop
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct AuthValue([u8; AUTH_SIZE]);

impl AuthValue {
    pub fn from_digest(digest: [u8; AUTH_SIZE]) -> Self {
        Self(digest)
    }

    /// All-zero secret used by keys and roots without a real secret
    pub fn well_known() -> Self {
        Self([0u8; AUTH_SIZE])
    }

    pub fn as_bytes(&self) -> &[u8; AUTH_SIZE] {
        &self.0
    }

    /// Hide `self` for transmission under `shared` (ADIP style XOR)
    pub fn seal(&self, shared: &AuthValue, nonce: &Nonce) -> [u8; AUTH_SIZE] {
        xor_pad(&self.0, shared, nonce)
    }

    /// Recover a value hidden with [`AuthValue::seal`]
    pub fn unseal(sealed: &[u8; AUTH_SIZE], shared: &AuthValue, nonce: &Nonce) -> Self {
        Self(xor_pad(sealed, shared, nonce))
    }
}

impl std::fmt::Debug for AuthValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthValue(..)")
    }
}

fn xor_pad(data: &[u8; AUTH_SIZE], shared: &AuthValue, nonce: &Nonce) -> [u8; AUTH_SIZE] {
    let pad = sha1(&[shared.as_bytes(), nonce]);
    let mut out = [0u8; AUTH_SIZE];
    for (o, (d, p)) in out.iter_mut().zip(data.iter().zip(pad.iter())) {
        *o = d ^ p;
    }
    out
}

pub fn sha1(parts: &[&[u8]]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

pub fn sha256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Command authorization:
/// `HMAC-SHA1(auth, SHA1(ordinal || params) || nonce_odd)`
pub fn command_hmac(auth: &AuthValue, ordinal: u32, params: &[u8], nonce_odd: &Nonce) -> [u8; 20] {
    let param_digest = sha1(&[&ordinal.to_be_bytes(), params]);
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(auth.as_bytes()) else {
        unreachable!("HMAC accepts keys of any length");
    };
    mac.update(&param_digest);
    mac.update(nonce_odd);
    let mut out = [0u8; 20];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

/// Keyed SHA-256 used for transport release signatures
pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(key) else {
        unreachable!("HMAC accepts keys of any length");
    };
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_unseal() {
        let secret = AuthValue::from_digest(sha1(&[b"new password"]));
        let shared = AuthValue::from_digest([7u8; 20]);
        let nonce = fresh_nonce();

        let sealed = secret.seal(&shared, &nonce);
        assert_ne!(&sealed, secret.as_bytes());
        assert_eq!(AuthValue::unseal(&sealed, &shared, &nonce), secret);
    }

    #[test]
    fn test_command_hmac_binds_nonce() {
        let auth = AuthValue::well_known();
        let a = command_hmac(&auth, 0x41, b"params", &[1u8; 20]);
        let b = command_hmac(&auth, 0x41, b"params", &[2u8; 20]);
        assert_ne!(a, b);
        assert_eq!(a, command_hmac(&auth, 0x41, b"params", &[1u8; 20]));
    }

    #[test]
    fn test_sha1_known_answer() {
        assert_eq!(
            hex::encode(sha1(&[b"abc"])),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn test_debug_hides_value() {
        let auth = AuthValue::from_digest([0x41; 20]);
        assert_eq!(format!("{:?}", auth), "AuthValue(..)");
    }
}
