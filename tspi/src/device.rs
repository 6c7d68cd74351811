// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Device communication layer
//!
//! Commands are framed as `tag | size | ordinal | body` and answered with
//! `tag | size | result | body`, all big-endian. Authorized commands append one
//! `nonce_odd | hmac` trailer per authorization.

use fs_err::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use crate::auth::{command_hmac, fresh_nonce, AuthValue, Nonce, AUTH_SIZE};
use crate::constants::*;
use crate::error::{Error, Result};
use crate::marshal::*;

/// Maximum command/response size
pub const MAX_COMMAND_SIZE: usize = 4096;

/// Header length shared by commands and responses
pub const HEADER_SIZE: usize = 10;

/// Size of one authorization trailer
pub const AUTH_TRAILER_SIZE: usize = 2 * AUTH_SIZE;

/// Anything that can carry one framed command to a device and bring back its answer
pub trait Transmit {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>>;
}

/// Device endpoint reached through a file descriptor
pub struct FileDevice {
    file: File,
    path: String,
}

impl FileDevice {
    /// Open a device endpoint
    pub fn open(path: &str) -> Result<Self> {
        let device_path = path.strip_prefix("device:").unwrap_or(path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device_path)?;

        Ok(Self {
            file,
            path: device_path.to_string(),
        })
    }

    /// Detect and open the default device
    pub fn detect() -> Result<Self> {
        if Path::new("/dev/tpm0").exists() {
            Self::open("/dev/tpm0")
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "TPM device not found",
            )))
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Transmit for FileDevice {
    fn transmit(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.file.write_all(command)?;

        let mut response = vec![0u8; MAX_COMMAND_SIZE];
        let n = self.file.read(&mut response)?;

        response.truncate(n);
        Ok(response)
    }
}

/// One authorization proof to attach to a command
pub struct Authorization<'a> {
    pub auth: &'a AuthValue,
    pub nonce_odd: Nonce,
}

impl<'a> Authorization<'a> {
    pub fn new(auth: &'a AuthValue) -> Self {
        Self {
            auth,
            nonce_odd: fresh_nonce(),
        }
    }
}

/// Command builder
pub struct TpmCommand {
    ordinal: TpmOrd,
    buf: CommandBuffer,
}

impl TpmCommand {
    pub fn new(ordinal: TpmOrd) -> Self {
        let mut buf = CommandBuffer::with_capacity(256);

        // Header: tag (2) + size (4) + ordinal (4); tag and size are patched on finalize
        buf.put_u16(TpmTag::RquCommand.to_u16());
        buf.put_u32(0);
        buf.put_u32(ordinal.to_u32());

        Self { ordinal, buf }
    }

    pub fn ordinal(&self) -> TpmOrd {
        self.ordinal
    }

    pub fn add_handle(&mut self, handle: u32) {
        self.buf.put_u32(handle);
    }

    pub fn add_bytes(&mut self, data: &[u8]) {
        self.buf.put_bytes(data);
    }

    pub fn add_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn add_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn add_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn add_sized(&mut self, data: &[u8]) {
        self.buf.put_sized(data);
    }

    pub fn add<T: Marshal>(&mut self, value: &T) {
        value.marshal(&mut self.buf);
    }

    /// Finalize without authorization
    pub fn finalize(self) -> Vec<u8> {
        self.finalize_authorized(&[])
    }

    /// Finalize, appending one trailer per authorization
    ///
    /// Every HMAC covers the ordinal and all parameter bytes written so far.
    pub fn finalize_authorized(mut self, auths: &[Authorization<'_>]) -> Vec<u8> {
        let params = self.buf.as_bytes()[HEADER_SIZE..].to_vec();
        for a in auths {
            let hmac = command_hmac(a.auth, self.ordinal.to_u32(), &params, &a.nonce_odd);
            self.buf.put_bytes(&a.nonce_odd);
            self.buf.put_bytes(&hmac);
        }
        let tag = TpmTag::request(auths.len()).unwrap_or(TpmTag::RquAuth2);

        let mut bytes = self.buf.into_vec();
        bytes[0..2].copy_from_slice(&tag.to_u16().to_be_bytes());
        let size = bytes.len() as u32;
        bytes[2..6].copy_from_slice(&size.to_be_bytes());
        bytes
    }
}

/// Parsed response frame
#[derive(Debug, Clone)]
pub struct TpmResponse {
    pub tag: TpmTag,
    pub response_code: u32,
    pub data: Vec<u8>,
}

impl TpmResponse {
    pub fn parse(response: &[u8]) -> Result<Self> {
        if response.len() < HEADER_SIZE {
            return Err(Error::protocol(format!(
                "TPM response too short: {} bytes",
                response.len()
            )));
        }

        let mut buf = ResponseBuffer::new(response);

        let tag_raw = buf.get_u16()?;
        let tag = TpmTag::from_u16(tag_raw)
            .filter(|t| t.is_response())
            .ok_or_else(|| Error::protocol(format!("invalid response tag: 0x{:04x}", tag_raw)))?;

        let size = buf.get_u32()? as usize;
        if size < HEADER_SIZE || response.len() < size {
            return Err(Error::protocol(format!(
                "TPM response size mismatch: expected {}, got {}",
                size,
                response.len()
            )));
        }

        let response_code = buf.get_u32()?;
        let data = response[HEADER_SIZE..size].to_vec();

        Ok(Self {
            tag,
            response_code,
            data,
        })
    }

    pub fn is_success(&self) -> bool {
        self.response_code == tpm_rc::SUCCESS
    }

    /// Turn a failure code into an error attributed to `ordinal`
    pub fn ensure_success(&self, ordinal: TpmOrd) -> Result<()> {
        if self.is_success() {
            Ok(())
        } else {
            Err(Error::Device {
                ordinal,
                code: self.response_code,
            })
        }
    }

    pub fn data_buffer(&self) -> ResponseBuffer<'_> {
        ResponseBuffer::new(&self.data)
    }

    /// Re-frame the response
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_response(self.tag, self.response_code, &self.data)
    }
}

pub fn encode_response(tag: TpmTag, code: u32, data: &[u8]) -> Vec<u8> {
    let mut buf = CommandBuffer::with_capacity(HEADER_SIZE + data.len());
    buf.put_u16(tag.to_u16());
    buf.put_u32((HEADER_SIZE + data.len()) as u32);
    buf.put_u32(code);
    buf.put_bytes(data);
    buf.into_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let mut cmd = TpmCommand::new(TpmOrd::GetCapability);
        cmd.add_u32(tpm_cap::PROPERTY);
        cmd.add_u32(tpm_cap::PROP_MAX_KEYS);

        let bytes = cmd.finalize();

        assert_eq!(&bytes[0..2], &[0x00, 0xC1]);
        assert_eq!(&bytes[6..10], &[0x00, 0x00, 0x00, 0x65]);
        let size = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        assert_eq!(size as usize, bytes.len());
    }

    #[test]
    fn test_authorized_command_layout() {
        let auth = AuthValue::well_known();
        let mut cmd = TpmCommand::new(TpmOrd::LoadKey2);
        cmd.add_handle(tpm_kh::SRK);
        let a = Authorization::new(&auth);
        let nonce = a.nonce_odd;

        let bytes = cmd.finalize_authorized(&[a]);

        assert_eq!(&bytes[0..2], &[0x00, 0xC2]);
        assert_eq!(bytes.len(), HEADER_SIZE + 4 + AUTH_TRAILER_SIZE);
        assert_eq!(&bytes[14..34], &nonce);
        let expected = command_hmac(&auth, TpmOrd::LoadKey2.to_u32(), &bytes[10..14], &nonce);
        assert_eq!(&bytes[34..54], &expected);
    }

    #[test]
    fn test_response_parse() {
        let response = vec![
            0x00, 0xC4, // TPM_TAG_RSP_COMMAND
            0x00, 0x00, 0x00, 0x0A, // Size = 10
            0x00, 0x00, 0x00, 0x00, // TPM_SUCCESS
        ];

        let parsed = TpmResponse::parse(&response).unwrap();
        assert!(parsed.is_success());
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_response_error_code() {
        let bytes = encode_response(TpmTag::RspCommand, tpm_rc::AUTHFAIL, &[]);
        let parsed = TpmResponse::parse(&bytes).unwrap();
        let err = parsed.ensure_success(TpmOrd::LoadKey2).unwrap_err();
        assert_eq!(err.code(), Some(tpm_rc::AUTHFAIL));
    }

    #[test]
    fn test_rejects_request_tag() {
        let bytes = [0x00, 0xC1, 0, 0, 0, 10, 0, 0, 0, 0];
        assert!(TpmResponse::parse(&bytes).is_err());
    }

    #[test]
    fn test_open_missing_device() {
        assert!(FileDevice::open("device:/nonexistent/tpm").is_err());
    }
}
