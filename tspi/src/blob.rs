// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! DER transport form for key and credential blobs
//!
//! ```text
//! TssBlob ::= SEQUENCE {
//!     structVersion  INTEGER (1),
//!     blobType       INTEGER,
//!     blobLength     INTEGER,
//!     blob           OCTET STRING
//! }
//! ```

use crate::error::{Error, Result};

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_SEQUENCE: u8 = 0x30;

const STRUCT_VERSION: u64 = 1;

/// Blob kinds (TSS_BLOB_TYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum BlobType {
    Key = 0x01,
    PubKey = 0x02,
    MigKey = 0x03,
    SealedData = 0x04,
    BoundData = 0x05,
    MigTicket = 0x06,
    PrivateKey = 0x07,
    PrivateKeyMod1 = 0x08,
    RandomXor = 0x09,
    CmkMigKey = 0x0A,
    CmkByteStream = 0x0B,
}

impl BlobType {
    pub fn to_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0x01 => Some(BlobType::Key),
            0x02 => Some(BlobType::PubKey),
            0x03 => Some(BlobType::MigKey),
            0x04 => Some(BlobType::SealedData),
            0x05 => Some(BlobType::BoundData),
            0x06 => Some(BlobType::MigTicket),
            0x07 => Some(BlobType::PrivateKey),
            0x08 => Some(BlobType::PrivateKeyMod1),
            0x09 => Some(BlobType::RandomXor),
            0x0A => Some(BlobType::CmkMigKey),
            0x0B => Some(BlobType::CmkByteStream),
            _ => None,
        }
    }
}

fn length_octets(len: usize) -> usize {
    if len < 0x80 {
        1
    } else {
        1 + (usize::BITS as usize / 8 - len.leading_zeros() as usize / 8)
    }
}

fn integer_content_len(v: u64) -> usize {
    // Minimal two's complement: one extra zero octet when the top bit is set
    let bytes = (8 - v.leading_zeros() as usize / 8).max(1);
    let top = (v >> ((bytes - 1) * 8)) as u8;
    bytes + usize::from(top & 0x80 != 0)
}

fn tlv_len(content_len: usize) -> usize {
    1 + length_octets(content_len) + content_len
}

fn body_len(raw_len: usize, blob_type: BlobType) -> usize {
    tlv_len(integer_content_len(STRUCT_VERSION))
        + tlv_len(integer_content_len(blob_type.to_u32() as u64))
        + tlv_len(integer_content_len(raw_len as u64))
        + tlv_len(raw_len)
}

/// Bytes needed to encode `raw_len` bytes of payload
pub fn encoded_len(raw_len: usize, blob_type: BlobType) -> usize {
    tlv_len(body_len(raw_len, blob_type))
}

struct Writer<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl Writer<'_> {
    fn byte(&mut self, b: u8) {
        self.out[self.pos] = b;
        self.pos += 1;
    }

    fn bytes(&mut self, b: &[u8]) {
        self.out[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    fn header(&mut self, tag: u8, len: usize) {
        self.byte(tag);
        if len < 0x80 {
            self.byte(len as u8);
        } else {
            let n = length_octets(len) - 1;
            self.byte(0x80 | n as u8);
            self.bytes(&len.to_be_bytes()[std::mem::size_of::<usize>() - n..]);
        }
    }

    fn integer(&mut self, v: u64) {
        let len = integer_content_len(v);
        self.header(TAG_INTEGER, len);
        let be = v.to_be_bytes();
        if len > 8 {
            self.byte(0);
            self.bytes(&be);
        } else {
            self.bytes(&be[8 - len..]);
        }
    }
}

/// Encode `raw` into `out`, returning the number of bytes written.
///
/// `out` must hold at least [`encoded_len`] bytes; nothing is truncated.
pub fn encode(raw: &[u8], blob_type: BlobType, out: &mut [u8]) -> Result<usize> {
    let needed = encoded_len(raw.len(), blob_type);
    if out.len() < needed {
        return Err(Error::bad_parameter(format!(
            "output buffer holds {} bytes, encoding needs {}",
            out.len(),
            needed
        )));
    }
    let mut w = Writer { out, pos: 0 };
    w.header(TAG_SEQUENCE, body_len(raw.len(), blob_type));
    w.integer(STRUCT_VERSION);
    w.integer(blob_type.to_u32() as u64);
    w.integer(raw.len() as u64);
    w.header(TAG_OCTET_STRING, raw.len());
    w.bytes(raw);
    debug_assert_eq!(w.pos, needed);
    Ok(w.pos)
}

pub fn encode_to_vec(raw: &[u8], blob_type: BlobType) -> Vec<u8> {
    let mut out = vec![0u8; encoded_len(raw.len(), blob_type)];
    let Ok(n) = encode(raw, blob_type, &mut out) else {
        unreachable!("buffer sized by encoded_len");
    };
    out.truncate(n);
    out
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn malformed(what: &str) -> Error {
        Error::bad_parameter(format!("malformed DER blob: {what}"))
    }

    fn byte(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| Self::malformed("truncated"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| Self::malformed("length exceeds input"))?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn header(&mut self, tag: u8) -> Result<usize> {
        if self.byte()? != tag {
            return Err(Self::malformed("unexpected tag"));
        }
        let first = self.byte()?;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let n = (first & 0x7F) as usize;
        if n == 0 || n > std::mem::size_of::<usize>() {
            return Err(Self::malformed("unsupported length form"));
        }
        let mut len = 0usize;
        for b in self.take(n)? {
            len = (len << 8) | *b as usize;
        }
        if len > self.data.len() - self.pos {
            return Err(Self::malformed("length exceeds input"));
        }
        Ok(len)
    }

    fn integer(&mut self) -> Result<u64> {
        let len = self.header(TAG_INTEGER)?;
        let content = self.take(len)?;
        if content.is_empty() || content[0] & 0x80 != 0 {
            return Err(Self::malformed("integer must be non-negative"));
        }
        let content = match content {
            [0, rest @ ..] if !rest.is_empty() => rest,
            c => c,
        };
        if content.len() > 8 {
            return Err(Self::malformed("integer too large"));
        }
        Ok(content.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64))
    }
}

fn parse(encoded: &[u8]) -> Result<(BlobType, &[u8])> {
    let mut r = Reader {
        data: encoded,
        pos: 0,
    };
    let seq_len = r.header(TAG_SEQUENCE)?;
    if r.pos.checked_add(seq_len) != Some(encoded.len()) {
        return Err(Reader::malformed("sequence length does not match input"));
    }
    if r.integer()? != STRUCT_VERSION {
        return Err(Reader::malformed("unsupported structure version"));
    }
    let type_raw = r.integer()?;
    let blob_type = u32::try_from(type_raw)
        .ok()
        .and_then(BlobType::from_u32)
        .ok_or_else(|| Error::bad_parameter(format!("unknown blob type {type_raw}")))?;
    let declared = r.integer()?;
    let len = r.header(TAG_OCTET_STRING)?;
    let raw = r.take(len)?;
    if declared != raw.len() as u64 {
        return Err(Reader::malformed("blob length field disagrees with payload"));
    }
    if r.pos != encoded.len() {
        return Err(Reader::malformed("trailing bytes"));
    }
    Ok((blob_type, raw))
}

/// Decode `encoded` into `out`.
///
/// `out_len` carries the caller's declared capacity in and the payload length
/// out. Passing no buffer with a zero declared length asks for the size only.
/// Every check runs before the first byte is written, so a failing call
/// leaves `out` exactly as it was.
pub fn decode(encoded: &[u8], out: Option<&mut [u8]>, out_len: &mut usize) -> Result<BlobType> {
    let (blob_type, raw) = parse(encoded)?;
    match out {
        None if *out_len != 0 => Err(Error::bad_parameter(format!(
            "no output buffer but declared length {}",
            *out_len
        ))),
        None => {
            *out_len = raw.len();
            Ok(blob_type)
        }
        Some(buf) => {
            if *out_len > buf.len() {
                return Err(Error::bad_parameter(format!(
                    "declared length {} exceeds buffer of {} bytes",
                    *out_len,
                    buf.len()
                )));
            }
            if *out_len < raw.len() {
                return Err(Error::bad_parameter(format!(
                    "declared length {} is smaller than blob of {} bytes",
                    *out_len,
                    raw.len()
                )));
            }
            buf[..raw.len()].copy_from_slice(raw);
            *out_len = raw.len();
            Ok(blob_type)
        }
    }
}

pub fn decode_to_vec(encoded: &[u8]) -> Result<(BlobType, Vec<u8>)> {
    let (blob_type, raw) = parse(encoded)?;
    Ok((blob_type, raw.to_vec()))
}
