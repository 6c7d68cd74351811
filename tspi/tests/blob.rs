// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Blob envelope encoding through the public API

use tspi::blob::{decode, decode_to_vec, encode, encode_to_vec, encoded_len};
use tspi::{BlobType, ErrorKind};

#[test]
fn test_round_trip_long_payloads() {
    // Short, one-byte and two-byte DER length forms
    for len in [0usize, 100, 200, 70_000] {
        let raw: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let encoded = encode_to_vec(&raw, BlobType::BoundData);
        assert_eq!(encoded.len(), encoded_len(len, BlobType::BoundData));

        let (blob_type, decoded) = decode_to_vec(&encoded).unwrap();
        assert_eq!(blob_type, BlobType::BoundData);
        assert_eq!(decoded, raw);
    }
}

#[test]
fn test_short_declared_length_leaves_buffer_untouched() {
    let raw = [0x42u8; 32];
    let encoded = encode_to_vec(&raw, BlobType::Key);

    let mut out = [0xEEu8; 64];
    let mut len = 16;
    let err = decode(&encoded, Some(&mut out), &mut len).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);
    assert_eq!(out, [0xEEu8; 64]);
    assert_eq!(len, 16);

    let mut len = out.len();
    assert_eq!(decode(&encoded, Some(&mut out), &mut len).unwrap(), BlobType::Key);
    assert_eq!(len, 32);
    assert_eq!(&out[..32], &raw);
    assert_eq!(out[32], 0xEE);
}

#[test]
fn test_size_query() {
    let encoded = encode_to_vec(b"abc", BlobType::PubKey);
    let mut len = 0;
    assert_eq!(decode(&encoded, None, &mut len).unwrap(), BlobType::PubKey);
    assert_eq!(len, 3);

    let mut len = 3;
    assert!(decode(&encoded, None, &mut len).is_err());
}

#[test]
fn test_encode_into_small_buffer() {
    let raw = [1u8; 10];
    let mut out = [0u8; 8];
    let err = encode(&raw, BlobType::MigKey, &mut out).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BadParameter);
    assert_eq!(out, [0u8; 8]);

    let mut out = vec![0u8; encoded_len(raw.len(), BlobType::MigKey)];
    assert_eq!(encode(&raw, BlobType::MigKey, &mut out).unwrap(), out.len());
}

#[test]
fn test_rejects_corrupted_envelopes() {
    let encoded = encode_to_vec(b"payload", BlobType::SealedData);

    let mut truncated = encoded.clone();
    truncated.pop();
    assert!(decode_to_vec(&truncated).is_err());

    let mut trailing = encoded.clone();
    trailing.push(0);
    assert!(decode_to_vec(&trailing).is_err());

    // Blob type 0x0C is not defined
    let mut unknown = encoded;
    unknown[7] = 0x0C;
    assert_eq!(
        decode_to_vec(&unknown).unwrap_err().kind(),
        ErrorKind::BadParameter
    );
}
