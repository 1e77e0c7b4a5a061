//! ASN.1 encoding of public keys and ECDSA signatures
//!
//! The layouts are fixed and byte-compatible with existing consumers:
//!
//! ```text
//! public key (91 bytes):
//!   30 59
//!     30 13
//!       06 07 2A 86 48 CE 3D 02 01          id-ecPublicKey
//!       06 08 2A 86 48 CE 3D 03 01 07       prime256v1
//!     03 42 00 04 <x:32> <y:32>
//!
//! signature (70..=72 bytes):
//!   30 LL
//!     02 20|21 [00] <r:32>
//!     02 20|21 [00] <s:32>
//! ```
//!
//! R and S are always written with all 32 bytes; a `00` is prepended only
//! when the most significant bit is set.

use crate::types::{EncodedPublicKey, EncodedSignature};
use crate::{KeyringError, KeyringResult};
use keyring_hardware_hal::{EccPoint, RawSignature, COORDINATE_LEN, UNCOMPRESSED_POINT_TAG};

/// SEQUENCE (constructed)
pub const TAG_SEQUENCE: u8 = 0x30;
/// INTEGER
pub const TAG_INTEGER: u8 = 0x02;
/// BIT STRING
pub const TAG_BIT_STRING: u8 = 0x03;
/// OBJECT IDENTIFIER
pub const TAG_OID: u8 = 0x06;

/// id-ecPublicKey (1.2.840.10045.2.1)
pub const OID_EC_PUBLIC_KEY: [u8; 7] = [0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x02, 0x01];
/// prime256v1 (1.2.840.10045.3.1.7)
pub const OID_PRIME256V1: [u8; 8] = [0x2A, 0x86, 0x48, 0xCE, 0x3D, 0x03, 0x01, 0x07];

/// Total size of an encoded public key
pub const ENCODED_PUBLIC_KEY_LEN: usize = 91;
/// Offset of the `04 || x || y` point inside an encoded public key
pub const SEC1_POINT_OFFSET: usize = 26;
/// Shortest encoded signature (neither R nor S padded)
pub const MIN_SIGNATURE_LEN: usize = 70;
/// Longest encoded signature (both R and S padded)
pub const MAX_SIGNATURE_LEN: usize = 72;

/// Minimal tag-length-value builder.
///
/// Lengths below 128 use the short form; longer contents use the minimal
/// long form (`81 LL`, `82 LL LL`, ...).
#[derive(Debug, Default)]
pub struct TlvWriter {
    buf: Vec<u8>,
}

impl TlvWriter {
    /// Writer with preallocated capacity
    pub fn with_capacity(capacity: usize) -> Self {
        TlvWriter {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// Append raw bytes
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    /// Append one primitive element
    pub fn tlv(&mut self, tag: u8, content: &[u8]) -> &mut Self {
        self.buf.push(tag);
        self.length(content.len());
        self.buf.extend_from_slice(content);
        self
    }

    /// Append a constructed element whose content is produced by `build`
    pub fn constructed<F>(&mut self, tag: u8, build: F) -> &mut Self
    where
        F: FnOnce(&mut TlvWriter),
    {
        let mut inner = TlvWriter::default();
        build(&mut inner);
        self.tlv(tag, &inner.buf)
    }

    /// Encoded bytes
    pub fn finish(self) -> Vec<u8> {
        self.buf
    }

    fn length(&mut self, len: usize) {
        if len < 0x80 {
            self.buf.push(len as u8);
            return;
        }

        let bytes = (len as u64).to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        self.buf.push(0x80 | (bytes.len() - skip) as u8);
        self.buf.extend_from_slice(&bytes[skip..]);
    }
}

/// Encode an EC public point as SubjectPublicKeyInfo
pub fn encode_public_key(point: &EccPoint) -> EncodedPublicKey {
    let mut bit_string = Vec::with_capacity(2 + 2 * COORDINATE_LEN);
    bit_string.push(0x00); // no unused bits
    bit_string.push(UNCOMPRESSED_POINT_TAG);
    bit_string.extend_from_slice(&point.x);
    bit_string.extend_from_slice(&point.y);

    let mut writer = TlvWriter::with_capacity(ENCODED_PUBLIC_KEY_LEN);
    writer.constructed(TAG_SEQUENCE, |spki| {
        spki.constructed(TAG_SEQUENCE, |algorithm| {
            algorithm
                .tlv(TAG_OID, &OID_EC_PUBLIC_KEY)
                .tlv(TAG_OID, &OID_PRIME256V1);
        })
        .tlv(TAG_BIT_STRING, &bit_string);
    });

    EncodedPublicKey(writer.finish())
}

fn integer_content(value: &[u8; COORDINATE_LEN]) -> Vec<u8> {
    let mut content = Vec::with_capacity(COORDINATE_LEN + 1);
    if value[0] & 0x80 != 0 {
        content.push(0x00);
    }
    content.extend_from_slice(value);
    content
}

/// Encode raw (R, S) as a SEQUENCE of two INTEGERs
pub fn encode_signature(signature: &RawSignature) -> EncodedSignature {
    let r = integer_content(&signature.r);
    let s = integer_content(&signature.s);

    let mut writer = TlvWriter::with_capacity(MAX_SIGNATURE_LEN);
    writer.constructed(TAG_SEQUENCE, |seq| {
        seq.tlv(TAG_INTEGER, &r).tlv(TAG_INTEGER, &s);
    });

    EncodedSignature(writer.finish())
}

fn read_integer<'a>(bytes: &'a [u8], name: &str) -> KeyringResult<([u8; COORDINATE_LEN], &'a [u8])> {
    let malformed = |what: &str| KeyringError::Encoding(format!("{}: {}", name, what));

    if bytes.len() < 2 || bytes[0] != TAG_INTEGER {
        return Err(malformed("expected INTEGER"));
    }
    let len = bytes[1] as usize;
    let content = bytes
        .get(2..2 + len)
        .ok_or_else(|| malformed("truncated"))?;

    let value = match len {
        COORDINATE_LEN if content[0] & 0x80 == 0 => content,
        33 if content[0] == 0x00 && content[1] & 0x80 != 0 => &content[1..],
        _ => return Err(malformed("unexpected integer layout")),
    };

    let mut out = [0u8; COORDINATE_LEN];
    out.copy_from_slice(value);
    Ok((out, &bytes[2 + len..]))
}

/// Parse a signature produced by [`encode_signature`]
pub fn decode_signature(bytes: &[u8]) -> KeyringResult<RawSignature> {
    if bytes.len() < MIN_SIGNATURE_LEN || bytes.len() > MAX_SIGNATURE_LEN {
        return Err(KeyringError::Encoding(format!(
            "signature of {} bytes",
            bytes.len()
        )));
    }
    if bytes[0] != TAG_SEQUENCE || bytes[1] as usize != bytes.len() - 2 {
        return Err(KeyringError::Encoding("bad SEQUENCE header".to_string()));
    }

    let (r, rest) = read_integer(&bytes[2..], "R")?;
    let (s, rest) = read_integer(rest, "S")?;
    if !rest.is_empty() {
        return Err(KeyringError::Encoding("trailing bytes".to_string()));
    }

    Ok(RawSignature { r, s })
}
