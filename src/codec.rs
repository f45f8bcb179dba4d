//! Wire codec for hash payloads
//!
//! Payloads travel either as raw bytes or as hex text, selected by media type.
//! Batches are framed as follows:
//!
//! ```text
//! hex:    <hex> ' ' <hex> ' ' ... <hex> [' ']
//! binary: <len u8> <len bytes> <len u8> <len bytes> ...
//! ```
//!
//! Binary entry lengths are limited to 127 bytes (the high bit must be clear).

use thiserror::Error;

/// Single payload, raw bytes
pub const BINARY_FORMAT: &str = "application/x.uhash+bin";

/// Single payload, hex text
pub const HEX_FORMAT: &str = "application/x.uhash+hex";

/// Batch of payloads, length-prefixed raw bytes
pub const BINARY_FORMAT_BATCH: &str = "application/x.uhash.batch+bin";

/// Batch of payloads, space-separated hex text
pub const HEX_FORMAT_BATCH: &str = "application/x.uhash.batch+hex";

/// Largest accepted seed in bytes
pub const MAX_SEED_SIZE: usize = 60;

/// Largest accepted number of batch entries
pub const MAX_BATCH_SIZE: usize = 256;

/// Largest binary batch entry in bytes
pub const MAX_BATCH_ENTRY: usize = 127;

/// Hash output size
pub const HASH_SIZE: usize = 32;

/// A computed hash
pub type Hash = [u8; HASH_SIZE];

const BATCH_SEPARATOR: u8 = b' ';

/// Errors produced while decoding a request body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("missing content type")]
    MissingContentType,

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("malformed hex payload")]
    MalformedHex,

    #[error("batch entry length {0} exceeds the 127 byte limit")]
    InvalidEntryLength(u8),

    #[error("batch entry truncated: {needed} bytes declared, {available} available")]
    TruncatedEntry { needed: usize, available: usize },

    #[error("batch is empty")]
    EmptyBatch,

    #[error("batch has {0} entries, limit is 256")]
    BatchTooLarge(usize),
}

/// Whether a body carries one payload or a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Single,
    Batch,
}

/// Byte representation on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Binary,
    Hex,
}

impl Encoding {
    /// Media type naming this encoding for the given framing
    pub fn media_type(self, framing: Framing) -> &'static str {
        match (self, framing) {
            (Encoding::Binary, Framing::Single) => BINARY_FORMAT,
            (Encoding::Hex, Framing::Single) => HEX_FORMAT,
            (Encoding::Binary, Framing::Batch) => BINARY_FORMAT_BATCH,
            (Encoding::Hex, Framing::Batch) => HEX_FORMAT_BATCH,
        }
    }

    /// Select the request encoding from a `Content-Type` value
    ///
    /// Parameters after `;` are ignored and the comparison is case-insensitive.
    pub fn from_content_type(
        content_type: Option<&str>,
        framing: Framing,
    ) -> Result<Self, CodecError> {
        let value = content_type.ok_or(CodecError::MissingContentType)?;
        let essence = media_essence(value);

        [Encoding::Hex, Encoding::Binary]
            .into_iter()
            .find(|encoding| essence.eq_ignore_ascii_case(encoding.media_type(framing)))
            .ok_or_else(|| CodecError::UnsupportedContentType(value.to_string()))
    }

    /// Select the response encoding from the `Accept` header values
    ///
    /// Binary is chosen only when the binary media type of the framing is
    /// listed; everything else falls back to hex.
    pub fn negotiate<'a, I>(accept: I, framing: Framing) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let binary = Encoding::Binary.media_type(framing);
        let wants_binary = accept
            .into_iter()
            .flat_map(|value| value.split(','))
            .any(|item| media_essence(item).eq_ignore_ascii_case(binary));

        if wants_binary {
            Encoding::Binary
        } else {
            Encoding::Hex
        }
    }
}

fn media_essence(value: &str) -> &str {
    value.split(';').next().unwrap_or_default().trim()
}

/// Decode a single payload
pub fn decode_single(encoding: Encoding, body: &[u8]) -> Result<Vec<u8>, CodecError> {
    match encoding {
        Encoding::Binary => Ok(body.to_vec()),
        Encoding::Hex => hex::decode(body).map_err(|_| CodecError::MalformedHex),
    }
}

/// Decode a batch of payloads
///
/// Framing errors are reported before the entry count is checked.
pub fn decode_batch(encoding: Encoding, body: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let entries = match encoding {
        Encoding::Binary => split_binary(body)?,
        Encoding::Hex => split_hex(body)?,
    };

    if entries.is_empty() {
        return Err(CodecError::EmptyBatch);
    }
    if entries.len() > MAX_BATCH_SIZE {
        return Err(CodecError::BatchTooLarge(entries.len()));
    }
    Ok(entries)
}

fn split_hex(body: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let mut entries = Vec::new();
    let mut rest = body;

    // End of input terminates the last entry
    while !rest.is_empty() {
        let end = rest
            .iter()
            .position(|&b| b == BATCH_SEPARATOR)
            .unwrap_or(rest.len());
        entries.push(hex::decode(&rest[..end]).map_err(|_| CodecError::MalformedHex)?);
        rest = rest.get(end + 1..).unwrap_or_default();
    }

    Ok(entries)
}

fn split_binary(body: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    let mut entries = Vec::new();
    let mut rest = body;

    while let Some((&len, tail)) = rest.split_first() {
        if usize::from(len) > MAX_BATCH_ENTRY {
            return Err(CodecError::InvalidEntryLength(len));
        }
        let len = usize::from(len);
        if tail.len() < len {
            return Err(CodecError::TruncatedEntry {
                needed: len,
                available: tail.len(),
            });
        }
        let (entry, next) = tail.split_at(len);
        entries.push(entry.to_vec());
        rest = next;
    }

    Ok(entries)
}

/// Encode a single hash
pub fn encode_single(encoding: Encoding, hash: &Hash) -> Vec<u8> {
    match encoding {
        Encoding::Binary => hash.to_vec(),
        Encoding::Hex => hex::encode(hash).into_bytes(),
    }
}

/// Encode a batch of hashes
///
/// Hex entries are each followed by a separator, binary entries are each
/// preceded by their length.
pub fn encode_batch(encoding: Encoding, hashes: &[Hash]) -> Vec<u8> {
    let mut out = match encoding {
        Encoding::Binary => Vec::with_capacity(hashes.len() * (HASH_SIZE + 1)),
        Encoding::Hex => Vec::with_capacity(hashes.len() * (HASH_SIZE * 2 + 1)),
    };

    for hash in hashes {
        match encoding {
            Encoding::Binary => {
                out.push(HASH_SIZE as u8);
                out.extend_from_slice(hash);
            }
            Encoding::Hex => {
                out.extend_from_slice(hex::encode(hash).as_bytes());
                out.push(BATCH_SEPARATOR);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_selection() {
        assert_eq!(
            Encoding::from_content_type(Some(HEX_FORMAT), Framing::Single),
            Ok(Encoding::Hex)
        );
        assert_eq!(
            Encoding::from_content_type(Some("Application/X.UHash+Bin; charset=x"), Framing::Single),
            Ok(Encoding::Binary)
        );
        assert_eq!(
            Encoding::from_content_type(Some(BINARY_FORMAT_BATCH), Framing::Batch),
            Ok(Encoding::Binary)
        );
    }

    #[test]
    fn test_content_type_rejections() {
        assert_eq!(
            Encoding::from_content_type(None, Framing::Single),
            Err(CodecError::MissingContentType)
        );
        assert!(matches!(
            Encoding::from_content_type(Some("application/json"), Framing::Single),
            Err(CodecError::UnsupportedContentType(_))
        ));
        // Batch media types are not valid for single payloads and vice versa
        assert!(matches!(
            Encoding::from_content_type(Some(HEX_FORMAT_BATCH), Framing::Single),
            Err(CodecError::UnsupportedContentType(_))
        ));
        assert!(matches!(
            Encoding::from_content_type(Some(BINARY_FORMAT), Framing::Batch),
            Err(CodecError::UnsupportedContentType(_))
        ));
    }

    #[test]
    fn test_accept_negotiation() {
        assert_eq!(Encoding::negotiate(std::iter::empty(), Framing::Single), Encoding::Hex);
        assert_eq!(
            Encoding::negotiate(["text/plain, application/x.uhash+bin;q=0.9"], Framing::Single),
            Encoding::Binary
        );
        assert_eq!(
            Encoding::negotiate(["text/plain", BINARY_FORMAT_BATCH], Framing::Batch),
            Encoding::Binary
        );
        // The single binary type does not select binary batch output
        assert_eq!(
            Encoding::negotiate([BINARY_FORMAT], Framing::Batch),
            Encoding::Hex
        );
    }

    #[test]
    fn test_decode_single() {
        assert_eq!(decode_single(Encoding::Hex, b"00ff10"), Ok(vec![0x00, 0xff, 0x10]));
        assert_eq!(decode_single(Encoding::Hex, b"ABcd"), Ok(vec![0xab, 0xcd]));
        assert_eq!(decode_single(Encoding::Hex, b""), Ok(vec![]));
        assert_eq!(decode_single(Encoding::Binary, b"\x00 raw"), Ok(b"\x00 raw".to_vec()));
    }

    #[test]
    fn test_decode_single_malformed_hex() {
        assert_eq!(decode_single(Encoding::Hex, b"abc"), Err(CodecError::MalformedHex));
        assert_eq!(decode_single(Encoding::Hex, b"zz"), Err(CodecError::MalformedHex));
        assert_eq!(decode_single(Encoding::Hex, b"ab cd"), Err(CodecError::MalformedHex));
    }

    #[test]
    fn test_hex_batch_separators() {
        let expected = vec![vec![0x01], vec![0x02, 0x03]];

        assert_eq!(decode_batch(Encoding::Hex, b"01 0203"), Ok(expected.clone()));
        assert_eq!(decode_batch(Encoding::Hex, b"01 0203 "), Ok(expected));

        // Adjacent separators yield an empty entry
        assert_eq!(
            decode_batch(Encoding::Hex, b"01  02"),
            Ok(vec![vec![0x01], vec![], vec![0x02]])
        );
    }

    #[test]
    fn test_hex_batch_malformed_entry() {
        assert_eq!(decode_batch(Encoding::Hex, b"01 0g"), Err(CodecError::MalformedHex));
        assert_eq!(decode_batch(Encoding::Hex, b"01 020"), Err(CodecError::MalformedHex));
    }

    #[test]
    fn test_binary_batch_framing() {
        let body = [2, 0xaa, 0xbb, 0, 1, 0xcc];
        assert_eq!(
            decode_batch(Encoding::Binary, &body),
            Ok(vec![vec![0xaa, 0xbb], vec![], vec![0xcc]])
        );

        let mut max_entry = vec![127u8];
        max_entry.extend(std::iter::repeat(7u8).take(127));
        assert_eq!(decode_batch(Encoding::Binary, &max_entry).map(|b| b[0].len()), Ok(127));
    }

    #[test]
    fn test_binary_batch_rejections() {
        assert_eq!(
            decode_batch(Encoding::Binary, &[0x80, 1, 2]),
            Err(CodecError::InvalidEntryLength(0x80))
        );
        assert_eq!(
            decode_batch(Encoding::Binary, &[3, 1, 2]),
            Err(CodecError::TruncatedEntry {
                needed: 3,
                available: 2
            })
        );
        assert_eq!(
            decode_batch(Encoding::Binary, &[1, 9, 4]),
            Err(CodecError::TruncatedEntry {
                needed: 4,
                available: 0
            })
        );
    }

    #[test]
    fn test_batch_size_limits() {
        assert_eq!(decode_batch(Encoding::Binary, b""), Err(CodecError::EmptyBatch));
        assert_eq!(decode_batch(Encoding::Hex, b""), Err(CodecError::EmptyBatch));

        let full = vec![0u8; MAX_BATCH_SIZE];
        assert_eq!(decode_batch(Encoding::Binary, &full).map(|b| b.len()), Ok(256));

        let over = vec![0u8; MAX_BATCH_SIZE + 1];
        assert_eq!(decode_batch(Encoding::Binary, &over), Err(CodecError::BatchTooLarge(257)));

        let hex_over = vec!["00"; MAX_BATCH_SIZE + 1].join(" ");
        assert_eq!(
            decode_batch(Encoding::Hex, hex_over.as_bytes()),
            Err(CodecError::BatchTooLarge(257))
        );
    }

    #[test]
    fn test_encode_single() {
        let mut hash = [0u8; HASH_SIZE];
        hash[0] = 0xab;
        hash[31] = 0x01;

        let hex = encode_single(Encoding::Hex, &hash);
        assert_eq!(hex.len(), 64);
        assert!(hex.starts_with(b"ab00"));
        assert!(hex.ends_with(b"01"));

        assert_eq!(encode_single(Encoding::Binary, &hash), hash.to_vec());
    }

    #[test]
    fn test_encode_batch_decodes_back() {
        let hashes = [[1u8; HASH_SIZE], [2u8; HASH_SIZE], [0xfeu8; HASH_SIZE]];

        for encoding in [Encoding::Hex, Encoding::Binary] {
            let body = encode_batch(encoding, &hashes);
            let decoded = decode_batch(encoding, &body).unwrap();
            assert_eq!(decoded.len(), hashes.len());
            for (entry, hash) in decoded.iter().zip(hashes.iter()) {
                assert_eq!(entry.as_slice(), hash.as_slice());
            }
        }

        let binary = encode_batch(Encoding::Binary, &hashes);
        assert_eq!(binary.len(), 3 * 33);
        assert_eq!(binary[0], 32);

        let hex = encode_batch(Encoding::Hex, &hashes);
        assert_eq!(hex.len(), 3 * 65);
        assert_eq!(hex.last(), Some(&b' '));
    }
}
