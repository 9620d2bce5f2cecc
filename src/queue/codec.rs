use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors raised while turning messages into wire bodies and back
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("failed to deserialize message: {0}")]
    Deserialize(#[source] serde_json::Error),

    #[error("failed to compress message: {0}")]
    Compress(#[source] std::io::Error),

    #[error("failed to decompress message: {0}")]
    Decompress(#[source] std::io::Error),

    #[error("decompressed message exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Largest decompressed body accepted unless a channel sets its own limit
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Serialize a message to JSON and zlib-compress it
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, CodecError> {
    let json = serde_json::to_vec(message).map_err(CodecError::Serialize)?;

    let mut encoder = ZlibEncoder::new(Vec::with_capacity(json.len() / 2), Compression::default());
    encoder.write_all(&json).map_err(CodecError::Compress)?;

    encoder.finish().map_err(CodecError::Compress)
}

/// Decompress a wire body of at most `max_len` bytes and deserialize the JSON inside
pub fn decode<T: DeserializeOwned>(body: &[u8], max_len: usize) -> Result<T, CodecError> {
    let mut json = Vec::new();
    ZlibDecoder::new(body)
        .take(max_len as u64 + 1)
        .read_to_end(&mut json)
        .map_err(CodecError::Decompress)?;

    if json.len() > max_len {
        return Err(CodecError::TooLarge { limit: max_len });
    }

    serde_json::from_slice(&json).map_err(CodecError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Entry {
        rank: u64,
        site: String,
    }

    #[test]
    fn test_encoded_body_is_compressed_json() {
        let entry = Entry { rank: 7, site: "example.com".to_string() };
        let body = encode(&entry).unwrap();

        // zlib header, not plain JSON
        assert_eq!(body[0], 0x78);

        let decoded: Entry = decode(&body, DEFAULT_MAX_MESSAGE_BYTES).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_plain_json_is_rejected() {
        let err = decode::<Entry>(br#"{"rank":1,"site":"a.com"}"#, DEFAULT_MAX_MESSAGE_BYTES).unwrap_err();
        assert!(matches!(err, CodecError::Decompress(_)));
    }

    #[test]
    fn test_wrong_shape_is_rejected() {
        let body = encode(&serde_json::json!({ "rank": "first" })).unwrap();
        let err = decode::<Entry>(&body, DEFAULT_MAX_MESSAGE_BYTES).unwrap_err();
        assert!(matches!(err, CodecError::Deserialize(_)));
    }

    #[test]
    fn test_oversized_body_is_rejected_without_full_inflation() {
        // Highly compressible: a few KiB on the wire, 8 MiB once inflated
        let padding = "a".repeat(8 * 1024 * 1024);
        let body = encode(&Entry { rank: 1, site: padding }).unwrap();
        assert!(body.len() < 64 * 1024);

        let err = decode::<Entry>(&body, 1024).unwrap_err();
        assert!(matches!(err, CodecError::TooLarge { limit: 1024 }));
    }

    #[test]
    fn test_body_at_the_limit_is_accepted() {
        let entry = Entry { rank: 2, site: "b.com".to_string() };
        let exact = serde_json::to_vec(&entry).unwrap().len();

        let decoded: Entry = decode(&encode(&entry).unwrap(), exact).unwrap();
        assert_eq!(decoded, entry);
    }
}
