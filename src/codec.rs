//! Per-field serialization boundary for the durable tier: encode → encrypt
//! → base64, with a fixed-width nonce prefixed to the ciphertext.
//!
//! Adapted from the cache layer's codec module: the encode/decode contract
//! and version tagging come from there, generalized from a bincode/LZ4
//! pipeline to the byte-buffer-in, base64-out shape the durable-tier record
//! layout needs (§6 "Persisted layouts").

use base64::Engine;

use crate::error::{StorageKind, StoreError, StoreResult};

/// Width, in bytes, of the nonce prefixed to every ciphertext produced by
/// a [`Codec`]. Deserialization MUST reject shorter buffers.
pub const NONCE_LEN: usize = 12;

/// Encodes/decodes a single opaque field for durable storage.
///
/// Implementations own the encrypt/decrypt step; [`Codec::encode`] is
/// responsible for prefixing a fresh nonce and [`Codec::decode`] for
/// stripping and validating it.
pub trait Codec: Send + Sync {
    /// Encode `plaintext`, returning a base64 string whose decoded bytes
    /// are `nonce (12 bytes) || ciphertext`.
    fn encode(&self, plaintext: &[u8]) -> StoreResult<String>;

    /// Decode a base64 string produced by [`Codec::encode`] back to the
    /// original plaintext. Fails with a storage error if the decoded
    /// buffer is shorter than [`NONCE_LEN`].
    fn decode(&self, encoded: &str) -> StoreResult<Vec<u8>>;
}

fn split_nonce(raw: &[u8]) -> StoreResult<(&[u8], &[u8])> {
    if raw.len() < NONCE_LEN {
        return Err(StoreError::storage(
            StorageKind::Durable,
            format!(
                "buffer too small for nonce: got {} bytes, need at least {NONCE_LEN}",
                raw.len()
            ),
        ));
    }
    Ok(raw.split_at(NONCE_LEN))
}

/// No-op codec: prefixes a zero nonce and passes bytes through unchanged.
/// Used when `security.enable_encryption` is `false`.
pub struct NullCodec;

impl Codec for NullCodec {
    fn encode(&self, plaintext: &[u8]) -> StoreResult<String> {
        let mut buf = vec![0u8; NONCE_LEN];
        buf.extend_from_slice(plaintext);
        Ok(base64::engine::general_purpose::STANDARD.encode(buf))
    }

    fn decode(&self, encoded: &str) -> StoreResult<Vec<u8>> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::storage(StorageKind::Durable, e))?;
        let (_nonce, ciphertext) = split_nonce(&raw)?;
        Ok(ciphertext.to_vec())
    }
}

/// XOR-with-nonce-derived-keystream codec. Not cryptographically sound;
/// exists as a fast, dependency-free stand-in for the AEAD algorithms
/// named in [`crate::config::EncryptionAlgorithm`] so tests can exercise
/// the nonce-prefix contract without pulling in a real cipher.
pub struct XorCodec {
    key: Vec<u8>,
}

impl XorCodec {
    /// Build a codec keyed by `key` (any non-empty byte string).
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn keystream(&self, nonce: &[u8], len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| {
                let nonce_byte = nonce[i % nonce.len()];
                let key_byte = self.key[i % self.key.len()];
                nonce_byte ^ key_byte
            })
            .collect()
    }
}

impl Codec for XorCodec {
    fn encode(&self, plaintext: &[u8]) -> StoreResult<String> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut nonce);
        let stream = self.keystream(&nonce, plaintext.len());
        let ciphertext: Vec<u8> = plaintext
            .iter()
            .zip(stream.iter())
            .map(|(p, s)| p ^ s)
            .collect();
        let mut buf = nonce.to_vec();
        buf.extend_from_slice(&ciphertext);
        Ok(base64::engine::general_purpose::STANDARD.encode(buf))
    }

    fn decode(&self, encoded: &str) -> StoreResult<Vec<u8>> {
        let raw = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| StoreError::storage(StorageKind::Durable, e))?;
        let (nonce, ciphertext) = split_nonce(&raw)?;
        let stream = self.keystream(nonce, ciphertext.len());
        Ok(ciphertext
            .iter()
            .zip(stream.iter())
            .map(|(c, s)| c ^ s)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_codec_round_trips() {
        let codec = NullCodec;
        let encoded = codec.encode(b"hello world").unwrap();
        let decoded = codec.decode(&encoded).unwrap();
        assert_eq!(decoded, b"hello world");
    }

    #[test]
    fn xor_codec_round_trips_with_distinct_nonces() {
        let codec = XorCodec::new("secret-key");
        let encoded_a = codec.encode(b"payload").unwrap();
        let encoded_b = codec.encode(b"payload").unwrap();
        assert_ne!(encoded_a, encoded_b, "nonce must vary per call");
        assert_eq!(codec.decode(&encoded_a).unwrap(), b"payload");
        assert_eq!(codec.decode(&encoded_b).unwrap(), b"payload");
    }

    #[test]
    fn decode_rejects_buffer_shorter_than_nonce() {
        let codec = NullCodec;
        let short = base64::engine::general_purpose::STANDARD.encode([0u8; 4]);
        let err = codec.decode(&short).unwrap_err();
        assert!(matches!(err, StoreError::Storage { .. }));
    }
}
