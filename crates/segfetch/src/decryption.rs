//! Segment decryption.
//!
//! AES-128 segments are CBC encrypted with PKCS7 padding. [`SegmentCipher`]
//! decrypts them chunk by chunk; only the final block is held back until
//! [`SegmentCipher::finish`] so padding can be checked.

use aes::Aes128;
use bytes::Bytes;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecryptMut, KeyIvInit, block_padding::Pkcs7};
use media_types::{EncryptionKey, KeyMethod};
use tracing::trace;

use crate::error::DownloadError;
use crate::fetcher::KeyFetcher;

type Aes128CbcDec = cbc::Decryptor<Aes128>;

const BLOCK_SIZE: usize = 16;

pub enum SegmentCipher {
    PassThrough,
    Aes128(Box<Aes128Stream>),
}

pub struct Aes128Stream {
    decryptor: Aes128CbcDec,
    pending: Vec<u8>,
}

impl std::fmt::Debug for SegmentCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PassThrough => f.write_str("PassThrough"),
            Self::Aes128(_) => f.write_str("Aes128"),
        }
    }
}

impl SegmentCipher {
    pub fn aes128(key: &[u8], iv: &[u8; 16]) -> Result<Self, DownloadError> {
        let decryptor = Aes128CbcDec::new_from_slices(key, iv).map_err(|e| {
            DownloadError::decryption(format!("failed to initialize AES decryptor: {e}"))
        })?;
        Ok(Self::Aes128(Box::new(Aes128Stream {
            decryptor,
            pending: Vec::with_capacity(BLOCK_SIZE * 2),
        })))
    }

    pub fn is_pass_through(&self) -> bool {
        matches!(self, Self::PassThrough)
    }

    /// Feed the next ciphertext chunk and return whatever plaintext is ready.
    pub fn update(&mut self, chunk: Bytes) -> Result<Bytes, DownloadError> {
        let stream = match self {
            Self::PassThrough => return Ok(chunk),
            Self::Aes128(stream) => stream,
        };

        stream.pending.extend_from_slice(&chunk);
        // Keep the last complete block: it carries the padding.
        let ready = match stream.pending.len() % BLOCK_SIZE {
            0 => stream.pending.len().saturating_sub(BLOCK_SIZE),
            partial => stream.pending.len() - partial,
        };
        if ready == 0 {
            return Ok(Bytes::new());
        }

        let rest = stream.pending.split_off(ready);
        let mut out = std::mem::replace(&mut stream.pending, rest);
        for block in out.chunks_exact_mut(BLOCK_SIZE) {
            stream
                .decryptor
                .decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        Ok(Bytes::from(out))
    }

    /// Decrypt the held-back block and strip the padding.
    pub fn finish(self) -> Result<Bytes, DownloadError> {
        let stream = match self {
            Self::PassThrough => return Ok(Bytes::new()),
            Self::Aes128(stream) => *stream,
        };

        let Aes128Stream {
            decryptor,
            mut pending,
        } = stream;
        if pending.len() != BLOCK_SIZE {
            return Err(DownloadError::decryption(format!(
                "ciphertext length is not a multiple of {BLOCK_SIZE} bytes ({} trailing)",
                pending.len() % BLOCK_SIZE
            )));
        }

        let len = decryptor
            .decrypt_padded_mut::<Pkcs7>(&mut pending)
            .map_err(|e| DownloadError::decryption(format!("invalid padding: {e}")))?
            .len();
        pending.truncate(len);
        Ok(Bytes::from(pending))
    }

    /// Decrypt a complete segment held in memory.
    pub fn decrypt_all(mut self, data: Bytes) -> Result<Bytes, DownloadError> {
        let head = self.update(data)?;
        let tail = self.finish()?;
        if tail.is_empty() {
            return Ok(head);
        }
        let mut out = Vec::with_capacity(head.len() + tail.len());
        out.extend_from_slice(&head);
        out.extend_from_slice(&tail);
        Ok(Bytes::from(out))
    }
}

/// Parse a hex IV. An optional `0x` prefix is stripped and short values are
/// left-padded with zeros.
pub fn parse_iv(raw: &str) -> Result<[u8; 16], DownloadError> {
    let digits = raw
        .trim()
        .strip_prefix("0x")
        .or_else(|| raw.trim().strip_prefix("0X"))
        .unwrap_or(raw.trim());
    if digits.len() > BLOCK_SIZE * 2 {
        return Err(DownloadError::decryption(format!(
            "IV '{raw}' is longer than 128 bits"
        )));
    }

    let padded = format!("{digits:0>32}");
    let mut iv = [0u8; 16];
    hex::decode_to_slice(&padded, &mut iv)
        .map_err(|e| DownloadError::decryption(format!("failed to parse IV '{raw}': {e}")))?;
    Ok(iv)
}

/// Build the cipher for a segment's key. Keys are looked up through `keys`,
/// which is expected to cache them.
pub async fn cipher_for(
    key: Option<&EncryptionKey>,
    keys: &dyn KeyFetcher,
) -> Result<SegmentCipher, DownloadError> {
    let Some(key) = key else {
        return Ok(SegmentCipher::PassThrough);
    };

    match &key.method {
        KeyMethod::None => Ok(SegmentCipher::PassThrough),
        KeyMethod::Aes128 => {
            let uri = key
                .uri
                .as_deref()
                .ok_or_else(|| DownloadError::decryption("AES-128 key has no URI"))?;
            let iv = key
                .iv
                .as_deref()
                .ok_or_else(|| DownloadError::decryption("AES-128 key has no IV"))?;
            let iv = parse_iv(iv)?;
            let raw_key = keys.fetch_key(uri).await?;
            trace!(uri, "Using AES-128 key");
            SegmentCipher::aes128(&raw_key, &iv)
        }
        other => Err(DownloadError::decryption(format!(
            "unsupported encryption method {other}"
        ))),
    }
}
