//! Password-based payload encryption.
//!
//! The key is derived with Argon2id from the password and a random salt.
//! The payload is then sealed with ChaCha20-Poly1305 in fixed-size chunks,
//! each framed as a big-endian `u32` length followed by the ciphertext:
//!
//! ```text
//! magic (8) | header length (u32 BE) | header JSON | frame*
//! ```
//!
//! The header records everything needed to decrypt: KDF parameters, salt,
//! base nonce and chunk size. Each chunk's associated data binds the
//! backup metadata, the exact header bytes, the chunk index and whether it
//! is the final chunk, so reordering, truncation, appended data or a swapped
//! metadata block all fail authentication.

use crate::error::{BackupError, DecryptFailure, Result};
use crate::security::{DerivedKey, SecureString, KEY_LEN};
use crate::serializer::base64_bytes;
use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{self, BufRead, BufReader, Read, Write};
use strongbox_core::config::MAX_CHUNK_SIZE;
use strongbox_core::KdfSettings;
use zeroize::Zeroizing;

/// Leading bytes of every encrypted payload
const ENVELOPE_MAGIC: &[u8; 8] = b"SBXPAYLD";

/// Envelope layout version
pub const ENVELOPE_VERSION: u32 = 1;

pub const SALT_LEN: usize = 16;
pub const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const CIPHER_NAME: &str = "chacha20poly1305";
const KDF_NAME: &str = "argon2id";

const MAX_HEADER_BYTES: usize = 16 * 1024;

/// Upper bounds on KDF costs accepted from a backup file
pub use strongbox_core::config::{MAX_KDF_ITERATIONS, MAX_KDF_MEMORY_KIB, MAX_KDF_PARALLELISM};

/// Argon2id parameters stored in the envelope header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KdfParams {
    pub algorithm: String,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl From<&KdfSettings> for KdfParams {
    fn from(settings: &KdfSettings) -> Self {
        Self {
            algorithm: KDF_NAME.to_string(),
            memory_kib: settings.memory_kib,
            iterations: settings.iterations,
            parallelism: settings.parallelism,
        }
    }
}

impl KdfParams {
    fn within_bounds(&self) -> bool {
        self.memory_kib <= MAX_KDF_MEMORY_KIB
            && (1..=MAX_KDF_ITERATIONS).contains(&self.iterations)
            && (1..=MAX_KDF_PARALLELISM).contains(&self.parallelism)
    }
}

/// Everything needed to derive the key and decrypt the payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeHeader {
    pub version: u32,
    pub cipher: String,
    pub kdf: KdfParams,
    #[serde(with = "base64_bytes")]
    pub salt: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub nonce: Vec<u8>,
    pub chunk_size: u32,
}

/// A header together with the exact bytes it was read from
#[derive(Debug, Clone)]
pub struct SealedHeader {
    pub header: EnvelopeHeader,
    raw: Vec<u8>,
}

impl SealedHeader {
    fn seal(header: EnvelopeHeader) -> Result<Self> {
        let raw = serde_json::to_vec(&header)
            .map_err(|e| BackupError::serialization("envelope header", e))?;
        Ok(Self { header, raw })
    }
}

/// Seals and opens backup payloads
#[derive(Debug, Clone)]
pub struct EncryptionHandler {
    kdf: KdfSettings,
    chunk_size: usize,
}

impl EncryptionHandler {
    pub fn new(kdf: KdfSettings, chunk_size: usize) -> Self {
        Self {
            kdf,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
        }
    }

    /// A fresh header with a random salt and base nonce
    pub fn new_header(&self) -> Result<SealedHeader> {
        let mut salt = vec![0u8; SALT_LEN];
        let mut nonce = vec![0u8; NONCE_LEN];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut nonce);

        SealedHeader::seal(EnvelopeHeader {
            version: ENVELOPE_VERSION,
            cipher: CIPHER_NAME.to_string(),
            kdf: KdfParams::from(&self.kdf),
            salt,
            nonce,
            chunk_size: self.chunk_size as u32,
        })
    }

    /// Derive the payload key. CPU and memory heavy; run off the async executor.
    ///
    /// Parameters outside the accepted bounds are refused before any work
    /// is done, so a crafted header cannot exhaust memory.
    pub fn derive_key(password: &SecureString, sealed: &SealedHeader) -> Result<DerivedKey> {
        let header = &sealed.header;
        check_header_shape(header)?;
        if !header.kdf.within_bounds() {
            return Err(BackupError::decrypt(DecryptFailure::UnsafeKdfParameters));
        }

        let params = Params::new(
            header.kdf.memory_kib,
            header.kdf.iterations,
            header.kdf.parallelism,
            Some(KEY_LEN),
        )
        .map_err(|_| BackupError::decrypt(DecryptFailure::UnsafeKdfParameters))?;

        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
            .hash_password_into(password.expose_bytes(), &header.salt, &mut key[..])
            .map_err(|_| BackupError::decrypt(DecryptFailure::MalformedEnvelope))?;

        Ok(DerivedKey::from_bytes(key))
    }

    /// Read the envelope header from the start of a payload
    pub fn read_header<R: Read>(input: &mut R) -> Result<SealedHeader> {
        let malformed = |_| BackupError::decrypt(DecryptFailure::MalformedEnvelope);

        let mut magic = [0u8; 8];
        input.read_exact(&mut magic).map_err(malformed)?;
        if &magic != ENVELOPE_MAGIC {
            return Err(BackupError::decrypt(DecryptFailure::MalformedEnvelope));
        }

        let mut len = [0u8; 4];
        input.read_exact(&mut len).map_err(malformed)?;
        let len = u32::from_be_bytes(len) as usize;
        if len == 0 || len > MAX_HEADER_BYTES {
            return Err(BackupError::decrypt(DecryptFailure::MalformedEnvelope));
        }

        let mut raw = vec![0u8; len];
        input.read_exact(&mut raw).map_err(malformed)?;
        let header: EnvelopeHeader = serde_json::from_slice(&raw)
            .map_err(|_| BackupError::decrypt(DecryptFailure::MalformedEnvelope))?;
        check_header_shape(&header)?;

        Ok(SealedHeader { header, raw })
    }

    /// Encrypt `input` into `output`, returning the plaintext length.
    ///
    /// `context` is authenticated with every chunk but not stored.
    pub fn encrypt<R: Read, W: Write>(
        key: &DerivedKey,
        sealed: &SealedHeader,
        context: &[u8],
        mut input: R,
        mut output: W,
    ) -> Result<u64> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let base_nonce = base_nonce(&sealed.header)?;
        let binding = binding_digest(context, &sealed.raw);
        let chunk_size = sealed.header.chunk_size as usize;

        output.write_all(ENVELOPE_MAGIC)?;
        output.write_all(&(sealed.raw.len() as u32).to_be_bytes())?;
        output.write_all(&sealed.raw)?;

        let mut current = Zeroizing::new(vec![0u8; chunk_size]);
        let mut next = Zeroizing::new(vec![0u8; chunk_size]);
        let mut current_len = read_full(&mut input, &mut current)?;
        let mut index = 0u64;
        let mut total = 0u64;

        loop {
            let next_len = if current_len == chunk_size {
                read_full(&mut input, &mut next)?
            } else {
                0
            };
            let is_final = next_len == 0;

            let aad = chunk_aad(&binding, index, is_final);
            let ciphertext = cipher
                .encrypt(
                    &chunk_nonce(&base_nonce, index),
                    Payload {
                        msg: &current[..current_len],
                        aad: &aad,
                    },
                )
                .map_err(|_| io::Error::other("payload encryption failed"))?;

            output.write_all(&(ciphertext.len() as u32).to_be_bytes())?;
            output.write_all(&ciphertext)?;
            total += current_len as u64;

            if is_final {
                break;
            }
            std::mem::swap(&mut current, &mut next);
            current_len = next_len;
            index += 1;
        }

        output.flush()?;
        tracing::debug!("Encrypted {} bytes in {} chunks", total, index + 1);
        Ok(total)
    }

    /// Decrypt the frames following a header read by [`read_header`](Self::read_header).
    ///
    /// Plaintext is written chunk by chunk as each one authenticates; on error
    /// the caller must discard whatever reached `output`.
    pub fn decrypt<R: Read, W: Write>(
        key: &DerivedKey,
        sealed: &SealedHeader,
        context: &[u8],
        input: R,
        mut output: W,
    ) -> Result<u64> {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()));
        let base_nonce = base_nonce(&sealed.header)?;
        let binding = binding_digest(context, &sealed.raw);
        let max_frame = sealed.header.chunk_size as usize + TAG_LEN;

        let mut input = BufReader::new(input);
        let mut index = 0u64;
        let mut total = 0u64;

        loop {
            let len = match read_frame_len(&mut input)? {
                Some(len) => len,
                None => return Err(BackupError::decrypt(DecryptFailure::Truncated)),
            };
            if !(TAG_LEN..=max_frame).contains(&len) {
                return Err(BackupError::decrypt(DecryptFailure::MalformedEnvelope));
            }

            let mut frame = vec![0u8; len];
            input.read_exact(&mut frame).map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => BackupError::decrypt(DecryptFailure::Truncated),
                _ => BackupError::Io(e),
            })?;

            let at_end = input.fill_buf()?.is_empty();
            let nonce = chunk_nonce(&base_nonce, index);
            let plaintext = open_chunk(&cipher, &nonce, &frame, &binding, index, at_end)
                .ok_or_else(|| {
                    // Work out why, for the logs only
                    let diagnostic = if open_chunk(&cipher, &nonce, &frame, &binding, index, !at_end)
                        .is_some()
                    {
                        if at_end {
                            DecryptFailure::Truncated
                        } else {
                            DecryptFailure::TrailingData
                        }
                    } else if index == 0 {
                        DecryptFailure::FirstChunkRejected
                    } else {
                        DecryptFailure::ChunkRejected { index }
                    };
                    BackupError::decrypt(diagnostic)
                })?;

            output.write_all(&plaintext)?;
            total += plaintext.len() as u64;

            if at_end {
                break;
            }
            index += 1;
        }

        output.flush()?;
        Ok(total)
    }
}

fn check_header_shape(header: &EnvelopeHeader) -> Result<()> {
    let ok = header.version == ENVELOPE_VERSION
        && header.cipher == CIPHER_NAME
        && header.kdf.algorithm == KDF_NAME
        && header.salt.len() == SALT_LEN
        && header.nonce.len() == NONCE_LEN
        && header.chunk_size > 0
        && header.chunk_size as usize <= MAX_CHUNK_SIZE;
    if ok {
        Ok(())
    } else {
        Err(BackupError::decrypt(DecryptFailure::MalformedEnvelope))
    }
}

fn base_nonce(header: &EnvelopeHeader) -> Result<[u8; NONCE_LEN]> {
    header
        .nonce
        .as_slice()
        .try_into()
        .map_err(|_| BackupError::decrypt(DecryptFailure::MalformedEnvelope))
}

/// Digest of the context and header bytes, length-prefixed so the two
/// cannot be re-split
fn binding_digest(context: &[u8], header_raw: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update((context.len() as u64).to_be_bytes());
    hasher.update(context);
    hasher.update(header_raw);
    hasher.finalize().into()
}

fn chunk_aad(binding: &[u8; 32], index: u64, is_final: bool) -> [u8; 41] {
    let mut aad = [0u8; 41];
    aad[..32].copy_from_slice(binding);
    aad[32..40].copy_from_slice(&index.to_be_bytes());
    aad[40] = is_final as u8;
    aad
}

/// Base nonce with its last 8 bytes XORed with the chunk index
fn chunk_nonce(base: &[u8; NONCE_LEN], index: u64) -> Nonce {
    let mut nonce = *base;
    for (byte, i) in nonce[NONCE_LEN - 8..].iter_mut().zip(index.to_be_bytes()) {
        *byte ^= i;
    }
    *Nonce::from_slice(&nonce)
}

fn open_chunk(
    cipher: &ChaCha20Poly1305,
    nonce: &Nonce,
    frame: &[u8],
    binding: &[u8; 32],
    index: u64,
    is_final: bool,
) -> Option<Zeroizing<Vec<u8>>> {
    let aad = chunk_aad(binding, index, is_final);
    cipher
        .decrypt(nonce, Payload { msg: frame, aad: &aad })
        .ok()
        .map(Zeroizing::new)
}

/// Fill `buf` unless the reader ends first; returns the bytes read
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// `None` at a clean end of stream
fn read_frame_len<R: Read>(reader: &mut R) -> Result<Option<usize>> {
    let mut len = [0u8; 4];
    match read_full(reader, &mut len)? {
        0 => Ok(None),
        4 => Ok(Some(u32::from_be_bytes(len) as usize)),
        _ => Err(BackupError::decrypt(DecryptFailure::Truncated)),
    }
}
