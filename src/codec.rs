// src/codec.rs
//! Byte-stream transforms applied between the host and the container.
//!
//! Each stream stored in a container is first compressed, then encrypted
//! (`decorate_to_vfs`). Reading applies the inverse in reverse order
//! (`decorate_to_host`). Compressing ciphertext gains nothing, hence the order.

use crate::error::{Result, VfsError};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce
};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use rand::{RngCore, thread_rng};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Encryption strategy persisted in the container header.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum EncryptionKind {
    None,
    #[default]
    #[value(name = "chacha20")]
    ChaCha20Poly1305,
    /// Illustrative XOR transform. Provides no confidentiality.
    #[value(name = "toy-xor")]
    ToyXor,
}

/// Compression strategy persisted in the container header.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CompressionKind {
    None,
    #[default]
    Zlib,
}

/// Key and IV derived from the user password. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub key: [u8; KEY_SIZE],
    pub iv: [u8; IV_SIZE],
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(..)")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Codec {
    None,
    SymmetricCipher { key: [u8; KEY_SIZE], iv: [u8; IV_SIZE] },
    Deflate,
    ToyXor { key: [u8; KEY_SIZE], iv: [u8; IV_SIZE] },
}

impl Codec {
    pub fn encryption(kind: EncryptionKind, keys: &KeyMaterial) -> Self {
        match kind {
            EncryptionKind::None => Codec::None,
            EncryptionKind::ChaCha20Poly1305 => Codec::SymmetricCipher { key: keys.key, iv: keys.iv },
            EncryptionKind::ToyXor => Codec::ToyXor { key: keys.key, iv: keys.iv },
        }
    }

    pub fn compression(kind: CompressionKind) -> Self {
        match kind {
            CompressionKind::None => Codec::None,
            CompressionKind::Zlib => Codec::Deflate,
        }
    }

    /// Transform host bytes into their stored form.
    pub fn decorate_to_vfs(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data),
            Codec::SymmetricCipher { key, iv } => {
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
                let mut nonce_bytes = [0u8; NONCE_SIZE];
                thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);

                let ciphertext = cipher.encrypt(nonce, Payload { msg: &data, aad: iv })
                .map_err(|_| VfsError::block("encryption failed"))?;

                let mut packet = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
                packet.extend_from_slice(&nonce_bytes);
                packet.extend_from_slice(&ciphertext);
                Ok(packet)
            }
            Codec::Deflate => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
                encoder.write_all(&data)?;
                Ok(encoder.finish()?)
            }
            Codec::ToyXor { key, iv } => Ok(toy_xor(data, key, iv)),
        }
    }

    /// Inverse of [`Codec::decorate_to_vfs`].
    pub fn decorate_to_host(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        match self {
            Codec::None => Ok(data),
            Codec::SymmetricCipher { key, iv } => {
                if data.len() < NONCE_SIZE + TAG_SIZE {
                    return Err(VfsError::format("ciphertext shorter than nonce and tag"));
                }
                let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
                let nonce = Nonce::from_slice(&data[0..NONCE_SIZE]);
                cipher.decrypt(nonce, Payload { msg: &data[NONCE_SIZE..], aad: iv })
                .map_err(|_| VfsError::format("auth tag mismatch"))
            }
            Codec::Deflate => {
                let mut decoder = ZlibDecoder::new(&data[..]);
                let mut out = Vec::new();
                decoder.read_to_end(&mut out)
                .map_err(|e| VfsError::format(format!("decompression failed: {}", e)))?;
                Ok(out)
            }
            Codec::ToyXor { key, iv } => Ok(toy_xor(data, key, iv)),
        }
    }
}

// out[i] = in[i] ^ key[i mod |key|] ^ iv[i mod |iv|] ^ i, its own inverse.
fn toy_xor(mut data: Vec<u8>, key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Vec<u8> {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % KEY_SIZE] ^ iv[i % IV_SIZE] ^ (i as u8);
    }
    data
}

/// Compression followed by encryption.
#[derive(Clone, Debug)]
pub struct Pipeline {
    compression: Codec,
    encryption: Codec,
}

impl Pipeline {
    pub fn new(compression: CompressionKind, encryption: EncryptionKind, keys: &KeyMaterial) -> Self {
        Pipeline {
            compression: Codec::compression(compression),
            encryption: Codec::encryption(encryption, keys),
        }
    }

    pub fn decorate_to_vfs(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let compressed = self.compression.decorate_to_vfs(data)?;
        self.encryption.decorate_to_vfs(compressed)
    }

    pub fn decorate_to_host(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let decrypted = self.encryption.decorate_to_host(data)?;
        self.compression.decorate_to_host(decrypted)
    }
}
