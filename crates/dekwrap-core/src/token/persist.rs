//! Encrypted at-rest image of a soft token.
//!
//! Layout: a fixed 128-byte header followed by the XChaCha20-Poly1305
//! ciphertext of a JSON [`TokenImage`]. The key is derived from the user PIN,
//! so the image can only be read once the user logs in.

use crate::crypto::{self, KdfParams, NONCE_LEN, SALT_LEN};
use crate::token::{KeyType, ObjectClass, SlotId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroizing;

pub const TOKEN_MAGIC: &[u8] = b"DEKTOK1\0";
pub const TOKEN_FORMAT_VERSION: u32 = 1;
pub const HEADER_SIZE: usize = 128;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("token file already exists: {}", .0.display())]
    Exists(PathBuf),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("token file format: {0}")]
    Format(String),
    #[error("token key derivation: {0}")]
    Kdf(String),
    #[error("token image could not be decrypted")]
    Decrypt,
    #[error("token image encryption: {0}")]
    Encrypt(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    pub format_version: u32,
    pub slot: SlotId,
    pub kdf: KdfParams,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN],
}

impl TokenHeader {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_SIZE];
        buf[..TOKEN_MAGIC.len()].copy_from_slice(TOKEN_MAGIC);
        buf[8..12].copy_from_slice(&self.format_version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.kdf.time_cost.to_le_bytes());
        buf[16..20].copy_from_slice(&self.kdf.memory_cost.to_le_bytes());
        buf[20..24].copy_from_slice(&self.kdf.parallelism.to_le_bytes());
        buf[24..32].copy_from_slice(&self.slot.0.to_le_bytes());
        buf[32..64].copy_from_slice(&self.salt);
        buf[64..88].copy_from_slice(&self.nonce);
        // remaining bytes stay zero
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, PersistError> {
        if buf.len() != HEADER_SIZE {
            return Err(PersistError::Format("invalid header size".into()));
        }
        if &buf[..TOKEN_MAGIC.len()] != TOKEN_MAGIC {
            return Err(PersistError::Format("invalid magic".into()));
        }
        let format_version = le_u32(buf, 8);
        if format_version != TOKEN_FORMAT_VERSION {
            return Err(PersistError::Format(format!(
                "unsupported format version {format_version}"
            )));
        }
        let mut slot = [0u8; 8];
        slot.copy_from_slice(&buf[24..32]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&buf[32..64]);
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&buf[64..88]);
        Ok(Self {
            format_version,
            slot: SlotId(u64::from_le_bytes(slot)),
            kdf: KdfParams {
                time_cost: le_u32(buf, 12),
                memory_cost: le_u32(buf, 16),
                parallelism: le_u32(buf, 20),
            },
            salt,
            nonce,
        })
    }
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredObject {
    pub handle: u64,
    pub class: ObjectClass,
    #[serde(with = "b64")]
    pub label: Vec<u8>,
    #[serde(with = "b64")]
    pub value: Vec<u8>,
    pub private: bool,
    #[serde(default)]
    pub key_type: Option<KeyType>,
    pub encrypt: bool,
    pub decrypt: bool,
    pub sensitive: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenImage {
    pub slot: SlotId,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    pub next_object: u64,
    #[serde(default)]
    pub objects: Vec<StoredObject>,
}

impl TokenImage {
    pub fn empty(slot: SlotId) -> Self {
        Self {
            slot,
            created_at: Utc::now(),
            last_modified: Utc::now(),
            next_object: 1,
            objects: vec![],
        }
    }
}

#[derive(Debug)]
pub struct TokenFile {
    path: PathBuf,
    header: TokenHeader,
    ciphertext: Vec<u8>,
}

impl TokenFile {
    /// Writes a new token file and returns it with the derived image key.
    pub fn create<P: AsRef<Path>>(
        path: P,
        slot: SlotId,
        pin: &[u8],
        kdf: KdfParams,
    ) -> Result<(Self, Zeroizing<Vec<u8>>), PersistError> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(PersistError::Exists(path));
        }
        let header = TokenHeader {
            format_version: TOKEN_FORMAT_VERSION,
            slot,
            kdf,
            salt: crypto::generate_salt(),
            nonce: crypto::generate_nonce(),
        };
        let key = crypto::derive_key(pin, &header.salt, kdf).map_err(PersistError::Kdf)?;
        let mut file = Self {
            path,
            header,
            ciphertext: vec![],
        };
        file.save(&key, &TokenImage::empty(slot))?;
        Ok((file, key))
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let mut file = File::open(path.as_ref())?;
        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = TokenHeader::from_bytes(&header_buf)?;
        let mut ciphertext = Vec::new();
        file.read_to_end(&mut ciphertext)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
            header,
            ciphertext,
        })
    }

    pub fn slot(&self) -> SlotId {
        self.header.slot
    }

    /// Derives the image key from `pin` and decrypts the image.
    pub fn unlock(&self, pin: &[u8]) -> Result<(TokenImage, Zeroizing<Vec<u8>>), PersistError> {
        let key = crypto::derive_key(pin, &self.header.salt, self.header.kdf)
            .map_err(PersistError::Kdf)?;
        let plaintext =
            crypto::open(&key, &self.header.nonce, &self.ciphertext).ok_or(PersistError::Decrypt)?;
        let image: TokenImage = serde_json::from_slice(&plaintext)?;
        Ok((image, key))
    }

    pub fn save(&mut self, key: &[u8], image: &TokenImage) -> Result<(), PersistError> {
        let plaintext = Zeroizing::new(serde_json::to_vec(image)?);
        // Fresh nonce for every save; the key stays the same for the file's lifetime.
        self.header.nonce = crypto::generate_nonce();
        self.ciphertext =
            crypto::seal(key, &self.header.nonce, &plaintext).map_err(PersistError::Encrypt)?;

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&self.header.to_bytes())?;
            file.write_all(&self.ciphertext)?;
            file.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

mod b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn light() -> KdfParams {
        KdfParams::with_memory_cost(64)
    }

    #[test]
    fn header_roundtrip() {
        let header = TokenHeader {
            format_version: TOKEN_FORMAT_VERSION,
            slot: SlotId(7),
            kdf: light(),
            salt: [3u8; SALT_LEN],
            nonce: [9u8; NONCE_LEN],
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(TokenHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[..8].copy_from_slice(b"NOTATOKN");
        assert!(matches!(
            TokenHeader::from_bytes(&bytes),
            Err(PersistError::Format(_))
        ));
    }

    #[test]
    fn create_save_and_unlock() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.dat");
        let (mut file, key) = TokenFile::create(&path, SlotId(0), b"1234", light()).unwrap();

        let mut image = TokenImage::empty(SlotId(0));
        image.objects.push(StoredObject {
            handle: 1,
            class: ObjectClass::Data,
            label: b"DEK-A".to_vec(),
            value: vec![1, 2, 3],
            private: true,
            key_type: None,
            encrypt: false,
            decrypt: false,
            sensitive: false,
        });
        image.next_object = 2;
        file.save(&key, &image).unwrap();

        let reopened = TokenFile::open(&path).unwrap();
        assert_eq!(reopened.slot(), SlotId(0));
        let (loaded, _) = reopened.unlock(b"1234").unwrap();
        assert_eq!(loaded.objects.len(), 1);
        assert_eq!(loaded.objects[0].value, vec![1, 2, 3]);
        assert!(matches!(reopened.unlock(b"0000"), Err(PersistError::Decrypt)));
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("token.dat");
        TokenFile::create(&path, SlotId(0), b"1234", light()).unwrap();
        assert!(matches!(
            TokenFile::create(&path, SlotId(0), b"1234", light()),
            Err(PersistError::Exists(_))
        ));
    }
}
