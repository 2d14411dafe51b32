//! In-process secure element with AES-CBC-PAD done in software.
//!
//! One slot, token-wide login state, rw sessions only. Objects are kept in
//! handle order so searches return matches in creation order. A token can be
//! purely in memory (pre-provisioned through the builder methods) or backed by
//! an encrypted token file that is unlocked at login.

use crate::crypto::KdfParams;
use crate::token::persist::{PersistError, StoredObject, TokenFile, TokenImage};
use crate::token::{
    Attribute, AttributeType, KeyHandle, KeyType, Mechanism, ObjectClass, ObjectHandle,
    SessionHandle, SlotId, Token, TokenError, TokenResult, AES_BLOCK_LEN,
};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use zeroize::Zeroizing;

const DEFAULT_CAPACITY: usize = 64;

/// Operations of the [`Token`] trait, used for call counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenOp {
    Initialize,
    Finalize,
    OpenSession,
    CloseSession,
    Login,
    Logout,
    FindObjectsInit,
    FindObjects,
    FindObjectsFinal,
    GetAttributeValue,
    CreateObject,
    DestroyObject,
    EncryptInit,
    Encrypt,
    DecryptInit,
    Decrypt,
}

#[derive(Debug, Clone)]
struct SoftObject {
    class: ObjectClass,
    label: Vec<u8>,
    value: Zeroizing<Vec<u8>>,
    token: bool,
    private: bool,
    key_type: Option<KeyType>,
    encrypt: bool,
    decrypt: bool,
    sensitive: bool,
    owner: Option<SessionHandle>,
}

impl SoftObject {
    fn matches(&self, attribute: &Attribute) -> bool {
        match attribute {
            Attribute::Class(class) => self.class == *class,
            Attribute::Label(label) => self.label == *label,
            Attribute::Value(value) => self.value.as_slice() == value.as_slice(),
            Attribute::Token(token) => self.token == *token,
            Attribute::Private(private) => self.private == *private,
            Attribute::KeyType(key_type) => self.key_type == Some(*key_type),
            Attribute::Encrypt(flag) => self.encrypt == *flag,
            Attribute::Decrypt(flag) => self.decrypt == *flag,
            Attribute::Sensitive(flag) => self.sensitive == *flag,
        }
    }

    fn attribute_bytes(&self, attribute: AttributeType) -> TokenResult<Vec<u8>> {
        let bytes = match attribute {
            AttributeType::Class => class_code(self.class).to_le_bytes().to_vec(),
            AttributeType::Label => self.label.clone(),
            AttributeType::Value if self.sensitive => return Err(TokenError::AttributeSensitive),
            AttributeType::Value => self.value.to_vec(),
            AttributeType::Token => vec![self.token as u8],
            AttributeType::Private => vec![self.private as u8],
            AttributeType::KeyType => match self.key_type {
                Some(KeyType::Aes) => 0x1fu64.to_le_bytes().to_vec(),
                Some(KeyType::GenericSecret) => 0x10u64.to_le_bytes().to_vec(),
                None => return Err(TokenError::AttributeTypeInvalid),
            },
            AttributeType::Encrypt => vec![self.encrypt as u8],
            AttributeType::Decrypt => vec![self.decrypt as u8],
            AttributeType::Sensitive => vec![self.sensitive as u8],
        };
        Ok(bytes)
    }

    fn from_template(template: &[Attribute], owner: SessionHandle) -> TokenResult<Self> {
        let mut seen = Vec::with_capacity(template.len());
        for attribute in template {
            let ty = attribute.attribute_type();
            if seen.contains(&ty) {
                return Err(TokenError::TemplateInconsistent);
            }
            seen.push(ty);
        }
        let class = template
            .iter()
            .find_map(|a| match a {
                Attribute::Class(class) => Some(*class),
                _ => None,
            })
            .ok_or(TokenError::TemplateIncomplete)?;
        let is_key = class == ObjectClass::SecretKey;

        let mut object = SoftObject {
            class,
            label: vec![],
            value: Zeroizing::new(vec![]),
            token: false,
            private: is_key,
            key_type: None,
            encrypt: is_key,
            decrypt: is_key,
            sensitive: is_key,
            owner: Some(owner),
        };
        let mut has_value = false;
        for attribute in template {
            match attribute {
                Attribute::Class(_) => {}
                Attribute::Label(label) => object.label = label.clone(),
                Attribute::Value(value) => {
                    object.value = Zeroizing::new(value.clone());
                    has_value = true;
                }
                Attribute::Token(token) => object.token = *token,
                Attribute::Private(private) => object.private = *private,
                Attribute::KeyType(key_type) if is_key => object.key_type = Some(*key_type),
                Attribute::Encrypt(flag) if is_key => object.encrypt = *flag,
                Attribute::Decrypt(flag) if is_key => object.decrypt = *flag,
                Attribute::Sensitive(flag) if is_key => object.sensitive = *flag,
                _ => return Err(TokenError::TemplateInconsistent),
            }
        }
        if is_key {
            let key_type = object.key_type.ok_or(TokenError::TemplateIncomplete)?;
            if !has_value {
                return Err(TokenError::TemplateIncomplete);
            }
            if key_type == KeyType::Aes && !matches!(object.value.len(), 16 | 24 | 32) {
                return Err(TokenError::TemplateInconsistent);
            }
        }
        if object.token {
            object.owner = None;
        }
        Ok(object)
    }

    fn to_stored(&self, handle: u64) -> StoredObject {
        StoredObject {
            handle,
            class: self.class,
            label: self.label.clone(),
            value: self.value.to_vec(),
            private: self.private,
            key_type: self.key_type,
            encrypt: self.encrypt,
            decrypt: self.decrypt,
            sensitive: self.sensitive,
        }
    }

    fn from_stored(stored: &StoredObject) -> Self {
        SoftObject {
            class: stored.class,
            label: stored.label.clone(),
            value: Zeroizing::new(stored.value.clone()),
            token: true,
            private: stored.private,
            key_type: stored.key_type,
            encrypt: stored.encrypt,
            decrypt: stored.decrypt,
            sensitive: stored.sensitive,
            owner: None,
        }
    }
}

fn class_code(class: ObjectClass) -> u64 {
    match class {
        ObjectClass::Data => 0,
        ObjectClass::SecretKey => 4,
    }
}

struct FindState {
    matches: Vec<ObjectHandle>,
    cursor: usize,
}

enum CryptoState {
    Encrypt {
        key: Zeroizing<Vec<u8>>,
        iv: [u8; AES_BLOCK_LEN],
    },
    Decrypt {
        key: Zeroizing<Vec<u8>>,
        iv: [u8; AES_BLOCK_LEN],
    },
}

#[derive(Default)]
struct SoftSession {
    find: Option<FindState>,
    crypto: Option<CryptoState>,
}

struct Backing {
    file: TokenFile,
    key: Option<Zeroizing<Vec<u8>>>,
    created_at: chrono::DateTime<Utc>,
}

struct SoftState {
    initialized: bool,
    logged_in: bool,
    next_session: u64,
    next_object: u64,
    sessions: HashMap<SessionHandle, SoftSession>,
    objects: BTreeMap<u64, SoftObject>,
    backing: Option<Backing>,
}

impl SoftState {
    fn require_initialized(&self) -> TokenResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(TokenError::NotInitialized)
        }
    }

    fn session_mut(&mut self, session: SessionHandle) -> TokenResult<&mut SoftSession> {
        self.require_initialized()?;
        self.sessions
            .get_mut(&session)
            .ok_or(TokenError::SessionHandleInvalid)
    }

    fn check_session(&self, session: SessionHandle) -> TokenResult<()> {
        self.require_initialized()?;
        if self.sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(TokenError::SessionHandleInvalid)
        }
    }

    fn visible(&self, handle: ObjectHandle) -> TokenResult<&SoftObject> {
        match self.objects.get(&handle.0) {
            Some(object) if !object.private || self.logged_in => Ok(object),
            _ => Err(TokenError::ObjectHandleInvalid),
        }
    }

    fn key_material(&self, key: KeyHandle, for_encrypt: bool) -> TokenResult<Zeroizing<Vec<u8>>> {
        let object = self
            .visible(key.object())
            .map_err(|_| TokenError::KeyHandleInvalid)?;
        if object.class != ObjectClass::SecretKey {
            return Err(TokenError::KeyHandleInvalid);
        }
        if object.key_type != Some(KeyType::Aes) {
            return Err(TokenError::KeyTypeInconsistent);
        }
        let permitted = if for_encrypt { object.encrypt } else { object.decrypt };
        if !permitted {
            return Err(TokenError::KeyFunctionNotPermitted);
        }
        Ok(object.value.clone())
    }

    fn drop_logged_in_state(&mut self) {
        self.logged_in = false;
        if let Some(backing) = self.backing.as_mut() {
            backing.key = None;
            self.objects.retain(|_, object| !object.token);
        }
    }

    fn persist(&mut self) -> TokenResult<()> {
        let Some(backing) = self.backing.as_mut() else {
            return Ok(());
        };
        let Some(key) = backing.key.as_ref() else {
            return Err(TokenError::UserNotLoggedIn);
        };
        let image = TokenImage {
            slot: backing.file.slot(),
            created_at: backing.created_at,
            last_modified: Utc::now(),
            next_object: self.next_object,
            objects: self
                .objects
                .iter()
                .filter(|(_, object)| object.token)
                .map(|(handle, object)| object.to_stored(*handle))
                .collect(),
        };
        backing
            .file
            .save(key, &image)
            .map_err(|e| TokenError::DeviceError(e.to_string()))
    }
}

#[derive(Default)]
struct Instruments {
    calls: HashMap<TokenOp, usize>,
    faults: HashMap<TokenOp, TokenError>,
    corrupt_value: Option<(usize, u8)>,
}

pub struct SoftToken {
    slot: SlotId,
    user_pin: Option<Zeroizing<Vec<u8>>>,
    capacity: usize,
    state: Mutex<SoftState>,
    instruments: Mutex<Instruments>,
}

impl SoftToken {
    /// An in-memory token on `slot` whose user PIN is `pin`.
    pub fn new(slot: SlotId, pin: &str) -> Self {
        Self::with_state(slot, Some(Zeroizing::new(pin.as_bytes().to_vec())), None)
    }

    /// Creates an encrypted token file at `path`. Refuses to overwrite.
    pub fn create_file<P: AsRef<Path>>(
        path: P,
        slot: SlotId,
        pin: &str,
        kdf: KdfParams,
    ) -> Result<Self, PersistError> {
        let (file, _key) = TokenFile::create(path, slot, pin.as_bytes(), kdf)?;
        Ok(Self::with_state(
            slot,
            None,
            Some(Backing {
                file,
                key: None,
                created_at: Utc::now(),
            }),
        ))
    }

    /// Opens an existing token file. Its objects become visible after login.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let file = TokenFile::open(path)?;
        let slot = file.slot();
        Ok(Self::with_state(
            slot,
            None,
            Some(Backing {
                file,
                key: None,
                created_at: Utc::now(),
            }),
        ))
    }

    fn with_state(slot: SlotId, user_pin: Option<Zeroizing<Vec<u8>>>, backing: Option<Backing>) -> Self {
        Self {
            slot,
            user_pin,
            capacity: DEFAULT_CAPACITY,
            state: Mutex::new(SoftState {
                initialized: false,
                logged_in: false,
                next_session: 1,
                next_object: 1,
                sessions: HashMap::new(),
                objects: BTreeMap::new(),
                backing,
            }),
            instruments: Mutex::new(Instruments::default()),
        }
    }

    /// Limits the number of objects the token accepts.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Pre-provisions a persistent, private AES key.
    pub fn with_secret_key(self, label: &str, key: &[u8]) -> Self {
        self.insert_object(SoftObject {
            class: ObjectClass::SecretKey,
            label: label.as_bytes().to_vec(),
            value: Zeroizing::new(key.to_vec()),
            token: true,
            private: true,
            key_type: Some(KeyType::Aes),
            encrypt: true,
            decrypt: true,
            sensitive: true,
            owner: None,
        })
    }

    /// Pre-provisions a persistent, private data object.
    pub fn with_data_object(self, label: &str, value: &[u8]) -> Self {
        self.insert_object(SoftObject {
            class: ObjectClass::Data,
            label: label.as_bytes().to_vec(),
            value: Zeroizing::new(value.to_vec()),
            token: true,
            private: true,
            key_type: None,
            encrypt: false,
            decrypt: false,
            sensitive: false,
            owner: None,
        })
    }

    fn insert_object(self, object: SoftObject) -> Self {
        {
            let mut state = self.state.lock();
            let handle = state.next_object;
            state.next_object += 1;
            state.objects.insert(handle, object);
        }
        self
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// Number of times `op` was invoked, including calls that failed.
    pub fn calls(&self, op: TokenOp) -> usize {
        self.instruments.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Makes the next call of `op` fail with `error`.
    pub fn inject_fault(&self, op: TokenOp, error: TokenError) {
        self.instruments.lock().faults.insert(op, error);
    }

    /// XORs `mask` into byte `index` of every data-object value read from now on.
    pub fn corrupt_value_reads(&self, index: usize, mask: u8) {
        self.instruments.lock().corrupt_value = Some((index, mask));
    }

    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    pub fn is_logged_in(&self) -> bool {
        self.state.lock().logged_in
    }

    pub fn open_session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Counts all objects on the token matching `class` and `label`, ignoring login state.
    pub fn count_objects(&self, class: ObjectClass, label: &str) -> usize {
        self.state
            .lock()
            .objects
            .values()
            .filter(|o| o.class == class && o.label == label.as_bytes())
            .count()
    }

    fn enter(&self, op: TokenOp) -> TokenResult<()> {
        let mut instruments = self.instruments.lock();
        *instruments.calls.entry(op).or_insert(0) += 1;
        match instruments.faults.remove(&op) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn check_pin(&self, state: &mut SoftState, pin: &[u8]) -> TokenResult<()> {
        if let Some(backing) = state.backing.as_mut() {
            let (image, key) = backing.file.unlock(pin).map_err(|e| match e {
                PersistError::Decrypt => TokenError::PinIncorrect,
                other => TokenError::DeviceError(other.to_string()),
            })?;
            backing.key = Some(key);
            backing.created_at = image.created_at;
            // stored handles may collide with objects created before login
            state.next_object = state.next_object.max(image.next_object);
            for stored in &image.objects {
                let handle = state.next_object;
                state.next_object += 1;
                state.objects.insert(handle, SoftObject::from_stored(stored));
            }
            return Ok(());
        }
        match self.user_pin.as_ref() {
            Some(expected) if expected.as_slice() == pin => Ok(()),
            _ => Err(TokenError::PinIncorrect),
        }
    }
}

fn cbc_pad_encrypt(key: &[u8], iv: &[u8; AES_BLOCK_LEN], data: &[u8]) -> TokenResult<Vec<u8>> {
    let ciphertext = match key.len() {
        16 => cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| TokenError::KeySizeRange)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Encryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(|_| TokenError::KeySizeRange)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Encryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| TokenError::KeySizeRange)?
            .encrypt_padded_vec_mut::<Pkcs7>(data),
        _ => return Err(TokenError::KeySizeRange),
    };
    Ok(ciphertext)
}

fn cbc_pad_decrypt(
    key: &[u8],
    iv: &[u8; AES_BLOCK_LEN],
    data: &[u8],
) -> TokenResult<Zeroizing<Vec<u8>>> {
    let plaintext = match key.len() {
        16 => cbc::Decryptor::<aes::Aes128>::new_from_slices(key, iv)
            .map_err(|_| TokenError::KeySizeRange)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        24 => cbc::Decryptor::<aes::Aes192>::new_from_slices(key, iv)
            .map_err(|_| TokenError::KeySizeRange)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        32 => cbc::Decryptor::<aes::Aes256>::new_from_slices(key, iv)
            .map_err(|_| TokenError::KeySizeRange)?
            .decrypt_padded_vec_mut::<Pkcs7>(data),
        _ => return Err(TokenError::KeySizeRange),
    };
    plaintext
        .map(Zeroizing::new)
        .map_err(|_| TokenError::EncryptedDataInvalid)
}

fn padded_len(len: usize) -> usize {
    (len / AES_BLOCK_LEN + 1) * AES_BLOCK_LEN
}

impl Token for SoftToken {
    fn initialize(&self) -> TokenResult<()> {
        self.enter(TokenOp::Initialize)?;
        let mut state = self.state.lock();
        if state.initialized {
            return Err(TokenError::AlreadyInitialized);
        }
        state.initialized = true;
        Ok(())
    }

    fn finalize(&self) -> TokenResult<()> {
        self.enter(TokenOp::Finalize)?;
        let mut state = self.state.lock();
        state.require_initialized()?;
        let sessions: Vec<SessionHandle> = state.sessions.keys().copied().collect();
        for session in sessions {
            state.objects.retain(|_, object| object.owner != Some(session));
        }
        state.sessions.clear();
        state.drop_logged_in_state();
        state.initialized = false;
        Ok(())
    }

    fn open_session(&self, slot: SlotId) -> TokenResult<SessionHandle> {
        self.enter(TokenOp::OpenSession)?;
        let mut state = self.state.lock();
        state.require_initialized()?;
        if slot != self.slot {
            return Err(TokenError::SlotIdInvalid(slot));
        }
        let handle = SessionHandle(state.next_session);
        state.next_session += 1;
        state.sessions.insert(handle, SoftSession::default());
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> TokenResult<()> {
        self.enter(TokenOp::CloseSession)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        state.sessions.remove(&session);
        state.objects.retain(|_, object| object.owner != Some(session));
        if state.sessions.is_empty() && state.logged_in {
            state.drop_logged_in_state();
        }
        Ok(())
    }

    fn login(&self, session: SessionHandle, pin: &[u8]) -> TokenResult<()> {
        self.enter(TokenOp::Login)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        if state.logged_in {
            return Err(TokenError::UserAlreadyLoggedIn);
        }
        if pin.is_empty() {
            return Err(TokenError::PinLenRange);
        }
        self.check_pin(&mut state, pin)?;
        state.logged_in = true;
        Ok(())
    }

    fn logout(&self, session: SessionHandle) -> TokenResult<()> {
        self.enter(TokenOp::Logout)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        if !state.logged_in {
            return Err(TokenError::UserNotLoggedIn);
        }
        state.drop_logged_in_state();
        Ok(())
    }

    fn find_objects_init(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<()> {
        self.enter(TokenOp::FindObjectsInit)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        let logged_in = state.logged_in;
        let matches: Vec<ObjectHandle> = state
            .objects
            .iter()
            .filter(|(_, object)| !object.private || logged_in)
            .filter(|(_, object)| template.iter().all(|attribute| object.matches(attribute)))
            .map(|(handle, _)| ObjectHandle(*handle))
            .collect();
        let sess = state.session_mut(session)?;
        if sess.find.is_some() {
            return Err(TokenError::OperationActive);
        }
        sess.find = Some(FindState { matches, cursor: 0 });
        Ok(())
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> TokenResult<Vec<ObjectHandle>> {
        self.enter(TokenOp::FindObjects)?;
        let mut state = self.state.lock();
        let sess = state.session_mut(session)?;
        let find = sess.find.as_mut().ok_or(TokenError::OperationNotInitialized)?;
        let end = (find.cursor + max).min(find.matches.len());
        let batch = find.matches[find.cursor..end].to_vec();
        find.cursor = end;
        Ok(batch)
    }

    fn find_objects_final(&self, session: SessionHandle) -> TokenResult<()> {
        self.enter(TokenOp::FindObjectsFinal)?;
        let mut state = self.state.lock();
        let sess = state.session_mut(session)?;
        match sess.find.take() {
            Some(_) => Ok(()),
            None => Err(TokenError::OperationNotInitialized),
        }
    }

    fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: AttributeType,
        out: Option<&mut [u8]>,
    ) -> TokenResult<usize> {
        self.enter(TokenOp::GetAttributeValue)?;
        let state = self.state.lock();
        state.check_session(session)?;
        let found = state.visible(object)?;
        let mut bytes = found.attribute_bytes(attribute)?;
        if attribute == AttributeType::Value && found.class == ObjectClass::Data {
            if let Some((index, mask)) = self.instruments.lock().corrupt_value {
                if let Some(byte) = bytes.get_mut(index) {
                    *byte ^= mask;
                }
            }
        }
        let bytes = Zeroizing::new(bytes);
        match out {
            None => Ok(bytes.len()),
            Some(buf) if buf.len() < bytes.len() => Err(TokenError::BufferTooSmall {
                required: bytes.len(),
            }),
            Some(buf) => {
                buf[..bytes.len()].copy_from_slice(&bytes);
                Ok(bytes.len())
            }
        }
    }

    fn create_object(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<ObjectHandle> {
        self.enter(TokenOp::CreateObject)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        let object = SoftObject::from_template(template, session)?;
        if object.private && !state.logged_in {
            return Err(TokenError::UserNotLoggedIn);
        }
        if state.objects.len() >= self.capacity {
            return Err(TokenError::DeviceMemory);
        }
        let persistent = object.token;
        let handle = state.next_object;
        state.next_object += 1;
        state.objects.insert(handle, object);
        if persistent {
            if let Err(e) = state.persist() {
                state.objects.remove(&handle);
                return Err(e);
            }
        }
        Ok(ObjectHandle(handle))
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> TokenResult<()> {
        self.enter(TokenOp::DestroyObject)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        let persistent = state.visible(object)?.token;
        state.objects.remove(&object.0);
        if persistent {
            state.persist()?;
        }
        Ok(())
    }

    fn encrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()> {
        self.enter(TokenOp::EncryptInit)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        let Mechanism::AesCbcPad { iv } = *mechanism;
        let material = state.key_material(key, true)?;
        let sess = state.session_mut(session)?;
        if sess.crypto.is_some() {
            return Err(TokenError::OperationActive);
        }
        sess.crypto = Some(CryptoState::Encrypt { key: material, iv });
        Ok(())
    }

    fn encrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize> {
        self.enter(TokenOp::Encrypt)?;
        let mut state = self.state.lock();
        let sess = state.session_mut(session)?;
        if !matches!(sess.crypto, Some(CryptoState::Encrypt { .. })) {
            return Err(TokenError::OperationNotInitialized);
        }
        let required = padded_len(data.len());
        let Some(buf) = out else {
            return Ok(required);
        };
        if buf.len() < required {
            return Err(TokenError::BufferTooSmall { required });
        }
        let Some(CryptoState::Encrypt { key, iv }) = sess.crypto.take() else {
            return Err(TokenError::OperationNotInitialized);
        };
        let ciphertext = cbc_pad_encrypt(&key, &iv, data)?;
        buf[..ciphertext.len()].copy_from_slice(&ciphertext);
        Ok(ciphertext.len())
    }

    fn decrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()> {
        self.enter(TokenOp::DecryptInit)?;
        let mut state = self.state.lock();
        state.check_session(session)?;
        let Mechanism::AesCbcPad { iv } = *mechanism;
        let material = state.key_material(key, false)?;
        let sess = state.session_mut(session)?;
        if sess.crypto.is_some() {
            return Err(TokenError::OperationActive);
        }
        sess.crypto = Some(CryptoState::Decrypt { key: material, iv });
        Ok(())
    }

    fn decrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize> {
        self.enter(TokenOp::Decrypt)?;
        let mut state = self.state.lock();
        let sess = state.session_mut(session)?;
        if !matches!(sess.crypto, Some(CryptoState::Decrypt { .. })) {
            return Err(TokenError::OperationNotInitialized);
        }
        if data.is_empty() || data.len() % AES_BLOCK_LEN != 0 {
            sess.crypto = None;
            return Err(TokenError::EncryptedDataLenRange);
        }
        let Some(buf) = out else {
            // Upper bound; the exact length is only known once padding is removed.
            return Ok(data.len());
        };
        let Some(CryptoState::Decrypt { key, iv }) = sess.crypto.as_ref() else {
            return Err(TokenError::OperationNotInitialized);
        };
        let plaintext = match cbc_pad_decrypt(key, iv, data) {
            Ok(plaintext) => plaintext,
            Err(e) => {
                sess.crypto = None;
                return Err(e);
            }
        };
        if buf.len() < plaintext.len() {
            return Err(TokenError::BufferTooSmall {
                required: plaintext.len(),
            });
        }
        sess.crypto = None;
        buf[..plaintext.len()].copy_from_slice(&plaintext);
        Ok(plaintext.len())
    }
}
