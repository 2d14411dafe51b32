//! [`Token`] over a vendor PKCS#11 module loaded with `cryptoki`.
//!
//! cryptoki exposes single-shot encrypt/decrypt and search calls, so the
//! length query of the two-phase protocol runs the operation and caches the
//! output until the fill call collects it. Handles handed out are local
//! numbers mapped onto the module's handles.

use crate::token::{
    Attribute, AttributeType, KeyHandle, KeyType, Mechanism, ObjectClass, ObjectHandle,
    SessionHandle, SlotId, Token, TokenError, TokenResult,
};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CkError, RvError};
use cryptoki::mechanism::Mechanism as CkMechanism;
use cryptoki::object::{
    Attribute as CkAttribute, AttributeType as CkAttributeType, KeyType as CkKeyType,
    ObjectClass as CkObjectClass, ObjectHandle as CkObjectHandle,
};
use cryptoki::session::{Session as CkSession, UserType};
use cryptoki::types::AuthPin;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Encrypt,
    Decrypt,
}

struct Pending {
    direction: Direction,
    mechanism: Mechanism,
    key: CkObjectHandle,
    output: Option<Zeroizing<Vec<u8>>>,
}

struct Search {
    template: Vec<CkAttribute>,
    exhausted: bool,
}

struct LiveSession {
    inner: CkSession,
    search: Option<Search>,
    pending: Option<Pending>,
}

impl LiveSession {
    fn begin(&mut self, direction: Direction, mechanism: Mechanism, key: CkObjectHandle) -> TokenResult<()> {
        if self.pending.is_some() {
            return Err(TokenError::OperationActive);
        }
        self.pending = Some(Pending {
            direction,
            mechanism,
            key,
            output: None,
        });
        Ok(())
    }

    /// The first call runs the operation; the call that fills `out` ends it.
    fn advance(&mut self, direction: Direction, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize> {
        let pending = match self.pending.as_mut() {
            Some(pending) if pending.direction == direction => pending,
            _ => return Err(TokenError::OperationNotInitialized),
        };
        if pending.output.is_none() {
            let mechanism = ck_mechanism(&pending.mechanism);
            let result = match direction {
                Direction::Encrypt => self.inner.encrypt(&mechanism, pending.key, data),
                Direction::Decrypt => self.inner.decrypt(&mechanism, pending.key, data),
            };
            match result {
                Ok(output) => pending.output = Some(Zeroizing::new(output)),
                Err(e) => {
                    self.pending = None;
                    return Err(map_error(e));
                }
            }
        }
        let Some(output) = pending.output.as_ref() else {
            return Err(TokenError::OperationNotInitialized);
        };
        let Some(out) = out else {
            return Ok(output.len());
        };
        let written = fill(output, out)?;
        self.pending = None;
        Ok(written)
    }
}

struct Loaded {
    ctx: Pkcs11,
    next_session: u64,
    sessions: HashMap<SessionHandle, LiveSession>,
    objects: Vec<CkObjectHandle>,
}

impl Loaded {
    fn session(&mut self, session: SessionHandle) -> TokenResult<&mut LiveSession> {
        self.sessions
            .get_mut(&session)
            .ok_or(TokenError::SessionHandleInvalid)
    }

    fn local(&mut self, handle: CkObjectHandle) -> ObjectHandle {
        let index = match self.objects.iter().position(|h| *h == handle) {
            Some(index) => index,
            None => {
                self.objects.push(handle);
                self.objects.len() - 1
            }
        };
        ObjectHandle(index as u64 + 1)
    }

    fn remote(&self, handle: ObjectHandle) -> TokenResult<CkObjectHandle> {
        (handle.0 as usize)
            .checked_sub(1)
            .and_then(|index| self.objects.get(index))
            .copied()
            .ok_or(TokenError::ObjectHandleInvalid)
    }
}

pub struct Pkcs11Token {
    module: PathBuf,
    state: Mutex<Option<Loaded>>,
}

impl Pkcs11Token {
    /// The module is loaded at `initialize`, not here.
    pub fn new<P: AsRef<Path>>(module: P) -> Self {
        Self {
            module: module.as_ref().to_path_buf(),
            state: Mutex::new(None),
        }
    }

    fn with_session<R>(
        &self,
        session: SessionHandle,
        f: impl FnOnce(&mut LiveSession) -> TokenResult<R>,
    ) -> TokenResult<R> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        f(loaded.session(session)?)
    }

    fn begin(&self, session: SessionHandle, direction: Direction, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        let key = loaded.remote(key.object()).map_err(|_| TokenError::KeyHandleInvalid)?;
        loaded.session(session)?.begin(direction, *mechanism, key)
    }
}

fn map_error(error: CkError) -> TokenError {
    let rv = match error {
        CkError::Pkcs11(rv, ..) => rv,
        other => return TokenError::Backend(other.to_string()),
    };
    match rv {
        RvError::CryptokiNotInitialized => TokenError::NotInitialized,
        RvError::CryptokiAlreadyInitialized => TokenError::AlreadyInitialized,
        RvError::SessionHandleInvalid | RvError::SessionClosed => TokenError::SessionHandleInvalid,
        RvError::PinIncorrect => TokenError::PinIncorrect,
        RvError::PinInvalid => TokenError::PinInvalid,
        RvError::PinLenRange => TokenError::PinLenRange,
        RvError::PinLocked => TokenError::PinLocked,
        RvError::UserAlreadyLoggedIn => TokenError::UserAlreadyLoggedIn,
        RvError::UserNotLoggedIn => TokenError::UserNotLoggedIn,
        RvError::ObjectHandleInvalid => TokenError::ObjectHandleInvalid,
        RvError::KeyHandleInvalid => TokenError::KeyHandleInvalid,
        RvError::KeyTypeInconsistent => TokenError::KeyTypeInconsistent,
        RvError::KeySizeRange => TokenError::KeySizeRange,
        RvError::KeyFunctionNotPermitted => TokenError::KeyFunctionNotPermitted,
        RvError::MechanismInvalid | RvError::MechanismParamInvalid => TokenError::MechanismInvalid,
        RvError::OperationActive => TokenError::OperationActive,
        RvError::OperationNotInitialized => TokenError::OperationNotInitialized,
        RvError::EncryptedDataInvalid => TokenError::EncryptedDataInvalid,
        RvError::EncryptedDataLenRange => TokenError::EncryptedDataLenRange,
        RvError::AttributeSensitive => TokenError::AttributeSensitive,
        RvError::AttributeTypeInvalid => TokenError::AttributeTypeInvalid,
        RvError::TemplateIncomplete => TokenError::TemplateIncomplete,
        RvError::TemplateInconsistent => TokenError::TemplateInconsistent,
        RvError::DeviceMemory | RvError::HostMemory => TokenError::DeviceMemory,
        other @ (RvError::DeviceError | RvError::DeviceRemoved | RvError::TokenNotPresent) => {
            TokenError::DeviceError(other.to_string())
        }
        other => TokenError::Backend(other.to_string()),
    }
}

fn ck_class(class: ObjectClass) -> CkObjectClass {
    match class {
        ObjectClass::SecretKey => CkObjectClass::SECRET_KEY,
        ObjectClass::Data => CkObjectClass::DATA,
    }
}

fn ck_key_type(key_type: KeyType) -> CkKeyType {
    match key_type {
        KeyType::Aes => CkKeyType::AES,
        KeyType::GenericSecret => CkKeyType::GENERIC_SECRET,
    }
}

fn ck_attribute(attribute: &Attribute) -> CkAttribute {
    match attribute {
        Attribute::Class(class) => CkAttribute::Class(ck_class(*class)),
        Attribute::Label(label) => CkAttribute::Label(label.clone()),
        Attribute::Value(value) => CkAttribute::Value(value.clone()),
        Attribute::Token(flag) => CkAttribute::Token(*flag),
        Attribute::Private(flag) => CkAttribute::Private(*flag),
        Attribute::KeyType(key_type) => CkAttribute::KeyType(ck_key_type(*key_type)),
        Attribute::Encrypt(flag) => CkAttribute::Encrypt(*flag),
        Attribute::Decrypt(flag) => CkAttribute::Decrypt(*flag),
        Attribute::Sensitive(flag) => CkAttribute::Sensitive(*flag),
    }
}

fn ck_attribute_type(attribute: AttributeType) -> CkAttributeType {
    match attribute {
        AttributeType::Class => CkAttributeType::Class,
        AttributeType::Label => CkAttributeType::Label,
        AttributeType::Value => CkAttributeType::Value,
        AttributeType::Token => CkAttributeType::Token,
        AttributeType::Private => CkAttributeType::Private,
        AttributeType::KeyType => CkAttributeType::KeyType,
        AttributeType::Encrypt => CkAttributeType::Encrypt,
        AttributeType::Decrypt => CkAttributeType::Decrypt,
        AttributeType::Sensitive => CkAttributeType::Sensitive,
    }
}

fn attribute_bytes(attribute: CkAttribute) -> TokenResult<Vec<u8>> {
    let bytes = match attribute {
        CkAttribute::Label(bytes) | CkAttribute::Value(bytes) => bytes,
        CkAttribute::Token(flag)
        | CkAttribute::Private(flag)
        | CkAttribute::Encrypt(flag)
        | CkAttribute::Decrypt(flag)
        | CkAttribute::Sensitive(flag) => vec![flag as u8],
        CkAttribute::Class(class) if class == CkObjectClass::DATA => 0u64.to_le_bytes().to_vec(),
        CkAttribute::Class(class) if class == CkObjectClass::SECRET_KEY => 4u64.to_le_bytes().to_vec(),
        CkAttribute::KeyType(key_type) if key_type == CkKeyType::AES => 0x1fu64.to_le_bytes().to_vec(),
        CkAttribute::KeyType(key_type) if key_type == CkKeyType::GENERIC_SECRET => {
            0x10u64.to_le_bytes().to_vec()
        }
        _ => return Err(TokenError::AttributeTypeInvalid),
    };
    Ok(bytes)
}

fn ck_mechanism(mechanism: &Mechanism) -> CkMechanism<'static> {
    match mechanism {
        Mechanism::AesCbcPad { iv } => CkMechanism::AesCbcPad(*iv),
    }
}

fn fill(output: &[u8], out: &mut [u8]) -> TokenResult<usize> {
    if out.len() < output.len() {
        return Err(TokenError::BufferTooSmall {
            required: output.len(),
        });
    }
    out[..output.len()].copy_from_slice(output);
    Ok(output.len())
}

impl Token for Pkcs11Token {
    fn initialize(&self) -> TokenResult<()> {
        let mut state = self.state.lock();
        if state.is_some() {
            return Err(TokenError::AlreadyInitialized);
        }
        let ctx = Pkcs11::new(&self.module).map_err(|e| TokenError::DeviceError(e.to_string()))?;
        ctx.initialize(CInitializeArgs::OsThreads).map_err(map_error)?;
        debug!(module = %self.module.display(), "PKCS#11 module loaded");
        *state = Some(Loaded {
            ctx,
            next_session: 1,
            sessions: HashMap::new(),
            objects: Vec::new(),
        });
        Ok(())
    }

    fn finalize(&self) -> TokenResult<()> {
        let loaded = self.state.lock().take().ok_or(TokenError::NotInitialized)?;
        let Loaded { ctx, sessions, .. } = loaded;
        // sessions close on drop, before the context finalizes on drop
        drop(sessions);
        drop(ctx);
        Ok(())
    }

    fn open_session(&self, slot: SlotId) -> TokenResult<SessionHandle> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        let ck_slot = loaded
            .ctx
            .get_slots_with_token()
            .map_err(map_error)?
            .into_iter()
            .find(|s| s.id() == slot.0)
            .ok_or(TokenError::SlotIdInvalid(slot))?;
        let inner = loaded.ctx.open_rw_session(ck_slot).map_err(map_error)?;
        let handle = SessionHandle(loaded.next_session);
        loaded.next_session += 1;
        loaded.sessions.insert(
            handle,
            LiveSession {
                inner,
                search: None,
                pending: None,
            },
        );
        Ok(handle)
    }

    fn close_session(&self, session: SessionHandle) -> TokenResult<()> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        loaded
            .sessions
            .remove(&session)
            .map(drop)
            .ok_or(TokenError::SessionHandleInvalid)
    }

    fn login(&self, session: SessionHandle, pin: &[u8]) -> TokenResult<()> {
        let pin = String::from_utf8(pin.to_vec()).map_err(|_| TokenError::PinInvalid)?;
        let pin = AuthPin::new(pin);
        self.with_session(session, |live| {
            live.inner.login(UserType::User, Some(&pin)).map_err(map_error)
        })
    }

    fn logout(&self, session: SessionHandle) -> TokenResult<()> {
        self.with_session(session, |live| live.inner.logout().map_err(map_error))
    }

    fn find_objects_init(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<()> {
        self.with_session(session, |live| {
            if live.search.is_some() {
                return Err(TokenError::OperationActive);
            }
            live.search = Some(Search {
                template: template.iter().map(ck_attribute).collect(),
                exhausted: false,
            });
            Ok(())
        })
    }

    fn find_objects(&self, session: SessionHandle, max: usize) -> TokenResult<Vec<ObjectHandle>> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        let live = loaded.session(session)?;
        let search = live.search.as_mut().ok_or(TokenError::OperationNotInitialized)?;
        // cryptoki runs the whole search in one call; later batches are empty
        if search.exhausted {
            return Ok(Vec::new());
        }
        search.exhausted = true;
        let found = live.inner.find_objects(&search.template).map_err(map_error)?;
        Ok(found.into_iter().take(max).map(|h| loaded.local(h)).collect())
    }

    fn find_objects_final(&self, session: SessionHandle) -> TokenResult<()> {
        self.with_session(session, |live| {
            live.search
                .take()
                .map(drop)
                .ok_or(TokenError::OperationNotInitialized)
        })
    }

    fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: AttributeType,
        out: Option<&mut [u8]>,
    ) -> TokenResult<usize> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        let remote = loaded.remote(object)?;
        let live = loaded.session(session)?;
        let value = live
            .inner
            .get_attributes(remote, &[ck_attribute_type(attribute)])
            .map_err(map_error)?
            .into_iter()
            .next()
            .ok_or(TokenError::AttributeTypeInvalid)?;
        let bytes = Zeroizing::new(attribute_bytes(value)?);
        match out {
            None => Ok(bytes.len()),
            Some(out) => fill(&bytes, out),
        }
    }

    fn create_object(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<ObjectHandle> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        let template: Vec<CkAttribute> = template.iter().map(ck_attribute).collect();
        let created = loaded
            .session(session)?
            .inner
            .create_object(&template)
            .map_err(map_error)?;
        Ok(loaded.local(created))
    }

    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> TokenResult<()> {
        let mut state = self.state.lock();
        let loaded = state.as_mut().ok_or(TokenError::NotInitialized)?;
        let remote = loaded.remote(object)?;
        loaded
            .session(session)?
            .inner
            .destroy_object(remote)
            .map_err(map_error)
    }

    fn encrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()> {
        self.begin(session, Direction::Encrypt, mechanism, key)
    }

    fn encrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize> {
        self.with_session(session, |live| live.advance(Direction::Encrypt, data, out))
    }

    fn decrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()> {
        self.begin(session, Direction::Decrypt, mechanism, key)
    }

    fn decrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize> {
        self.with_session(session, |live| live.advance(Direction::Decrypt, data, out))
    }
}
