//! Secure-element capability set.
//!
//! `Token` mirrors a handle-based secure-element API call for call. Every
//! variable-length output (attribute values, encrypt, decrypt) follows the
//! two-phase protocol: pass `None` to learn the required length, then pass a
//! buffer of that length to receive the bytes. Higher layers never expose that
//! shape; see `cipher` and `object_store`.

pub mod persist;
#[cfg(feature = "pkcs11")]
pub mod pkcs11;
pub mod soft;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[cfg(feature = "pkcs11")]
pub use pkcs11::Pkcs11Token;
pub use soft::{SoftToken, TokenOp};

/// Block size of the AES family, in bytes.
pub const AES_BLOCK_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

impl SessionHandle {
    pub const INVALID: SessionHandle = SessionHandle(0);

    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub u64);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle of a secret-key object. Resolved by label, never created by the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub ObjectHandle);

impl KeyHandle {
    pub fn object(&self) -> ObjectHandle {
        self.0
    }
}

impl fmt::Display for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObjectClass {
    SecretKey,
    Data,
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectClass::SecretKey => f.write_str("secret key"),
            ObjectClass::Data => f.write_str("data"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    Aes,
    GenericSecret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribute {
    Class(ObjectClass),
    Label(Vec<u8>),
    Value(Vec<u8>),
    Token(bool),
    Private(bool),
    KeyType(KeyType),
    Encrypt(bool),
    Decrypt(bool),
    Sensitive(bool),
}

impl Attribute {
    pub fn attribute_type(&self) -> AttributeType {
        match self {
            Attribute::Class(_) => AttributeType::Class,
            Attribute::Label(_) => AttributeType::Label,
            Attribute::Value(_) => AttributeType::Value,
            Attribute::Token(_) => AttributeType::Token,
            Attribute::Private(_) => AttributeType::Private,
            Attribute::KeyType(_) => AttributeType::KeyType,
            Attribute::Encrypt(_) => AttributeType::Encrypt,
            Attribute::Decrypt(_) => AttributeType::Decrypt,
            Attribute::Sensitive(_) => AttributeType::Sensitive,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeType {
    Class,
    Label,
    Value,
    Token,
    Private,
    KeyType,
    Encrypt,
    Decrypt,
    Sensitive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// AES in CBC mode with PKCS#7 padding.
    AesCbcPad { iv: [u8; AES_BLOCK_LEN] },
}

/// Return-value taxonomy of a secure element.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("runtime not initialized")]
    NotInitialized,
    #[error("runtime already initialized")]
    AlreadyInitialized,
    #[error("slot {0} is not valid")]
    SlotIdInvalid(SlotId),
    #[error("device error: {0}")]
    DeviceError(String),
    #[error("session handle invalid")]
    SessionHandleInvalid,
    #[error("incorrect pin")]
    PinIncorrect,
    #[error("pin has an invalid format")]
    PinInvalid,
    #[error("pin length out of range")]
    PinLenRange,
    #[error("pin locked")]
    PinLocked,
    #[error("user already logged in")]
    UserAlreadyLoggedIn,
    #[error("user not logged in")]
    UserNotLoggedIn,
    #[error("object handle invalid")]
    ObjectHandleInvalid,
    #[error("key handle invalid")]
    KeyHandleInvalid,
    #[error("key type inconsistent with mechanism")]
    KeyTypeInconsistent,
    #[error("key size out of range")]
    KeySizeRange,
    #[error("key function not permitted")]
    KeyFunctionNotPermitted,
    #[error("mechanism invalid")]
    MechanismInvalid,
    #[error("another operation is already active")]
    OperationActive,
    #[error("operation not initialized")]
    OperationNotInitialized,
    #[error("buffer too small, {required} bytes required")]
    BufferTooSmall { required: usize },
    #[error("encrypted data invalid")]
    EncryptedDataInvalid,
    #[error("encrypted data length out of range")]
    EncryptedDataLenRange,
    #[error("attribute is sensitive")]
    AttributeSensitive,
    #[error("attribute type invalid for object")]
    AttributeTypeInvalid,
    #[error("template incomplete")]
    TemplateIncomplete,
    #[error("template inconsistent")]
    TemplateInconsistent,
    #[error("device memory exhausted")]
    DeviceMemory,
    #[error("{0}")]
    Backend(String),
}

pub type TokenResult<T> = std::result::Result<T, TokenError>;

/// The capability set the envelope workflow consumes from a secure element.
pub trait Token {
    fn initialize(&self) -> TokenResult<()>;
    fn finalize(&self) -> TokenResult<()>;

    fn open_session(&self, slot: SlotId) -> TokenResult<SessionHandle>;
    fn close_session(&self, session: SessionHandle) -> TokenResult<()>;
    fn login(&self, session: SessionHandle, pin: &[u8]) -> TokenResult<()>;
    fn logout(&self, session: SessionHandle) -> TokenResult<()>;

    fn find_objects_init(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<()>;
    /// Returns at most `max` further matches; an empty vector ends the search.
    fn find_objects(&self, session: SessionHandle, max: usize) -> TokenResult<Vec<ObjectHandle>>;
    fn find_objects_final(&self, session: SessionHandle) -> TokenResult<()>;

    fn get_attribute_value(
        &self,
        session: SessionHandle,
        object: ObjectHandle,
        attribute: AttributeType,
        out: Option<&mut [u8]>,
    ) -> TokenResult<usize>;
    fn create_object(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<ObjectHandle>;
    fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> TokenResult<()>;

    fn encrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()>;
    fn encrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize>;
    fn decrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()>;
    fn decrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize>;
}

macro_rules! forward_token {
    ($($ty:ty),*) => {$(
        impl<T> Token for $ty
        where
            T: Token + ?Sized,
        {
            fn initialize(&self) -> TokenResult<()> {
                (**self).initialize()
            }
            fn finalize(&self) -> TokenResult<()> {
                (**self).finalize()
            }
            fn open_session(&self, slot: SlotId) -> TokenResult<SessionHandle> {
                (**self).open_session(slot)
            }
            fn close_session(&self, session: SessionHandle) -> TokenResult<()> {
                (**self).close_session(session)
            }
            fn login(&self, session: SessionHandle, pin: &[u8]) -> TokenResult<()> {
                (**self).login(session, pin)
            }
            fn logout(&self, session: SessionHandle) -> TokenResult<()> {
                (**self).logout(session)
            }
            fn find_objects_init(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<()> {
                (**self).find_objects_init(session, template)
            }
            fn find_objects(&self, session: SessionHandle, max: usize) -> TokenResult<Vec<ObjectHandle>> {
                (**self).find_objects(session, max)
            }
            fn find_objects_final(&self, session: SessionHandle) -> TokenResult<()> {
                (**self).find_objects_final(session)
            }
            fn get_attribute_value(
                &self,
                session: SessionHandle,
                object: ObjectHandle,
                attribute: AttributeType,
                out: Option<&mut [u8]>,
            ) -> TokenResult<usize> {
                (**self).get_attribute_value(session, object, attribute, out)
            }
            fn create_object(&self, session: SessionHandle, template: &[Attribute]) -> TokenResult<ObjectHandle> {
                (**self).create_object(session, template)
            }
            fn destroy_object(&self, session: SessionHandle, object: ObjectHandle) -> TokenResult<()> {
                (**self).destroy_object(session, object)
            }
            fn encrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()> {
                (**self).encrypt_init(session, mechanism, key)
            }
            fn encrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize> {
                (**self).encrypt(session, data, out)
            }
            fn decrypt_init(&self, session: SessionHandle, mechanism: &Mechanism, key: KeyHandle) -> TokenResult<()> {
                (**self).decrypt_init(session, mechanism, key)
            }
            fn decrypt(&self, session: SessionHandle, data: &[u8], out: Option<&mut [u8]>) -> TokenResult<usize> {
                (**self).decrypt(session, data, out)
            }
        }
    )*};
}

forward_token!(&T, Arc<T>, Box<T>);
