//! Envelope encryption of a DEK under a KEK held by a secure element.

pub mod cipher;
pub mod crypto;
pub mod error;
pub mod label;
pub mod locator;
pub mod object_store;
pub mod paths;
pub mod session;
pub mod settings;
pub mod token;
pub mod workflow;

pub use cipher::WrapCipher;
pub use error::{CryptoOp, EnvelopeError, Result};
pub use label::Label;
pub use locator::{AmbiguousMatch, KeyLocator, Located};
pub use object_store::{OpaqueObjectStore, PutOutcome};
pub use session::{Credential, Runtime, Session};
pub use settings::{Backend, Settings};
pub use token::{SlotId, SoftToken, Token, TokenError};
pub use workflow::{EnvelopeWorkflow, Stage, Verification, WorkflowConfig, WorkflowFailure, WorkflowReport};
