//! The store-and-verify workflow.
//!
//! `Start → Connected → Authenticated → KekLocated → PlaintextLoaded → Wrapped
//! → Stored → Retrieved → Unwrapped → Verified → Closed`
//!
//! Any failing transition skips the remaining ones. The session and runtime
//! are released before `run` returns, on success, mismatch and failure alike.

use crate::cipher::WrapCipher;
use crate::crypto::fingerprint;
use crate::error::{EnvelopeError, Result};
use crate::label::Label;
use crate::locator::{AmbiguousMatch, KeyLocator, DEFAULT_SEARCH_LIMIT};
use crate::object_store::OpaqueObjectStore;
use crate::session::{Credential, Runtime};
use crate::token::{KeyHandle, SlotId, Token};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Start,
    Connected,
    Authenticated,
    KekLocated,
    PlaintextLoaded,
    Wrapped,
    Stored,
    Retrieved,
    Unwrapped,
    Verified,
    Closed,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Start => "start",
            Stage::Connected => "connected",
            Stage::Authenticated => "authenticated",
            Stage::KekLocated => "kek located",
            Stage::PlaintextLoaded => "plaintext loaded",
            Stage::Wrapped => "wrapped",
            Stage::Stored => "stored",
            Stage::Retrieved => "retrieved",
            Stage::Unwrapped => "unwrapped",
            Stage::Verified => "verified",
            Stage::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub slot: SlotId,
    pub kek_label: Label,
    pub dek_label: Label,
    pub dek_file: PathBuf,
    pub search_limit: usize,
}

impl WorkflowConfig {
    pub fn new(
        slot: SlotId,
        kek_label: impl Into<Label>,
        dek_label: impl Into<Label>,
        dek_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            slot,
            kek_label: kek_label.into(),
            dek_label: dek_label.into(),
            dek_file: dek_file.into(),
            search_limit: DEFAULT_SEARCH_LIMIT,
        }
    }

    pub fn with_search_limit(mut self, limit: usize) -> Self {
        self.search_limit = limit;
        self
    }
}

/// Outcome of the byte-for-byte comparison. A mismatch is a result, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Match,
    Mismatch,
}

#[derive(Debug, Clone)]
pub struct WorkflowReport {
    pub kek: KeyHandle,
    pub plaintext_len: usize,
    /// The wrapped DEK as written to the store.
    pub ciphertext: Vec<u8>,
    pub ciphertext_sha256: String,
    pub retrieved_len: usize,
    pub replaced_existing: bool,
    pub warnings: Vec<AmbiguousMatch>,
    pub verification: Verification,
}

impl WorkflowReport {
    pub fn succeeded(&self) -> bool {
        self.verification == Verification::Match
    }
}

/// A fatal error together with the last stage reached before it.
#[derive(Debug, Error)]
#[error("workflow aborted after stage '{stage}'")]
pub struct WorkflowFailure {
    pub stage: Stage,
    #[source]
    pub error: EnvelopeError,
}

#[derive(Debug, Clone)]
pub struct EnvelopeWorkflow {
    config: WorkflowConfig,
    cipher: WrapCipher,
}

impl EnvelopeWorkflow {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            cipher: WrapCipher::default(),
        }
    }

    pub fn with_cipher(mut self, cipher: WrapCipher) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn run<T: Token>(&self, token: T, credential: &Credential) -> std::result::Result<WorkflowReport, WorkflowFailure> {
        let mut stage = Stage::Start;
        info!(slot = self.config.slot.0, "starting envelope workflow");
        let outcome = self.execute(token, credential, &mut stage);
        let reached = stage;
        advance(&mut stage, Stage::Closed);
        outcome.map_err(|error| {
            match std::error::Error::source(&error) {
                Some(cause) => warn!(stage = %reached, "workflow failed: {error}: {cause}"),
                None => warn!(stage = %reached, "workflow failed: {error}"),
            }
            WorkflowFailure { stage: reached, error }
        })
    }

    fn execute<T: Token>(&self, token: T, credential: &Credential, stage: &mut Stage) -> Result<WorkflowReport> {
        let config = &self.config;
        let runtime = Runtime::initialize(token)?;
        let mut session = runtime.open_session(config.slot)?;
        advance(stage, Stage::Connected);

        session.authenticate(credential)?;
        advance(stage, Stage::Authenticated);

        let locator = KeyLocator::new(config.search_limit);
        let mut warnings = Vec::new();
        let kek = locator.find_key(&session, &config.kek_label)?;
        warnings.extend(kek.ambiguity());
        advance(stage, Stage::KekLocated);

        let plaintext = read_dek(&config.dek_file)?;
        advance(stage, Stage::PlaintextLoaded);

        let ciphertext = self.cipher.wrap(&session, kek.value, &plaintext)?;
        advance(stage, Stage::Wrapped);

        let store = OpaqueObjectStore::new(locator);
        let put = store.put(&session, &config.dek_label, &ciphertext)?;
        warnings.extend(put.ambiguity.clone());
        advance(stage, Stage::Stored);

        let retrieved = store.get(&session, &config.dek_label)?;
        warnings.extend(retrieved.ambiguity());
        advance(stage, Stage::Retrieved);

        let unwrapped = self.cipher.unwrap(&session, kek.value, &retrieved.value)?;
        advance(stage, Stage::Unwrapped);

        let verification = if unwrapped.as_slice() == plaintext.as_slice() {
            Verification::Match
        } else {
            warn!(
                expected = plaintext.len(),
                actual = unwrapped.len(),
                "unwrapped DEK differs from the original"
            );
            Verification::Mismatch
        };
        advance(stage, Stage::Verified);

        session.close();
        runtime.finalize();

        Ok(WorkflowReport {
            kek: kek.value,
            plaintext_len: plaintext.len(),
            ciphertext_sha256: fingerprint(&ciphertext),
            ciphertext,
            retrieved_len: retrieved.value.len(),
            replaced_existing: put.replaced_existing(),
            warnings,
            verification,
        })
    }
}

fn advance(stage: &mut Stage, next: Stage) {
    debug!(from = %stage, to = %next, "transition");
    *stage = next;
    info!(stage = %next, "stage reached");
}

fn read_dek(path: &Path) -> Result<Zeroizing<Vec<u8>>> {
    let bytes = std::fs::read(path).map_err(|source| EnvelopeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = bytes.len(), "DEK loaded");
    Ok(Zeroizing::new(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{SoftToken, TokenOp};
    use std::io::Write;

    fn dek_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn failure_records_last_reached_stage() {
        let token = SoftToken::new(SlotId(0), "1234");
        let dek = dek_file(&[7u8; 32]);
        let workflow = EnvelopeWorkflow::new(WorkflowConfig::new(SlotId(0), "MasterKey1", "DEK-A", dek.path()));

        let failure = workflow.run(&token, &Credential::new("1234")).unwrap_err();
        assert_eq!(failure.stage, Stage::Authenticated);
        assert!(matches!(failure.error, EnvelopeError::NotFound { .. }));
        assert_eq!(token.calls(TokenOp::Finalize), 1);
    }

    #[test]
    fn unreadable_dek_file_is_an_io_error() {
        let token = SoftToken::new(SlotId(0), "1234").with_secret_key("MasterKey1", &[1u8; 32]);
        let dir = tempfile::tempdir().unwrap();
        let workflow = EnvelopeWorkflow::new(WorkflowConfig::new(
            SlotId(0),
            "MasterKey1",
            "DEK-A",
            dir.path().join("missing.bin"),
        ));

        let failure = workflow.run(&token, &Credential::new("1234")).unwrap_err();
        assert_eq!(failure.stage, Stage::KekLocated);
        assert!(matches!(failure.error, EnvelopeError::Io { .. }));
        assert_eq!(token.calls(TokenOp::CreateObject), 0);
        assert_eq!(token.calls(TokenOp::Logout), 1);
    }

    #[test]
    fn wrong_slot_fails_before_connecting() {
        let token = SoftToken::new(SlotId(0), "1234");
        let dek = dek_file(b"dek");
        let workflow = EnvelopeWorkflow::new(WorkflowConfig::new(SlotId(3), "MasterKey1", "DEK-A", dek.path()));

        let failure = workflow.run(&token, &Credential::new("1234")).unwrap_err();
        assert_eq!(failure.stage, Stage::Start);
        assert!(matches!(failure.error, EnvelopeError::Connection { .. }));
        assert_eq!(token.calls(TokenOp::Login), 0);
        assert!(!token.is_initialized());
    }

    #[test]
    fn custom_iv_changes_ciphertext_but_still_verifies() {
        use crate::token::Mechanism;

        let dek = dek_file(&[5u8; 32]);
        let config = WorkflowConfig::new(SlotId(0), "MasterKey1", "DEK-A", dek.path());
        let token = || SoftToken::new(SlotId(0), "1234").with_secret_key("MasterKey1", &[1u8; 32]);

        let default = EnvelopeWorkflow::new(config.clone())
            .run(token(), &Credential::new("1234"))
            .unwrap();
        let custom = EnvelopeWorkflow::new(config)
            .with_cipher(WrapCipher::new(Mechanism::AesCbcPad { iv: [0x24; 16] }))
            .run(token(), &Credential::new("1234"))
            .unwrap();

        assert!(custom.succeeded());
        assert_eq!(custom.ciphertext.len(), default.ciphertext.len());
        assert_ne!(custom.ciphertext, default.ciphertext);
    }

    #[test]
    fn empty_dek_wraps_to_one_block() {
        let token = SoftToken::new(SlotId(0), "1234").with_secret_key("MasterKey1", &[1u8; 16]);
        let dek = dek_file(b"");
        let workflow = EnvelopeWorkflow::new(WorkflowConfig::new(SlotId(0), "MasterKey1", "DEK-A", dek.path()));

        let report = workflow.run(&token, &Credential::new("1234")).unwrap();
        assert_eq!(report.plaintext_len, 0);
        assert_eq!(report.ciphertext.len(), 16);
        assert!(report.succeeded());
    }
}
