//! End-to-end runs of the envelope workflow against the soft token.
//!
//! Tests cover:
//!  1. Store and verify a 32-byte DEK
//!  2. Tampered ciphertext fails the padding check
//!  3. Corruption that keeps valid padding is a mismatch, not an error
//!  4. Rejected PIN and missing KEK
//!  5. Ambiguous KEK label
//!  6. Overwrite of an existing wrapped DEK
//!  7. Encrypted token file survives across runs

use dekwrap_core::crypto::KdfParams;
use dekwrap_core::token::{Attribute, KeyType, ObjectClass, Token, TokenOp};
use dekwrap_core::{
    Credential, EnvelopeError, EnvelopeWorkflow, Runtime, SlotId, SoftToken, Stage, TokenError,
    Verification, WorkflowConfig,
};
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::{tempdir, TempDir};

const PIN: &str = "1234";

fn random_dek(dir: &TempDir) -> (PathBuf, Vec<u8>) {
    let mut dek = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut dek);
    let path = dir.path().join("dek.bin");
    fs::write(&path, &dek).unwrap();
    (path, dek)
}

fn provisioned() -> SoftToken {
    SoftToken::new(SlotId(0), PIN).with_secret_key("MasterKey1", &[0x5a; 32])
}

fn workflow(dek_file: &Path) -> EnvelopeWorkflow {
    EnvelopeWorkflow::new(WorkflowConfig::new(SlotId(0), "MasterKey1", "DEK-A", dek_file))
}

fn assert_released_once(token: &SoftToken, logged_in: bool) {
    assert_eq!(token.calls(TokenOp::Logout), usize::from(logged_in));
    assert_eq!(token.calls(TokenOp::CloseSession), 1);
    assert_eq!(token.calls(TokenOp::Finalize), 1);
    assert_eq!(token.open_session_count(), 0);
    assert!(!token.is_initialized());
}

// ─── Test 1: store and verify ───────────────────────────────────────────────

#[test]
fn test_store_and_verify_32_byte_dek() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned();

    let report = workflow(&dek_file).run(&token, &Credential::new(PIN)).unwrap();

    assert_eq!(report.plaintext_len, 32);
    assert_eq!(report.ciphertext.len(), 48);
    assert_eq!(report.retrieved_len, 48);
    assert_eq!(report.verification, Verification::Match);
    assert!(report.succeeded());
    assert!(report.warnings.is_empty());
    assert!(!report.replaced_existing);
    assert_eq!(report.ciphertext_sha256.len(), 64);
    assert_eq!(token.count_objects(ObjectClass::Data, "DEK-A"), 1);
    assert_released_once(&token, true);
}

// ─── Test 2: tamper detection ───────────────────────────────────────────────

#[test]
fn test_flipped_padding_bit_is_an_integrity_error() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned();
    // last byte of the second ciphertext block feeds the padding byte
    token.corrupt_value_reads(31, 0x01);

    let failure = workflow(&dek_file)
        .run(&token, &Credential::new(PIN))
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Retrieved);
    assert!(matches!(
        failure.error,
        EnvelopeError::Integrity(TokenError::EncryptedDataInvalid)
    ));
    assert_released_once(&token, true);
}

// ─── Test 3: mismatch ───────────────────────────────────────────────────────

#[test]
fn test_corruption_with_valid_padding_is_a_mismatch() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned();
    token.corrupt_value_reads(0, 0x80);

    let report = workflow(&dek_file).run(&token, &Credential::new(PIN)).unwrap();

    assert_eq!(report.verification, Verification::Mismatch);
    assert!(!report.succeeded());
    assert_eq!(report.retrieved_len, 48);
    assert_released_once(&token, true);
}

// ─── Test 4: fatal lookups and credentials ──────────────────────────────────

#[test]
fn test_rejected_pin_is_distinct_from_connection_failure() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned();

    let failure = workflow(&dek_file)
        .run(&token, &Credential::new("9999"))
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Connected);
    assert!(failure.error.is_auth());
    assert_eq!(token.calls(TokenOp::FindObjectsInit), 0);
    assert_released_once(&token, false);
}

#[test]
fn test_missing_kek_aborts_before_wrapping() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = SoftToken::new(SlotId(0), PIN).with_secret_key("OtherKey", &[1u8; 32]);

    let failure = workflow(&dek_file)
        .run(&token, &Credential::new(PIN))
        .unwrap_err();

    assert!(matches!(
        failure.error,
        EnvelopeError::NotFound {
            class: ObjectClass::SecretKey,
            ..
        }
    ));
    assert_eq!(token.calls(TokenOp::EncryptInit), 0);
    assert_eq!(token.calls(TokenOp::FindObjectsFinal), token.calls(TokenOp::FindObjectsInit));
    assert_released_once(&token, true);
}

#[test]
fn test_create_rejection_is_a_create_error() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned().with_capacity(1);

    let failure = workflow(&dek_file)
        .run(&token, &Credential::new(PIN))
        .unwrap_err();

    assert_eq!(failure.stage, Stage::Wrapped);
    assert!(matches!(failure.error, EnvelopeError::Create { .. }));
    assert_released_once(&token, true);
}

// ─── Test 5: ambiguity ──────────────────────────────────────────────────────

#[test]
fn test_duplicate_kek_label_is_a_warning() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned().with_secret_key("MasterKey1", &[0x6b; 32]);

    let report = workflow(&dek_file).run(&token, &Credential::new(PIN)).unwrap();

    assert!(report.succeeded());
    assert_eq!(report.warnings.len(), 1);
    assert_eq!(report.warnings[0].class, ObjectClass::SecretKey);
    assert_eq!(report.warnings[0].matches, 2);
}

// ─── Test 6: overwrite ──────────────────────────────────────────────────────

#[test]
fn test_rerun_replaces_previous_wrapped_dek() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned().with_data_object("DEK-A", b"stale blob from an older run");

    let report = workflow(&dek_file).run(&token, &Credential::new(PIN)).unwrap();

    assert!(report.replaced_existing);
    assert!(report.succeeded());
    assert_eq!(token.count_objects(ObjectClass::Data, "DEK-A"), 1);
}

#[test]
fn test_same_dek_wraps_to_same_ciphertext() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token = provisioned();

    let first = workflow(&dek_file).run(&token, &Credential::new(PIN)).unwrap();
    let second = workflow(&dek_file).run(&token, &Credential::new(PIN)).unwrap();

    assert_eq!(first.ciphertext, second.ciphertext);
    assert!(second.replaced_existing);
}

// ─── Test 7: token file ─────────────────────────────────────────────────────

fn provision_file(path: &Path) {
    let token = SoftToken::create_file(path, SlotId(0), PIN, KdfParams::with_memory_cost(64)).unwrap();
    let runtime = Runtime::initialize(&token).unwrap();
    let mut session = runtime.open_session(SlotId(0)).unwrap();
    session.authenticate(&Credential::new(PIN)).unwrap();
    session
        .token()
        .create_object(
            session.handle(),
            &[
                Attribute::Class(ObjectClass::SecretKey),
                Attribute::Label(b"MasterKey1".to_vec()),
                Attribute::Value(vec![0x42; 32]),
                Attribute::KeyType(KeyType::Aes),
                Attribute::Token(true),
                Attribute::Private(true),
                Attribute::Sensitive(true),
            ],
        )
        .unwrap();
}

#[test]
fn test_token_file_keeps_kek_and_wrapped_dek() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token_path = dir.path().join("token.dtk");
    provision_file(&token_path);

    let first = workflow(&dek_file)
        .run(SoftToken::open_file(&token_path).unwrap(), &Credential::new(PIN))
        .unwrap();
    assert!(first.succeeded());
    assert!(!first.replaced_existing);

    let second = workflow(&dek_file)
        .run(SoftToken::open_file(&token_path).unwrap(), &Credential::new(PIN))
        .unwrap();
    assert!(second.replaced_existing);
    assert_eq!(first.ciphertext, second.ciphertext);
}

#[test]
fn test_token_file_rejects_wrong_pin() {
    let dir = tempdir().unwrap();
    let (dek_file, _) = random_dek(&dir);
    let token_path = dir.path().join("token.dtk");
    provision_file(&token_path);

    let failure = workflow(&dek_file)
        .run(SoftToken::open_file(&token_path).unwrap(), &Credential::new("0000"))
        .unwrap_err();
    assert!(matches!(failure.error, EnvelopeError::Auth(TokenError::PinIncorrect)));
}
