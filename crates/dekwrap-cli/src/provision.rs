use anyhow::{Context, Result};
use dekwrap_core::crypto::KdfParams;
use dekwrap_core::token::{Attribute, KeyType, ObjectClass};
use dekwrap_core::{Credential, Label, Runtime, SlotId, SoftToken, Token};
use rand::rngs::OsRng;
use rand::RngCore;
use std::path::Path;
use tracing::{info, warn};
use zeroize::Zeroizing;

const KEK_LEN: usize = 32;

pub fn init_soft_token(
    path: &Path,
    slot: SlotId,
    pin: &str,
    kek_label: Option<&str>,
    kdf: KdfParams,
) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let token = SoftToken::create_file(path, slot, pin, kdf)?;
    info!(path = %path.display(), slot = slot.0, "token file created");
    if let Some(label) = kek_label {
        discard_on_error(path, provision_kek(&token, slot, pin, &Label::from(label)))?;
        println!("Generated AES-256 KEK '{label}'");
    }
    Ok(())
}

/// Removes a half-provisioned token file so a later `init-soft-token` can recreate it.
fn discard_on_error<T>(path: &Path, result: Result<T>) -> Result<T> {
    if result.is_err() {
        match std::fs::remove_file(path) {
            Ok(()) => warn!(path = %path.display(), "removed incomplete token file"),
            Err(e) => warn!(path = %path.display(), "cannot remove incomplete token file: {e}"),
        }
    }
    result
}

fn provision_kek<T: Token>(token: T, slot: SlotId, pin: &str, label: &Label) -> Result<()> {
    let runtime = Runtime::initialize(token)?;
    let mut session = runtime.open_session(slot)?;
    session.authenticate(&Credential::new(pin))?;

    let mut key = Zeroizing::new(vec![0u8; KEK_LEN]);
    OsRng.fill_bytes(&mut key);
    let template = [
        Attribute::Class(ObjectClass::SecretKey),
        Attribute::KeyType(KeyType::Aes),
        Attribute::Label(label.as_bytes().to_vec()),
        Attribute::Value(key.to_vec()),
        Attribute::Token(true),
        Attribute::Private(true),
        Attribute::Sensitive(true),
        Attribute::Encrypt(true),
        Attribute::Decrypt(true),
    ];
    let handle = session
        .token()
        .create_object(session.handle(), &template)
        .with_context(|| format!("cannot create KEK {label}"))?;
    info!(handle = handle.0, label = label.as_str(), "KEK provisioned");

    session.close();
    runtime.finalize();
    Ok(())
}
