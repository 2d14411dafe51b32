//! Lookup, overwrite and wrap properties over a live session.

use dekwrap_core::token::{ObjectClass, TokenOp, AES_BLOCK_LEN};
use dekwrap_core::{
    Credential, KeyLocator, Label, OpaqueObjectStore, Runtime, SlotId, SoftToken, WrapCipher,
};

fn token() -> SoftToken {
    SoftToken::new(SlotId(0), "1234")
        .with_secret_key("MasterKey1", &[7u8; 32])
        .with_secret_key("Shared", &[8u8; 16])
        .with_secret_key("Shared", &[9u8; 16])
}

#[test]
fn test_overwrite_leaves_only_latest_value() {
    let token = token();
    let runtime = Runtime::initialize(&token).unwrap();
    let mut session = runtime.open_session(SlotId(0)).unwrap();
    session.authenticate(&Credential::new("1234")).unwrap();
    let store = OpaqueObjectStore::default();
    let label = Label::from("DEK-A");

    store.put(&session, &label, b"first value, longer").unwrap();
    store.put(&session, &label, b"v2").unwrap();

    assert_eq!(store.get(&session, &label).unwrap().value, b"v2");
    assert_eq!(token.count_objects(ObjectClass::Data, "DEK-A"), 1);
}

#[test]
fn test_ambiguous_lookup_is_stable_within_session() {
    let token = token();
    let runtime = Runtime::initialize(&token).unwrap();
    let mut session = runtime.open_session(SlotId(0)).unwrap();
    session.authenticate(&Credential::new("1234")).unwrap();
    let locator = KeyLocator::default();

    let picks: Vec<_> = (0..3)
        .map(|_| locator.find_key(&session, &Label::from("Shared")).unwrap())
        .collect();
    assert!(picks.iter().all(|p| p.value == picks[0].value));
    assert!(picks.iter().all(|p| p.ambiguity().map(|a| a.matches) == Some(2)));
    // every search was finalized
    assert_eq!(token.calls(TokenOp::FindObjectsFinal), 3);
}

#[test]
fn test_wrap_length_and_roundtrip_for_every_key_size() {
    let token = token();
    let runtime = Runtime::initialize(&token).unwrap();
    let mut session = runtime.open_session(SlotId(0)).unwrap();
    session.authenticate(&Credential::new("1234")).unwrap();
    let locator = KeyLocator::default();
    let cipher = WrapCipher::default();

    for label in ["MasterKey1", "Shared"] {
        let key = locator.find_key(&session, &Label::from(label)).unwrap().value;
        for len in [0usize, 5, 16, 31, 32, 33, 64] {
            let plaintext = vec![0xa5u8; len];
            let wrapped = cipher.wrap(&session, key, &plaintext).unwrap();
            assert!(!wrapped.is_empty());
            assert_eq!(wrapped.len() % AES_BLOCK_LEN, 0);
            assert!(wrapped.len() > len);
            assert!(wrapped.len() - len <= AES_BLOCK_LEN);
            assert_eq!(cipher.unwrap(&session, key, &wrapped).unwrap().as_slice(), &plaintext[..]);
        }
    }
}
