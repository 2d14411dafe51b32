//! Label lookup of keys and data objects.
//!
//! Labels are not unique. A lookup uses the first handle the token returns
//! and reports how many matched so the caller can surface the ambiguity.

use crate::error::{EnvelopeError, Result};
use crate::label::Label;
use crate::session::Session;
use crate::token::{Attribute, KeyHandle, ObjectClass, ObjectHandle, SessionHandle, Token};
use tracing::{debug, warn};

pub const DEFAULT_SEARCH_LIMIT: usize = 10;

/// More than one object shared a class and label; the first one was used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbiguousMatch {
    pub class: ObjectClass,
    pub label: Label,
    pub matches: usize,
}

impl std::fmt::Display for AmbiguousMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} objects labelled {:?}; using the first one",
            self.matches, self.class, self.label.as_str()
        )
    }
}

/// A lookup result together with the number of objects that matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located<T> {
    pub value: T,
    pub class: ObjectClass,
    pub label: Label,
    pub matches: usize,
}

impl<T> Located<T> {
    pub fn ambiguity(&self) -> Option<AmbiguousMatch> {
        (self.matches > 1).then(|| AmbiguousMatch {
            class: self.class,
            label: self.label.clone(),
            matches: self.matches,
        })
    }

    pub(crate) fn map<U>(self, f: impl FnOnce(T) -> U) -> Located<U> {
        Located {
            value: f(self.value),
            class: self.class,
            label: self.label,
            matches: self.matches,
        }
    }
}

/// Ends the search on every exit path so the session never stays mid-search.
struct SearchGuard<'a, T: Token> {
    token: &'a T,
    session: SessionHandle,
}

impl<T: Token> Drop for SearchGuard<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.token.find_objects_final(self.session) {
            warn!(session = self.session.0, "find final failed: {e}");
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct KeyLocator {
    limit: usize,
}

impl Default for KeyLocator {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_LIMIT)
    }
}

impl KeyLocator {
    /// `limit` bounds the number of handles fetched per lookup (at least 1).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    /// Resolves a secret key by label. A missing key is an error.
    pub fn find_key<T: Token>(&self, session: &Session<'_, T>, label: &Label) -> Result<Located<KeyHandle>> {
        self.find_first(session, ObjectClass::SecretKey, label)?
            .map(|located| located.map(KeyHandle))
            .ok_or_else(|| EnvelopeError::NotFound {
                class: ObjectClass::SecretKey,
                label: label.to_string(),
            })
    }

    /// Resolves a data object by label. A missing object is `None`.
    pub fn find_data<T: Token>(
        &self,
        session: &Session<'_, T>,
        label: &Label,
    ) -> Result<Option<Located<ObjectHandle>>> {
        self.find_first(session, ObjectClass::Data, label)
    }

    /// Every data object with this label, up to the search limit, in token order.
    pub fn find_all_data<T: Token>(&self, session: &Session<'_, T>, label: &Label) -> Result<Vec<ObjectHandle>> {
        self.search(session, ObjectClass::Data, label)
    }

    fn find_first<T: Token>(
        &self,
        session: &Session<'_, T>,
        class: ObjectClass,
        label: &Label,
    ) -> Result<Option<Located<ObjectHandle>>> {
        let handles = self.search(session, class, label)?;
        let Some(first) = handles.first().copied() else {
            debug!(%class, label = label.as_str(), "no match");
            return Ok(None);
        };
        let located = Located {
            value: first,
            class,
            label: label.clone(),
            matches: handles.len(),
        };
        if let Some(ambiguity) = located.ambiguity() {
            warn!("{ambiguity}");
        }
        debug!(%class, label = label.as_str(), handle = first.0, "resolved");
        Ok(Some(located))
    }

    fn search<T: Token>(&self, session: &Session<'_, T>, class: ObjectClass, label: &Label) -> Result<Vec<ObjectHandle>> {
        let token = session.token();
        let handle = session.handle();
        let template = [Attribute::Class(class), label.attribute()];
        token
            .find_objects_init(handle, &template)
            .map_err(|source| EnvelopeError::Store {
                op: "find objects init",
                source,
            })?;
        let _guard = SearchGuard {
            token,
            session: handle,
        };
        token
            .find_objects(handle, self.limit)
            .map_err(|source| EnvelopeError::Store {
                op: "find objects",
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Credential, Runtime};
    use crate::token::{SlotId, SoftToken, TokenError, TokenOp};

    fn token() -> SoftToken {
        SoftToken::new(SlotId(0), "1234")
            .with_secret_key("MasterKey1", &[1u8; 32])
            .with_secret_key("Twin", &[2u8; 32])
            .with_secret_key("Twin", &[3u8; 32])
            .with_data_object("DEK-A", b"wrapped")
    }

    #[test]
    fn missing_key_is_not_found() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let mut session = runtime.open_session(SlotId(0)).unwrap();
        session.authenticate(&Credential::new("1234")).unwrap();

        let err = KeyLocator::default()
            .find_key(&session, &Label::from("NoSuchKey"))
            .unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::NotFound {
                class: ObjectClass::SecretKey,
                ..
            }
        ));
    }

    #[test]
    fn missing_data_is_none() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let mut session = runtime.open_session(SlotId(0)).unwrap();
        session.authenticate(&Credential::new("1234")).unwrap();

        let locator = KeyLocator::default();
        assert!(locator.find_data(&session, &Label::from("DEK-B")).unwrap().is_none());
        // a key label is not a data label
        assert!(locator.find_data(&session, &Label::from("MasterKey1")).unwrap().is_none());
        assert!(locator.find_data(&session, &Label::from("DEK-A")).unwrap().is_some());
    }

    #[test]
    fn ambiguous_label_returns_stable_first_match() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let mut session = runtime.open_session(SlotId(0)).unwrap();
        session.authenticate(&Credential::new("1234")).unwrap();

        let locator = KeyLocator::default();
        let first = locator.find_key(&session, &Label::from("Twin")).unwrap();
        let second = locator.find_key(&session, &Label::from("Twin")).unwrap();
        assert_eq!(first.value, second.value);
        assert_eq!(first.value, KeyHandle(ObjectHandle(2)));
        let ambiguity = first.ambiguity().unwrap();
        assert_eq!(ambiguity.matches, 2);

        let single = locator.find_key(&session, &Label::from("MasterKey1")).unwrap();
        assert!(single.ambiguity().is_none());
    }

    #[test]
    fn search_is_finalized_after_failure() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let mut session = runtime.open_session(SlotId(0)).unwrap();
        session.authenticate(&Credential::new("1234")).unwrap();
        token.inject_fault(TokenOp::FindObjects, TokenError::DeviceError("glitch".into()));

        let locator = KeyLocator::default();
        let err = locator.find_key(&session, &Label::from("MasterKey1")).unwrap_err();
        assert!(matches!(err, EnvelopeError::Store { op: "find objects", .. }));
        assert_eq!(token.calls(TokenOp::FindObjectsFinal), 1);

        // a fresh search is not blocked by the failed one
        assert!(locator.find_key(&session, &Label::from("MasterKey1")).is_ok());
    }

    #[test]
    fn limit_bounds_returned_handles() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let mut session = runtime.open_session(SlotId(0)).unwrap();
        session.authenticate(&Credential::new("1234")).unwrap();

        let located = KeyLocator::new(1).find_key(&session, &Label::from("Twin")).unwrap();
        assert_eq!(located.matches, 1);
    }
}
