//! Named persistent data objects holding raw bytes.
//!
//! `put` is destroy-then-create. The two steps are separate token calls, so a
//! failure between them leaves the label absent until the next successful
//! `put`.

use crate::cipher::two_phase;
use crate::error::{EnvelopeError, Result};
use crate::label::Label;
use crate::locator::{AmbiguousMatch, KeyLocator, Located};
use crate::session::Session;
use crate::token::{Attribute, AttributeType, ObjectClass, ObjectHandle, Token};
use tracing::{debug, info, warn};

/// What a `put` found and removed before writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub handle: ObjectHandle,
    /// Objects destroyed under the label.
    pub replaced: usize,
    /// Set when more than one object carried the label beforehand.
    pub ambiguity: Option<AmbiguousMatch>,
}

impl PutOutcome {
    pub fn replaced_existing(&self) -> bool {
        self.replaced > 0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OpaqueObjectStore {
    locator: KeyLocator,
}

impl OpaqueObjectStore {
    pub fn new(locator: KeyLocator) -> Self {
        Self { locator }
    }

    /// Replaces every data object labelled `label` with one holding `value`.
    pub fn put<T: Token>(&self, session: &Session<'_, T>, label: &Label, value: &[u8]) -> Result<PutOutcome> {
        let token = session.token();
        let handle = session.handle();

        let existing = self.locator.find_all_data(session, label)?;
        let ambiguity = (existing.len() > 1).then(|| AmbiguousMatch {
            class: ObjectClass::Data,
            label: label.clone(),
            matches: existing.len(),
        });
        if let Some(ambiguity) = &ambiguity {
            warn!("{ambiguity}");
        }

        let mut replaced = 0;
        for object in &existing {
            match token.destroy_object(handle, *object) {
                Ok(()) => {
                    replaced += 1;
                    debug!(object = object.0, label = label.as_str(), "destroyed previous data object");
                }
                Err(e) => warn!(object = object.0, label = label.as_str(), "destroy failed, continuing: {e}"),
            }
        }
        if existing.is_empty() {
            debug!(label = label.as_str(), "no previous data object");
        }

        let template = [
            Attribute::Class(ObjectClass::Data),
            label.attribute(),
            Attribute::Value(value.to_vec()),
            Attribute::Token(true),
            Attribute::Private(true),
        ];
        let created = token
            .create_object(handle, &template)
            .map_err(|source| EnvelopeError::Create {
                label: label.to_string(),
                source,
            })?;
        info!(label = label.as_str(), bytes = value.len(), replaced, "data object stored");

        Ok(PutOutcome {
            handle: created,
            replaced,
            ambiguity,
        })
    }

    /// Reads back the value of the first data object labelled `label`.
    pub fn get<T: Token>(&self, session: &Session<'_, T>, label: &Label) -> Result<Located<Vec<u8>>> {
        let located = self
            .locator
            .find_data(session, label)?
            .ok_or_else(|| EnvelopeError::NotFound {
                class: ObjectClass::Data,
                label: label.to_string(),
            })?;
        let token = session.token();
        let handle = session.handle();
        let object = located.value;
        let value = two_phase(|out| token.get_attribute_value(handle, object, AttributeType::Value, out))
            .map_err(|source| EnvelopeError::Store {
                op: "read value",
                source,
            })?;
        debug!(object = object.0, bytes = value.len(), "data object read");
        Ok(located.map(|_| value))
    }
}
