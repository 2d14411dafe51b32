//! Runtime and session lifecycle.
//!
//! [`Runtime`] owns the process-wide initialization of a token and tears it
//! down exactly once. [`Session`] borrows the runtime, so it is always
//! released first. Both release paths run from `Drop` as well as from the
//! explicit `close`/`finalize` calls, and never propagate failures.

use crate::error::{EnvelopeError, Result};
use crate::token::{SessionHandle, SlotId, Token, TokenError};
use std::fmt;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Secret used to authenticate a session (the user PIN).
#[derive(Clone)]
pub struct Credential(Zeroizing<String>);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(Zeroizing::new(secret.into()))
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

pub struct Runtime<T: Token> {
    token: T,
    finalized: bool,
}

impl<T: Token> Runtime<T> {
    pub fn initialize(token: T) -> Result<Self> {
        token.initialize().map_err(EnvelopeError::Runtime)?;
        debug!("secure element runtime initialized");
        Ok(Self {
            token,
            finalized: false,
        })
    }

    /// Opens a read/write session on `slot`.
    pub fn open_session(&self, slot: SlotId) -> Result<Session<'_, T>> {
        let handle = self
            .token
            .open_session(slot)
            .map_err(|source| EnvelopeError::Connection { slot, source })?;
        debug!(slot = slot.0, session = handle.0, "session opened");
        Ok(Session {
            token: &self.token,
            handle,
            slot,
            authenticated: false,
            owns_login: false,
        })
    }

    pub fn finalize(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        match self.token.finalize() {
            Ok(()) => debug!("secure element runtime finalized"),
            Err(e) => warn!("runtime teardown failed: {e}"),
        }
    }
}

impl<T: Token> Drop for Runtime<T> {
    fn drop(&mut self) {
        self.teardown();
    }
}

pub struct Session<'rt, T: Token> {
    token: &'rt T,
    handle: SessionHandle,
    slot: SlotId,
    authenticated: bool,
    /// False when the token was already logged in by someone else.
    owns_login: bool,
}

impl<'rt, T: Token> Session<'rt, T> {
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn token(&self) -> &'rt T {
        self.token
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn authenticate(&mut self, credential: &Credential) -> Result<()> {
        match self.token.login(self.handle, credential.as_bytes()) {
            Ok(()) => self.owns_login = true,
            Err(TokenError::UserAlreadyLoggedIn) => {
                debug!(session = self.handle.0, "user already logged in on this token");
            }
            Err(
                e @ (TokenError::PinIncorrect
                | TokenError::PinInvalid
                | TokenError::PinLenRange
                | TokenError::PinLocked),
            ) => return Err(EnvelopeError::Auth(e)),
            Err(source) => {
                return Err(EnvelopeError::Connection {
                    slot: self.slot,
                    source,
                })
            }
        }
        self.authenticated = true;
        info!(slot = self.slot.0, "login successful");
        Ok(())
    }

    /// Logs out and closes the session. Failures are logged, never returned.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.handle.is_valid() {
            return;
        }
        if self.owns_login {
            if let Err(e) = self.token.logout(self.handle) {
                warn!(session = self.handle.0, "logout failed: {e}");
            }
            self.owns_login = false;
        }
        self.authenticated = false;
        if let Err(e) = self.token.close_session(self.handle) {
            warn!(session = self.handle.0, "close session failed: {e}");
        }
        debug!(session = self.handle.0, "session released");
        self.handle = SessionHandle::INVALID;
    }
}

impl<T: Token> Drop for Session<'_, T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::{SoftToken, TokenOp};

    fn token() -> SoftToken {
        SoftToken::new(SlotId(0), "1234")
    }

    #[test]
    fn invalid_slot_is_a_connection_error() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let err = runtime.open_session(SlotId(9)).err().unwrap();
        assert!(matches!(err, EnvelopeError::Connection { slot: SlotId(9), .. }));
    }

    #[test]
    fn rejected_pin_is_an_auth_error() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let mut session = runtime.open_session(SlotId(0)).unwrap();
        let err = session.authenticate(&Credential::new("0000")).unwrap_err();
        assert!(err.is_auth());
        assert!(!session.is_authenticated());
    }

    #[test]
    fn drop_logs_out_and_closes_once() {
        let token = token();
        {
            let runtime = Runtime::initialize(&token).unwrap();
            let mut session = runtime.open_session(SlotId(0)).unwrap();
            session.authenticate(&Credential::new("1234")).unwrap();
        }
        assert_eq!(token.calls(TokenOp::Logout), 1);
        assert_eq!(token.calls(TokenOp::CloseSession), 1);
        assert_eq!(token.calls(TokenOp::Finalize), 1);
        assert!(!token.is_initialized());
    }

    #[test]
    fn unauthenticated_session_skips_logout() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let session = runtime.open_session(SlotId(0)).unwrap();
        session.close();
        runtime.finalize();
        assert_eq!(token.calls(TokenOp::Logout), 0);
        assert_eq!(token.calls(TokenOp::CloseSession), 1);
        assert_eq!(token.open_session_count(), 0);
    }

    #[test]
    fn cleanup_failures_are_swallowed() {
        let token = token();
        token.inject_fault(TokenOp::Logout, TokenError::DeviceError("gone".into()));
        token.inject_fault(TokenOp::CloseSession, TokenError::DeviceError("gone".into()));
        {
            let runtime = Runtime::initialize(&token).unwrap();
            let mut session = runtime.open_session(SlotId(0)).unwrap();
            session.authenticate(&Credential::new("1234")).unwrap();
        }
        assert_eq!(token.calls(TokenOp::Finalize), 1);
    }

    #[test]
    fn second_login_on_token_counts_as_authenticated() {
        let token = token();
        let runtime = Runtime::initialize(&token).unwrap();
        let mut first = runtime.open_session(SlotId(0)).unwrap();
        first.authenticate(&Credential::new("1234")).unwrap();
        let mut second = runtime.open_session(SlotId(0)).unwrap();
        second.authenticate(&Credential::new("1234")).unwrap();
        assert!(second.is_authenticated());

        // the second session does not own the login, so closing it keeps the first one logged in
        second.close();
        assert_eq!(token.calls(TokenOp::Logout), 0);
        assert!(token.is_logged_in());
        assert!(first.is_authenticated());

        first.close();
        assert_eq!(token.calls(TokenOp::Logout), 1);
        assert!(!token.is_logged_in());
    }

    #[test]
    fn credential_debug_is_redacted() {
        assert_eq!(format!("{:?}", Credential::new("1234")), "Credential(<redacted>)");
    }
}
