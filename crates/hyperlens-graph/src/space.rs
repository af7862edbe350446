//! Space resolution: map a space and visibility mode to a connection context.
//!
//! The resolver never touches the network. It only decides which endpoint and
//! credentials a query or mutation must use, and fails fast when the caller's
//! input (or session) cannot support the request.

use std::fmt;
use std::sync::Arc;

use hyperlens_core::config::SyncConfig;
use hyperlens_core::{SpaceId, VisibilityMode};

/// Errors from resolving a space. These are caller-input errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("No active session: sign in to access private spaces")]
    NoActiveSession,

    #[error("A space id is required for {0} queries")]
    MissingSpaceId(VisibilityMode),
}

/// Opaque reference to the session's credentials. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// The authentication/session provider, as seen by this crate.
///
/// Sign-in itself (the identity service's redirect flow) happens elsewhere;
/// only its outcome is consumed here.
pub trait SessionProvider: Send + Sync {
    fn is_authenticated(&self) -> bool;

    /// The signed-in user's private space.
    fn private_space_id(&self) -> Option<SpaceId>;

    fn auth_token(&self) -> Option<AuthToken>;
}

/// A session provider for signed-out use: public spaces only.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousSession;

impl SessionProvider for AnonymousSession {
    fn is_authenticated(&self) -> bool {
        false
    }

    fn private_space_id(&self) -> Option<SpaceId> {
        None
    }

    fn auth_token(&self) -> Option<AuthToken> {
        None
    }
}

/// Everything a transport needs to reach a space. Passed through opaquely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionContext {
    pub endpoint: String,
    pub space_id: SpaceId,
    pub mode: VisibilityMode,
    pub auth: Option<AuthToken>,
}

/// What a transport needs to list the spaces of one mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryContext {
    pub endpoint: String,
    pub mode: VisibilityMode,
    pub auth: Option<AuthToken>,
}

/// Resolves spaces against the configured endpoints and the current session.
#[derive(Clone)]
pub struct SpaceResolver {
    session: Arc<dyn SessionProvider>,
    public_endpoint: String,
    private_endpoint: String,
}

impl SpaceResolver {
    pub fn new(config: &SyncConfig, session: Arc<dyn SessionProvider>) -> Self {
        Self {
            session,
            public_endpoint: config.public_endpoint.clone(),
            private_endpoint: config.private_endpoint.clone(),
        }
    }

    /// Resolve a space for reading.
    ///
    /// Private: the space may be implicit (the session's own), but a session is
    /// required. Public: the space is mandatory; credentials are attached when
    /// a session exists.
    pub fn resolve(
        &self,
        space_id: Option<&SpaceId>,
        mode: VisibilityMode,
    ) -> Result<ConnectionContext, ResolveError> {
        let space_id = space_id.filter(|s| !s.is_empty());
        match mode {
            VisibilityMode::Private => {
                if !self.session.is_authenticated() {
                    return Err(ResolveError::NoActiveSession);
                }
                let space_id = match space_id {
                    Some(id) => id.clone(),
                    None => self
                        .session
                        .private_space_id()
                        .ok_or(ResolveError::NoActiveSession)?,
                };
                Ok(ConnectionContext {
                    endpoint: self.private_endpoint.clone(),
                    space_id,
                    mode,
                    auth: self.session.auth_token(),
                })
            }
            VisibilityMode::Public => {
                let space_id = space_id
                    .cloned()
                    .ok_or(ResolveError::MissingSpaceId(mode))?;
                let auth = if self.session.is_authenticated() {
                    self.session.auth_token()
                } else {
                    None
                };
                Ok(ConnectionContext {
                    endpoint: self.public_endpoint.clone(),
                    space_id,
                    mode,
                    auth,
                })
            }
        }
    }

    /// Resolve a space for writing: like [`resolve`](Self::resolve), but a
    /// session is required in both modes.
    pub fn resolve_for_write(
        &self,
        space_id: &SpaceId,
        mode: VisibilityMode,
    ) -> Result<ConnectionContext, ResolveError> {
        if !self.session.is_authenticated() {
            return Err(ResolveError::NoActiveSession);
        }
        self.resolve(Some(space_id), mode)
    }

    /// Resolve where to list spaces of `mode`. Private listings need a session.
    pub fn resolve_directory(
        &self,
        mode: VisibilityMode,
    ) -> Result<DirectoryContext, ResolveError> {
        let signed_in = self.session.is_authenticated();
        let endpoint = match mode {
            VisibilityMode::Private if !signed_in => return Err(ResolveError::NoActiveSession),
            VisibilityMode::Private => self.private_endpoint.clone(),
            VisibilityMode::Public => self.public_endpoint.clone(),
        };
        Ok(DirectoryContext {
            endpoint,
            mode,
            auth: if signed_in {
                self.session.auth_token()
            } else {
                None
            },
        })
    }
}
