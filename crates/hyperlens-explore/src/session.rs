//! A fixed session taken from configuration.

use hyperlens_core::SpaceId;
use hyperlens_graph::{AuthToken, SessionProvider};

use crate::config::ExploreConfig;

/// Session state decided once at startup. Signed in iff both a token and a
/// private space are configured.
#[derive(Debug, Clone)]
pub struct StaticSession {
    signed_in: Option<(SpaceId, AuthToken)>,
}

impl StaticSession {
    pub fn signed_in(private_space_id: impl Into<SpaceId>, token: &str) -> Self {
        Self {
            signed_in: Some((private_space_id.into(), AuthToken::new(token))),
        }
    }

    pub fn signed_out() -> Self {
        Self { signed_in: None }
    }

    pub fn from_config(config: &ExploreConfig) -> Self {
        let space = config
            .private_space_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        match (space, config.auth_token.as_deref()) {
            (Some(space), Some(token)) if !token.is_empty() => Self::signed_in(space, token),
            _ => Self::signed_out(),
        }
    }
}

impl SessionProvider for StaticSession {
    fn is_authenticated(&self) -> bool {
        self.signed_in.is_some()
    }

    fn private_space_id(&self) -> Option<SpaceId> {
        self.signed_in.as_ref().map(|(space, _)| space.clone())
    }

    fn auth_token(&self) -> Option<AuthToken> {
        self.signed_in.as_ref().map(|(_, token)| token.clone())
    }
}
