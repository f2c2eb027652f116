use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("authorization header is missing")]
    MissingHeader,

    #[error("authorization header must use the Bearer scheme")]
    BadFormat,

    #[error("bearer token is empty")]
    EmptyToken,

    #[error("bearer token is not recognized")]
    UnknownToken,
}

/// Resolves the credential carried by a request to a user id.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, authorization: Option<&str>) -> Result<String, AuthError>;
}

/// Accepts a fixed set of opaque bearer tokens loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, authorization: Option<&str>) -> Result<String, AuthError> {
        let token = bearer_token(authorization.ok_or(AuthError::MissingHeader)?)?;
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownToken)
    }
}

fn bearer_token(header: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header
        .trim_start()
        .split_once(' ')
        .ok_or(AuthError::BadFormat)?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::BadFormat);
    }

    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::EmptyToken);
    }
    Ok(token)
}
