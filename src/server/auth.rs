//! Client authentication for the Bolt and HTTP servers.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::ServerError;
use crate::db::config::AuthConfig;

/// Decides whether a client may open a session.
pub trait Authenticator: Send + Sync {
    /// Checks a principal/credentials pair. `None` means the client sent none.
    fn authenticate(&self, principal: Option<&str>, credentials: Option<&str>) -> Result<(), ServerError>;
}

/// Accepts every client.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _principal: Option<&str>, _credentials: Option<&str>) -> Result<(), ServerError> {
        Ok(())
    }
}

/// Accepts one configured user.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    /// Authenticator for `username`/`password`.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl Authenticator for BasicAuth {
    fn authenticate(&self, principal: Option<&str>, credentials: Option<&str>) -> Result<(), ServerError> {
        let user_ok = principal == Some(self.username.as_str());
        let pass_ok = credentials.is_some_and(|c| {
            c.len() == self.password.len()
                && c.bytes()
                    .zip(self.password.bytes())
                    .fold(0u8, |acc, (a, b)| acc | (a ^ b))
                    == 0
        });
        if user_ok && pass_ok {
            Ok(())
        } else {
            Err(ServerError::Unauthorized)
        }
    }
}

/// Authenticator for the configured credentials; allow-all when none are set.
pub fn from_config(config: &AuthConfig) -> Arc<dyn Authenticator> {
    match (&config.username, &config.password) {
        (None, None) => Arc::new(AllowAll),
        (user, pass) => Arc::new(BasicAuth::new(
            user.clone().unwrap_or_default(),
            pass.clone().unwrap_or_default(),
        )),
    }
}

/// Splits an HTTP `Authorization: Basic ...` header into user and password.
pub(crate) fn parse_basic_header(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ").or_else(|| value.strip_prefix("basic "))?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_auth_checks_both_fields() {
        let auth = BasicAuth::new("agent", "s3cret");
        assert!(auth.authenticate(Some("agent"), Some("s3cret")).is_ok());
        assert!(auth.authenticate(Some("agent"), Some("wrong")).is_err());
        assert!(auth.authenticate(Some("other"), Some("s3cret")).is_err());
        assert!(auth.authenticate(None, None).is_err());
    }

    #[test]
    fn unset_credentials_allow_everyone() {
        let auth = from_config(&AuthConfig::default());
        assert!(auth.authenticate(None, None).is_ok());
    }

    #[test]
    fn basic_header_decodes() {
        let header = format!("Basic {}", STANDARD.encode("agent:s3:cret"));
        assert_eq!(
            parse_basic_header(&header),
            Some(("agent".to_owned(), "s3:cret".to_owned()))
        );
        assert_eq!(parse_basic_header("Bearer abc"), None);
    }
}
