//! Registry credentials.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

/// Username and password presented to a registry.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Username.
    pub username: String,
    /// Password or token.
    pub password: String,
}

impl Credentials {
    /// Create credentials.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    /// True if no username was supplied.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty()
    }

    /// Value for an `Authorization: Basic` header.
    #[must_use]
    pub fn basic_auth(&self) -> String {
        let pair = format!("{}:{}", self.username, self.password);
        format!("Basic {}", BASE64.encode(pair.as_bytes()))
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
