//! In-memory credential holder.
//!
//! Credentials are never serialised: the type has no serde impls and its
//! `Debug` output masks the password. Both fields are wiped when the value
//! is dropped, so handing a `Credentials` to the engine and letting it go
//! out of scope is enough to clear it from process memory.

use std::fmt;
use zeroize::{Zeroize, Zeroizing};

pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Borrow the secret for the duration of a hand-off.
    pub fn expose_password(&self) -> &str {
        &self.password
    }

    pub fn is_empty(&self) -> bool {
        self.username.trim().is_empty() || self.password.is_empty()
    }

    /// Render a management-protocol reply line for `realm`, e.g.
    /// `password "Auth" s3cret`. The buffer is wiped on drop.
    pub fn reply_line(&self, field: CredentialField, realm: &str) -> Zeroizing<String> {
        let value = match field {
            CredentialField::Username => &self.username,
            CredentialField::Password => &self.password,
        };
        Zeroizing::new(format!(
            "{} \"{}\" {}",
            field.keyword(),
            escape_mgmt(realm),
            quote_mgmt(value)
        ))
    }
}

/// Which half of the credential pair a reply line carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    Username,
    Password,
}

impl CredentialField {
    pub fn keyword(self) -> &'static str {
        match self {
            CredentialField::Username => "username",
            CredentialField::Password => "password",
        }
    }
}

impl Zeroize for Credentials {
    fn zeroize(&mut self) {
        self.username.zeroize();
        self.password.zeroize();
    }
}

impl Drop for Credentials {
    fn drop(&mut self) {
        self.zeroize();
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

fn escape_mgmt(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Values containing whitespace or quotes must be double-quoted for the
/// management parser.
fn quote_mgmt(s: &str) -> String {
    if s.is_empty() || s.chars().any(|c| c.is_whitespace() || c == '"' || c == '\\') {
        format!("\"{}\"", escape_mgmt(s))
    } else {
        s.to_string()
    }
}
