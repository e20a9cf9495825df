use reqwest::header::{HeaderValue, InvalidHeaderValue};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Registry token (Basic `user:pass` base64, or a Bearer JWT) that never shows
/// up in logs: Debug/Display print `<REDACTED, length N>`.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(s: impl Into<String>) -> Self {
        SecretString(s.into())
    }

    pub fn expose_secret(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// `Authorization` header value for the given scheme, flagged sensitive so
    /// that reqwest/hyper debug output omits it.
    pub fn authorization(&self, scheme: &str) -> Result<HeaderValue, InvalidHeaderValue> {
        let mut value = HeaderValue::from_str(&format!("{} {}", scheme, self.0))?;
        value.set_sensitive(true);
        Ok(value)
    }

    fn fmt_redacted_secret(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<REDACTED, length {}>", self.0.len())
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_redacted_secret(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_is_redacted() {
        let secret = SecretString::new("dXNlcjpwYXNz");
        assert_eq!(format!("{}", secret), "<REDACTED, length 12>");
        assert_eq!(format!("{:?}", secret), "<REDACTED, length 12>");
        assert_eq!(secret.expose_secret(), "dXNlcjpwYXNz");
    }

    #[test]
    fn test_authorization_header_is_sensitive() {
        let header = SecretString::new("abc").authorization("Basic").unwrap();
        assert!(header.is_sensitive());
        assert_eq!(header.to_str().unwrap(), "Basic abc");
    }
}
