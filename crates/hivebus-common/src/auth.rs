//! Permission checks for the Hivebus broker.
//!
//! The broker does not issue credentials; it only checks them. Callers send a
//! shared secret in the `X-API-Key` header (HTTP and WebSocket upgrade).
//!
//! # Modes
//!
//! - **Disabled**: every caller may do everything (default)
//! - **API key**: the configured key grants full access
//! - **API key + read-only key**: a second key grants read access only;
//!   mutating calls with it fail with `PermissionDenied`
//!
//! Keys are compared in constant time.
//!
//! # Example
//!
//! ```
//! use hivebus_common::auth::{Access, AuthConfig, Authorizer};
//!
//! let auth = AuthConfig::with_api_key("admin-secret").with_read_only_key("viewer");
//! assert!(auth.authorize(Some("admin-secret"), Access::Write).is_ok());
//! assert!(auth.authorize(Some("viewer"), Access::Read).is_ok());
//! assert!(auth.authorize(Some("viewer"), Access::Write).is_err());
//! assert!(auth.authorize(None, Access::Read).is_err());
//! ```

use std::fmt;

use crate::protocol::error::{BusError, Result};

/// Header carrying the caller's key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// What an operation does to bus state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Permission check contract used by the dispatcher and REST handlers.
pub trait Authorizer: Send + Sync {
    fn authorize(&self, api_key: Option<&str>, access: Access) -> Result<()>;
}

/// API key authentication settings.
#[derive(Clone, Debug, Default)]
pub struct AuthConfig {
    /// Full-access key, `None` disables authentication
    api_key: Option<String>,
    /// Optional key limited to read operations
    read_only_key: Option<String>,
}

impl AuthConfig {
    pub fn with_api_key(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            read_only_key: None,
        }
    }

    pub fn with_read_only_key(mut self, key: impl Into<String>) -> Self {
        self.read_only_key = Some(key.into());
        self
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn requires_auth(&self) -> bool {
        self.api_key.is_some()
    }

    /// Validates a full-access key. Always true when authentication is disabled.
    pub fn validate_api_key(&self, provided_key: &str) -> bool {
        match &self.api_key {
            Some(expected_key) => constant_time_eq(expected_key, provided_key),
            None => true,
        }
    }
}

impl Authorizer for AuthConfig {
    fn authorize(&self, api_key: Option<&str>, access: Access) -> Result<()> {
        if !self.requires_auth() {
            return Ok(());
        }
        let Some(provided) = api_key else {
            return Err(BusError::Unauthorized("missing X-API-Key header".into()));
        };
        if self.validate_api_key(provided) {
            return Ok(());
        }
        match &self.read_only_key {
            Some(read_key) if constant_time_eq(read_key, provided) => match access {
                Access::Read => Ok(()),
                Access::Write => Err(BusError::PermissionDenied(
                    "key is limited to read operations".into(),
                )),
            },
            _ => Err(BusError::Unauthorized("invalid API key".into())),
        }
    }
}

impl fmt::Display for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.api_key, &self.read_only_key) {
            (Some(_), Some(_)) => write!(f, "ApiKey(*****) + ReadOnly(*****)"),
            (Some(_), None) => write!(f, "ApiKey(*****)"),
            (None, _) => write!(f, "Disabled"),
        }
    }
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (byte_a, byte_b) in a.bytes().zip(b.bytes()) {
        result |= byte_a ^ byte_b;
    }

    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_config_default_is_disabled() {
        let auth = AuthConfig::default();
        assert!(!auth.requires_auth());
        assert!(auth.authorize(None, Access::Write).is_ok());
        assert!(auth.validate_api_key("anything"));
    }

    #[test]
    fn test_missing_key_is_unauthorized() {
        let auth = AuthConfig::with_api_key("secret");
        assert!(matches!(
            auth.authorize(None, Access::Read),
            Err(BusError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_wrong_key_is_unauthorized() {
        let auth = AuthConfig::with_api_key("secret").with_read_only_key("viewer");
        assert!(matches!(
            auth.authorize(Some("guess"), Access::Read),
            Err(BusError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_read_only_key_cannot_write() {
        let auth = AuthConfig::with_api_key("secret").with_read_only_key("viewer");
        assert!(auth.authorize(Some("viewer"), Access::Read).is_ok());
        assert!(matches!(
            auth.authorize(Some("viewer"), Access::Write),
            Err(BusError::PermissionDenied(_))
        ));
        assert!(auth.authorize(Some("secret"), Access::Write).is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("same-key-123", "same-key-123"));
        assert!(!constant_time_eq("key1", "key2"));
        assert!(!constant_time_eq("short", "longer"));
        assert!(constant_time_eq("", ""));
    }

    #[test]
    fn test_display_hides_keys() {
        let auth = AuthConfig::with_api_key("secret");
        assert_eq!(auth.to_string(), "ApiKey(*****)");
        assert_eq!(AuthConfig::disabled().to_string(), "Disabled");
    }
}
