//! Per-request correlation tokens.
//!
//! Every inbound request gets 16 bytes of OS randomness, rendered as
//! unpadded URL-safe base64. The id lives in the request's extensions for
//! the duration of that request and is never returned to the client; it
//! only shows up in logs and error bodies for correlation.
use std::fmt;

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use http::Extensions;
use rand::{TryRngCore, rngs::OsRng};

/// Opaque per-request identity. The all-zero value means "unset".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestId([u8; 16]);

impl RequestId {
    /// Generate a fresh id from the OS CSPRNG.
    ///
    /// Generation failure is degraded, not fatal: the request proceeds
    /// with the zero id and the failure is logged by the caller.
    pub fn generate() -> Result<Self, rand::rand_core::OsError> {
        let mut bytes = [0u8; 16];
        OsRng.try_fill_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Whether this is the distinguished "unset" value.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 16]
    }

    /// Read the id out of a request's extensions. Returns the zero id if
    /// the request never passed through the request-id middleware.
    pub fn from_extensions(extensions: &Extensions) -> Self {
        extensions.get::<RequestId>().copied().unwrap_or_default()
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for RequestId {
    /// Renders as 22 characters of unpadded URL-safe base64, or the empty
    /// string for the zero id.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return Ok(());
        }
        f.write_str(&URL_SAFE_NO_PAD.encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_id_renders_empty() {
        let id = RequestId::default();
        assert!(id.is_zero());
        assert_eq!(id.to_string(), "");
    }

    #[test]
    fn generated_id_is_nonzero_and_22_chars() {
        let id = RequestId::generate().unwrap();
        assert!(!id.is_zero());
        // 16 bytes -> ceil(16 * 8 / 6) = 22 chars without padding
        assert_eq!(id.to_string().len(), 22);
    }

    #[test]
    fn display_is_url_safe() {
        let id = RequestId::from_bytes([0xff; 16]);
        let rendered = id.to_string();
        assert!(!rendered.contains('+'));
        assert!(!rendered.contains('/'));
        assert!(!rendered.contains('='));
    }

    #[test]
    fn missing_extension_yields_zero() {
        let extensions = Extensions::new();
        assert!(RequestId::from_extensions(&extensions).is_zero());
    }

    #[test]
    fn extension_roundtrip() {
        let id = RequestId::generate().unwrap();
        let mut extensions = Extensions::new();
        extensions.insert(id);
        assert_eq!(RequestId::from_extensions(&extensions), id);
    }
}
