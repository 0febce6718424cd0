//! URI validation for procedures, topics and realms.

/// Maximum URI length.
pub const MAX_URI_LENGTH: usize = 512;

/// Prefix reserved for router-owned procedures and topics.
pub const RESERVED_PREFIX: &str = "wamp.";

/// Validate a URI.
///
/// URIs are dot-separated components. Components may not be empty or
/// contain whitespace or `#`.
///
/// # Errors
///
/// Returns a message describing why the URI is invalid.
pub fn validate_uri(uri: &str) -> Result<(), &'static str> {
    if uri.is_empty() {
        return Err("URI cannot be empty");
    }
    if uri.len() > MAX_URI_LENGTH {
        return Err("URI too long");
    }
    if uri.chars().any(|c| c.is_whitespace() || c == '#') {
        return Err("URI contains invalid characters");
    }
    if uri.split('.').any(str::is_empty) {
        return Err("URI contains an empty component");
    }
    Ok(())
}

/// Validate a URI a client wants to own or publish to.
///
/// # Errors
///
/// Returns a message describing why the URI is invalid or reserved.
pub fn validate_client_uri(uri: &str) -> Result<(), &'static str> {
    validate_uri(uri)?;
    if is_reserved(uri) {
        return Err("URIs starting with 'wamp.' are reserved");
    }
    Ok(())
}

/// Whether a URI lies in the router's reserved namespace.
#[must_use]
pub fn is_reserved(uri: &str) -> bool {
    uri.starts_with(RESERVED_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_uris() {
        assert!(validate_uri("com.example.add").is_ok());
        assert!(validate_uri("add").is_ok());
        assert!(validate_uri("wamp.session.count").is_ok());
        assert!(validate_uri("com.example.Ünïcode").is_ok());
    }

    #[test]
    fn test_invalid_uris() {
        assert!(validate_uri("").is_err());
        assert!(validate_uri("com..example").is_err());
        assert!(validate_uri(".com").is_err());
        assert!(validate_uri("com.").is_err());
        assert!(validate_uri("com.exa mple").is_err());
        assert!(validate_uri("com.#").is_err());
        assert!(validate_uri(&"a".repeat(MAX_URI_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_reserved() {
        assert!(validate_client_uri("wamp.session.count").is_err());
        assert!(validate_client_uri("wampx.ok").is_ok());
        assert!(is_reserved("wamp.error.timeout"));
    }
}
