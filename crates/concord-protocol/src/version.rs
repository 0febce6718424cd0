//! Protocol versioning and subprotocol names.

use std::fmt;

/// Current protocol version.
pub const PROTOCOL_VERSION: Version = Version { major: 2, minor: 0 };

/// Implementation identifier announced in WELCOME details.
pub const AGENT: &str = concat!("concord/", env!("CARGO_PKG_VERSION"));

/// Protocol version information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version {
    /// Major version - breaking changes increment this.
    pub major: u8,
    /// Minor version - backwards-compatible changes increment this.
    pub minor: u8,
}

impl Version {
    /// Create a new version.
    #[must_use]
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }

    /// Check if this version is compatible with another version.
    ///
    /// Versions are compatible if they share the same major version.
    #[must_use]
    pub fn is_compatible_with(&self, other: &Version) -> bool {
        self.major == other.major
    }

    /// Subprotocol name for a serializer, e.g. `wamp.2.json`.
    #[must_use]
    pub fn subprotocol(&self, serializer: &str) -> String {
        format!("wamp.{}.{}", self.major, serializer)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Default for Version {
    fn default() -> Self {
        PROTOCOL_VERSION
    }
}

/// Split a subprotocol name into its version and serializer.
///
/// Returns `None` for names that are not of the form `wamp.<major>.<serializer>`.
#[must_use]
pub fn parse_subprotocol(name: &str) -> Option<(Version, &str)> {
    let rest = name.strip_prefix("wamp.")?;
    let (major, serializer) = rest.split_once('.')?;
    let major = major.parse().ok()?;
    if serializer.is_empty() {
        return None;
    }
    Some((Version::new(major, 0), serializer))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        let v2_0 = Version::new(2, 0);
        let v2_1 = Version::new(2, 1);
        let v1_0 = Version::new(1, 0);

        assert!(v2_0.is_compatible_with(&v2_1));
        assert!(v2_1.is_compatible_with(&v2_0));
        assert!(!v2_0.is_compatible_with(&v1_0));
    }

    #[test]
    fn test_version_display() {
        let v = Version::new(2, 1);
        assert_eq!(v.to_string(), "2.1");
    }

    #[test]
    fn test_subprotocol() {
        assert_eq!(PROTOCOL_VERSION.subprotocol("json"), "wamp.2.json");
        assert_eq!(
            parse_subprotocol("wamp.2.msgpack"),
            Some((Version::new(2, 0), "msgpack"))
        );
        assert_eq!(parse_subprotocol("wamp.x.json"), None);
        assert_eq!(parse_subprotocol("wamp.2."), None);
        assert_eq!(parse_subprotocol("mqtt"), None);
    }

    #[test]
    fn test_agent() {
        assert!(AGENT.starts_with("concord/"));
    }
}
