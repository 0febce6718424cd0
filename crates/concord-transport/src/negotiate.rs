//! Subprotocol negotiation.
//!
//! Clients offer a list of subprotocols (`wamp.2.json`, `wamp.2.msgpack`)
//! and the router picks the one that names a registered binding.

/// Split a `Sec-WebSocket-Protocol` header value into its entries.
#[must_use]
pub fn parse_protocol_header(value: &str) -> Vec<&str> {
    value
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

/// Pick the first offered subprotocol the router supports.
///
/// The client's order expresses its preference.
#[must_use]
pub fn negotiate_subprotocol<'a, S: AsRef<str>>(offered: &[&str], supported: &'a [S]) -> Option<&'a str> {
    offered.iter().find_map(|offer| {
        supported
            .iter()
            .map(AsRef::as_ref)
            .find(|candidate| candidate == offer)
    })
}
