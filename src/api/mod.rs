//! HTTP rendition of the peer transport.
//!
//! Peers exchange values through an opaque RPC: `GET
//! {peer}{base_path}{group}/{key}` answers the raw value bytes. [`HttpPool`]
//! tracks the peer set on a consistent-hash ring and implements
//! [`PeerPicker`](crate::peers::PeerPicker); [`HttpPeer`] is the client side
//! of one peer; [`PoolService`](server::PoolService) is the serving side,
//! answering from the process-wide group registry.
//!
//! Group and key travel percent-encoded in the path and round-trip
//! byte-exact, as does the value in the response body.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};

pub mod client;
pub mod pool;
pub mod server;

pub use client::HttpPeer;
pub use pool::{HttpPool, HttpPoolBuilder};
pub use server::PoolService;

/// Path prefix under which cache resources are served.
pub const DEFAULT_BASE_PATH: &str = "/_cache/";

/// Virtual nodes per peer on the ring.
pub const DEFAULT_REPLICAS: usize = 50;

/// Characters escaped within a group or key path segment.
///
/// Everything that could read as path structure is escaped.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Render the resource path for `(group, key)` under `base_path`.
pub(crate) fn resource_path(base_path: &str, group: &str, key: &str) -> String {
    format!(
        "{base_path}{}/{}",
        utf8_percent_encode(group, SEGMENT),
        utf8_percent_encode(key, SEGMENT)
    )
}

/// Parse a request path into `(group, key)`, if it lies under `base_path`.
///
/// The key is everything after the first separator, so keys containing
/// unescaped slashes (from foreign clients) survive as-is.
pub(crate) fn parse_resource_path(path: &str, base_path: &str) -> Option<(String, String)> {
    let rest = path.strip_prefix(base_path)?;
    let (group, key) = rest.split_once('/')?;

    let group = percent_decode_str(group).decode_utf8().ok()?;
    let key = percent_decode_str(key).decode_utf8().ok()?;
    Some((group.into_owned(), key.into_owned()))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_resource_path_round_trip() {
        let cases = [
            ("scores", "alice"),
            ("scores", "key with spaces"),
            ("scores", "key/with/slashes"),
            ("scores", "percent%2Fliteral"),
            ("scores", "dots..and%more"),
            ("scores", "ünïcode-schlüssel"),
            ("gr oup/with?tricks", "k"),
            ("g", ""),
        ];

        let mut seen = HashSet::with_capacity(cases.len());
        for (group, key) in cases {
            let path = resource_path(DEFAULT_BASE_PATH, group, key);
            assert!(seen.insert(path.clone()), "paths should be unique: {path}");

            let (back_group, back_key) = parse_resource_path(&path, DEFAULT_BASE_PATH).unwrap();
            assert_eq!(back_group, group, "path {path}");
            assert_eq!(back_key, key, "path {path}");
        }
    }

    #[test]
    fn test_parse_rejects_foreign_paths() {
        assert_eq!(parse_resource_path("/other/g/k", DEFAULT_BASE_PATH), None);
        assert_eq!(parse_resource_path("/_cache/missing-key", DEFAULT_BASE_PATH), None);
        assert_eq!(parse_resource_path("/", DEFAULT_BASE_PATH), None);
    }

    #[test]
    fn test_parse_keeps_raw_slashes_in_key() {
        let parsed = parse_resource_path("/_cache/g/a/b/c", DEFAULT_BASE_PATH).unwrap();
        assert_eq!(parsed, ("g".to_owned(), "a/b/c".to_owned()));
    }
}
