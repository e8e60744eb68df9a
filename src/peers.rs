//! Seams between cache groups and the peer transport.
//!
//! The core never owns the transport. A group consumes a [`PeerPicker`] to
//! learn which peer owns a key and a [`PeerFetcher`] to retrieve the value;
//! the transport (for instance [`api::HttpPool`](crate::api::HttpPool))
//! implements both. The two traits are deliberately unidirectional so
//! neither side holds an owning reference in both directions.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;

use crate::DynError;

/// Fetches values from one remote peer.
#[async_trait]
pub trait PeerFetcher: Send + Sync {
    /// Fetch the value of `key` in `group` from this peer.
    ///
    /// `group` and `key` are transported as-is and the value byte-exact.
    /// Dropping the returned future cancels the fetch. The peer is
    /// authoritative for the keys routed to it, so any error fails the
    /// caller's lookup; there is no origin fallback.
    async fn fetch(&self, group: &str, key: &str) -> Result<Bytes, DynError>;
}

/// Picks the peer owning a key.
pub trait PeerPicker: Send + Sync {
    /// The peer owning `key`.
    ///
    /// `None` means the key is owned by this process — or no peer routing is
    /// configured at all — and the origin loader is the authority.
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerFetcher>>;
}

static PICKER: OnceLock<Arc<dyn PeerPicker>> = OnceLock::new();

/// Register the process-wide peer picker.
///
/// Groups are usually constructed before the transport is wired up, so they
/// adopt the registered picker lazily on their first
/// [`get`](crate::Group::get) — unless one was installed explicitly via
/// [`Group::register_picker`](crate::Group::register_picker).
///
/// # Panics
///
/// When called more than once; a second transport in the same process is a
/// programmer error.
pub fn register_peer_picker(picker: Arc<dyn PeerPicker>) {
    if PICKER.set(picker).is_err() {
        panic!("register_peer_picker called more than once");
    }
}

/// The picker registered via [`register_peer_picker`], if any.
pub(crate) fn registered_picker() -> Option<Arc<dyn PeerPicker>> {
    PICKER.get().map(Arc::clone)
}
