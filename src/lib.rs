//! Sharded peer-to-peer read-through cache.
//!
//! # Design
//!
//! A process participating in the cache owns a slice of the keyspace, assigned
//! by consistent hashing over the peer set. It serves authoritative reads for
//! the keys it owns and acts as a client cache for keys owned by remote peers.
//!
//! Applications interact with a [`Group`]: a named cache namespace with a byte
//! budget and an origin [`Getter`] that produces values the cache does not
//! have. A single [`Group::get`] resolves a key from local memory, from the
//! owning peer, or from the origin — and concurrent calls for the same missing
//! key perform at most one upstream load between them.
//!
//! ## Components
//!
//! * [`local::ByteCache`] — a byte-accounted LRU tier. Each group keeps two:
//!   a main tier for keys this process owns and a small hot tier mirroring
//!   frequently requested remote keys.
//! * [`ring::HashRing`] — maps keys to peer identities with virtual nodes, so
//!   all processes agree on ownership and membership changes move few keys.
//! * [`coalesce::Coalescer`] — collapses concurrent loads for one key into a
//!   single execution and broadcasts the result to every waiter.
//! * [`Group`] — composes the above into the load pipeline.
//! * [`api`] — an HTTP rendition of the peer transport: an opaque
//!   `(group, key) -> bytes` RPC. Any transport implementing the [`peers`]
//!   traits can replace it.
//!
//! Values are immutable [`ByteView`]s. The cache is strictly read-through:
//! there is no write propagation, no TTL, and no persistence. Eviction is
//! driven purely by last use and the group's byte budget.

#![warn(missing_docs)]

use std::sync::Arc;

use bytes::Bytes;

pub mod api;
pub mod coalesce;
pub mod group;
pub mod local;
pub mod peers;
pub mod ring;

pub use group::{Getter, GetterFn, Group, GroupStats, get_group, new_group};
pub use peers::{PeerFetcher, PeerPicker, register_peer_picker};

/// Dynamic error type.
///
/// Origin loaders and peer transports surface failures through this type; the
/// cache core treats them as opaque and propagates them unchanged.
pub type DynError = Arc<dyn std::error::Error + Send + Sync>;

/// An immutable view over a cached byte sequence.
///
/// Clones are cheap and share the underlying storage. A `ByteView` handed out
/// by the cache never changes: updates to a key install a new view, they do
/// not mutate views already held by callers.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct ByteView(Bytes);

impl ByteView {
    /// Length of the viewed bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the view is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The viewed bytes.
    #[inline]
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Unwrap into the underlying [`Bytes`].
    pub fn into_bytes(self) -> Bytes {
        self.0
    }
}

impl AsRef<[u8]> for ByteView {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Bytes> for ByteView {
    fn from(data: Bytes) -> Self {
        Self(data)
    }
}

impl From<Vec<u8>> for ByteView {
    fn from(data: Vec<u8>) -> Self {
        Self(data.into())
    }
}

impl From<String> for ByteView {
    fn from(data: String) -> Self {
        Self(data.into_bytes().into())
    }
}

impl From<&str> for ByteView {
    fn from(data: &str) -> Self {
        Self(Bytes::copy_from_slice(data.as_bytes()))
    }
}
