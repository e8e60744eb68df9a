//! Peer pool routing keys over a consistent-hash ring.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use snafu::{ResultExt, Snafu};
use tracing::info;
use url::Url;

use crate::peers::{PeerFetcher, PeerPicker};
use crate::ring::{HashFn, HashRing};

use super::client::{self, HttpPeer};
use super::{DEFAULT_BASE_PATH, DEFAULT_REPLICAS};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Invalid peer endpoint {peer:?}: {source}"))]
    Endpoint {
        peer: String,
        source: url::ParseError,
    },

    #[snafu(display("Creating client for peer {peer:?}: {source}"))]
    PeerClient { peer: String, source: client::Error },
}

/// Result type for [`HttpPool`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builder for [`HttpPool`].
pub struct HttpPoolBuilder {
    self_endpoint: String,
    base_path: String,
    replicas: usize,
    hash: Option<HashFn>,
}

impl std::fmt::Debug for HttpPoolBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPoolBuilder")
            .field("self_endpoint", &self.self_endpoint)
            .field("base_path", &self.base_path)
            .field("replicas", &self.replicas)
            .field("hash", &self.hash.as_ref().map(|_| "Fn(..)"))
            .finish()
    }
}

impl HttpPoolBuilder {
    /// Build the pool.
    ///
    /// The pool starts without peers; wire membership with
    /// [`set_peers`](HttpPool::set_peers). Building does not register the
    /// pool anywhere — pass it to
    /// [`register_peer_picker`](crate::peers::register_peer_picker) or to
    /// [`Group::register_picker`](crate::Group::register_picker) explicitly.
    pub fn build(self) -> Arc<HttpPool> {
        let Self {
            self_endpoint,
            base_path,
            replicas,
            hash,
        } = self;

        let ring = match hash {
            Some(hash) => HashRing::with_hash(replicas, hash),
            None => HashRing::new(replicas),
        };

        Arc::new(HttpPool {
            self_endpoint,
            base_path,
            state: Mutex::new(PoolState {
                ring,
                fetchers: HashMap::new(),
            }),
        })
    }

    /// Serve and address resources under a different path prefix.
    pub fn base_path(self, base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..self
        }
    }

    /// Project each peer onto the ring as `replicas` virtual nodes.
    pub fn replicas(self, replicas: usize) -> Self {
        Self { replicas, ..self }
    }

    /// Replace the ring hash function (CRC-32 IEEE by default).
    ///
    /// Every process of a deployment must use the same hash, or peers will
    /// disagree on ownership.
    pub fn hash(self, hash: HashFn) -> Self {
        Self {
            hash: Some(hash),
            ..self
        }
    }
}

/// Routes keys to HTTP peers with consistent hashing.
///
/// The pool knows its own endpoint: keys the ring assigns to it resolve to
/// `None` from [`pick_peer`](PeerPicker::pick_peer), telling the group that
/// the origin loader is the authority.
pub struct HttpPool {
    self_endpoint: String,
    base_path: String,
    state: Mutex<PoolState>,
}

struct PoolState {
    ring: HashRing,
    fetchers: HashMap<String, Arc<HttpPeer>>,
}

impl HttpPool {
    /// Set up a builder for a pool answering under `self_endpoint`.
    ///
    /// `self_endpoint` must appear verbatim in the peer lists passed to
    /// [`set_peers`](Self::set_peers) for self-detection to work.
    pub fn builder(self_endpoint: impl Into<String>) -> HttpPoolBuilder {
        HttpPoolBuilder {
            self_endpoint: self_endpoint.into(),
            base_path: DEFAULT_BASE_PATH.to_owned(),
            replicas: DEFAULT_REPLICAS,
            hash: None,
        }
    }

    /// This process's own endpoint.
    pub fn self_endpoint(&self) -> &str {
        &self.self_endpoint
    }

    /// The path prefix resources are addressed under.
    pub fn base_path(&self) -> &str {
        &self.base_path
    }

    /// Replace the peer set, usually including `self_endpoint`.
    pub fn set_peers<I, S>(&self, peers: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let peers: Vec<String> = peers.into_iter().map(Into::into).collect();
        // build clients before taking the lock
        let mut fetchers = HashMap::with_capacity(peers.len());
        for peer in &peers {
            fetchers.insert(peer.clone(), self.fetcher(peer)?);
        }

        let mut state = self.state.lock().expect("not poisoned");
        let old: Vec<String> = state.fetchers.keys().cloned().collect();
        state.ring.remove(old);
        state.ring.add(peers);
        state.fetchers = fetchers;
        info!(
            peers = state.fetchers.len(),
            self_endpoint = %self.self_endpoint,
            "set cache peer membership"
        );
        Ok(())
    }

    /// Register additional peers.
    pub fn add_peers<I, S>(&self, peers: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let peers: Vec<String> = peers.into_iter().map(Into::into).collect();
        let mut fetchers = Vec::with_capacity(peers.len());
        for peer in &peers {
            fetchers.push((peer.clone(), self.fetcher(peer)?));
        }

        let mut state = self.state.lock().expect("not poisoned");
        state.ring.add(peers);
        state.fetchers.extend(fetchers);
        Ok(())
    }

    /// Deregister peers, dropping their clients.
    pub fn remove_peers<I, S>(&self, peers: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let peers: Vec<String> = peers.into_iter().map(|p| p.as_ref().to_owned()).collect();

        let mut state = self.state.lock().expect("not poisoned");
        state.ring.remove(&peers);
        for peer in &peers {
            state.fetchers.remove(peer);
        }
    }

    fn fetcher(&self, peer: &str) -> Result<Arc<HttpPeer>> {
        let endpoint: Url = peer.parse().context(EndpointSnafu { peer })?;
        let client = HttpPeer::builder(endpoint)
            .base_path(self.base_path.clone())
            .build()
            .context(PeerClientSnafu { peer })?;
        Ok(Arc::new(client))
    }
}

impl PeerPicker for HttpPool {
    fn pick_peer(&self, key: &str) -> Option<Arc<dyn PeerFetcher>> {
        let state = self.state.lock().expect("not poisoned");
        let owner = state.ring.get(key)?;
        if owner == self.self_endpoint {
            return None;
        }
        state.fetchers.get(owner).map(|f| Arc::clone(f) as _)
    }
}

impl std::fmt::Debug for HttpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPool")
            .field("self_endpoint", &self.self_endpoint)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}
