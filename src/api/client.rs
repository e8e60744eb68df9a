//! Client for fetching values from a remote peer.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, StatusCode, Url};
use snafu::{ResultExt, Snafu};

use crate::DynError;
use crate::peers::PeerFetcher;

use super::{DEFAULT_BASE_PATH, resource_path};

#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum Error {
    #[snafu(display("Creating client: {source}"))]
    Client { source: reqwest::Error },

    #[snafu(display("Fetch reqwest error: {source}"))]
    Fetch { source: reqwest::Error },

    #[snafu(display("Invalid fetch url: {source}"))]
    FetchUrl { source: url::ParseError },

    #[snafu(display("Peer answered status {status}"))]
    Status { status: StatusCode },
}

/// Result type for [`HttpPeer`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Builder for [`HttpPeer`].
#[derive(Debug)]
pub struct HttpPeerBuilder {
    connect_timeout: Duration,
    fetch_timeout: Duration,
    endpoint: Url,
    base_path: String,
}

impl HttpPeerBuilder {
    /// Build client.
    pub fn build(self) -> Result<HttpPeer> {
        let Self {
            connect_timeout,
            fetch_timeout,
            endpoint,
            base_path,
        } = self;

        // Note: no global `.timeout` here, it is applied per request.
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context(ClientSnafu)?;

        Ok(HttpPeer {
            client,
            endpoint,
            base_path,
            fetch_timeout,
        })
    }

    /// Set a timeout for only the connect phase.
    pub fn connect_timeout(self, connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            ..self
        }
    }

    /// Set the timeout for fetch requests.
    ///
    /// The timeout is applied from when the request starts connecting until
    /// the response body has finished.
    pub fn fetch_timeout(self, fetch_timeout: Duration) -> Self {
        Self {
            fetch_timeout,
            ..self
        }
    }

    /// Address resources under a different path prefix.
    pub fn base_path(self, base_path: impl Into<String>) -> Self {
        Self {
            base_path: base_path.into(),
            ..self
        }
    }
}

/// A client for one remote cache peer.
#[derive(Debug)]
pub struct HttpPeer {
    client: Client,
    endpoint: Url,
    base_path: String,
    fetch_timeout: Duration,
}

impl HttpPeer {
    /// Set up a builder for the peer at `endpoint`.
    pub fn builder(endpoint: Url) -> HttpPeerBuilder {
        HttpPeerBuilder {
            connect_timeout: Duration::from_secs(2),
            fetch_timeout: Duration::from_secs(1),
            endpoint,
            base_path: DEFAULT_BASE_PATH.to_owned(),
        }
    }

    /// The endpoint this peer is reached under.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Retrieve the value of `key` in `group` from the peer.
    ///
    /// Any non-OK response is an error; the peer is authoritative for the
    /// keys routed to it, so there is nothing to fall back to here.
    pub async fn get(&self, group: &str, key: &str) -> Result<Bytes> {
        let path = resource_path(&self.base_path, group, key);
        let url = self.endpoint.join(&path).context(FetchUrlSnafu)?;

        let resp = self
            .client
            .get(url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .context(FetchSnafu)?;
        if resp.status() != StatusCode::OK {
            return StatusSnafu {
                status: resp.status(),
            }
            .fail();
        }

        resp.bytes().await.context(FetchSnafu)
    }
}

#[async_trait]
impl PeerFetcher for HttpPeer {
    async fn fetch(&self, group: &str, key: &str) -> Result<Bytes, DynError> {
        self.get(group, key).await.map_err(|e| Arc::new(e) as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_peer_errors() {
        // nothing listens on port 1
        let peer = HttpPeer::builder("http://127.0.0.1:1".parse().unwrap())
            .connect_timeout(Duration::from_millis(100))
            .fetch_timeout(Duration::from_millis(200))
            .build()
            .unwrap();

        let err = peer.get("g", "k").await.unwrap_err();
        assert!(matches!(err, Error::Fetch { .. }), "{err}");
    }
}
