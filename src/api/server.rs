//! Serving side of the HTTP peer transport.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderValue};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use tracing::warn;

use crate::group;

use super::{DEFAULT_BASE_PATH, parse_resource_path};

type ServiceBody = Full<Bytes>;

/// A hyper [`Service`] answering peer fetches from the group registry.
///
/// `GET {base_path}{group}/{key}` resolves the group by name and runs a
/// regular [`Group::get`](crate::Group::get), so the serving process answers
/// from its own tiers or its origin exactly like a local caller would.
/// Anything outside the base path is a plain 404; the request shape never
/// takes the server down.
#[derive(Debug, Clone)]
pub struct PoolService {
    base_path: Arc<str>,
}

impl PoolService {
    /// Create a service answering under `base_path`.
    pub fn new(base_path: impl Into<Arc<str>>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }
}

impl Default for PoolService {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PATH)
    }
}

impl<B> Service<Request<B>> for PoolService
where
    B: Send + 'static,
{
    type Response = Response<ServiceBody>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Infallible>>;

    fn call(&self, req: Request<B>) -> Self::Future {
        let base_path = Arc::clone(&self.base_path);
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        async move { Ok(handle(&base_path, &method, &path).await) }.boxed()
    }
}

async fn handle(base_path: &str, method: &Method, path: &str) -> Response<ServiceBody> {
    let Some((group_name, key)) = parse_resource_path(path, base_path) else {
        return status_response(StatusCode::NOT_FOUND, "no such resource");
    };
    if method != Method::GET {
        return status_response(StatusCode::METHOD_NOT_ALLOWED, "only GET is supported");
    }
    let Some(group) = group::get_group(&group_name) else {
        return status_response(StatusCode::NOT_FOUND, &format!("no such group: {group_name}"));
    };

    match group.get(&key).await {
        Ok(value) => {
            let mut response = Response::new(Full::new(value.into_bytes()));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
            response
        }
        Err(e) => {
            warn!(group = %group_name, key = %key, error = %e, "peer fetch failed");
            status_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

fn status_response(status: StatusCode, message: &str) -> Response<ServiceBody> {
    let mut response = Response::new(Full::new(Bytes::copy_from_slice(message.as_bytes())));
    *response.status_mut() = status;
    response
}

/// Test utilities.
pub mod test_util {
    use std::net::SocketAddr;

    use hyper_util::rt::{TokioExecutor, TokioIo};
    use hyper_util::server::conn::auto::Builder;
    use hyper_util::server::graceful::GracefulShutdown;
    use tokio::net::TcpListener;
    use tokio::select;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use url::Url;

    use crate::api::client::HttpPeer;

    use super::*;

    /// Test runner for a [`PoolService`] on an ephemeral port.
    #[derive(Debug)]
    pub struct TestPoolServer {
        addr: SocketAddr,
        shutdown: CancellationToken,
        handle: Option<JoinHandle<()>>,
    }

    impl TestPoolServer {
        /// Serve `service` on an ephemeral localhost port.
        pub async fn bind_ephemeral(service: PoolService) -> Self {
            let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
                .await
                .unwrap();
            let addr = listener.local_addr().unwrap();

            // graceful shutdown guide: https://hyper.rs/guides/1/server/graceful-shutdown/
            let shutdown = CancellationToken::new();
            let signal = shutdown.clone().cancelled_owned();
            let graceful = GracefulShutdown::new();

            let handle = tokio::task::spawn(async move {
                tokio::pin!(signal);
                loop {
                    select! {
                        _ = signal.as_mut() => break,
                        res = listener.accept() => {
                            let (stream, _) = res.unwrap();
                            let service = service.clone();

                            let conn = Builder::new(TokioExecutor::new())
                                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                                .into_owned();
                            let conn = graceful.watch(conn);

                            tokio::task::spawn(async move {
                                if let Err(err) = conn.await {
                                    println!("Error serving connection: {err:?}");
                                }
                            });
                        },
                    }
                }
                graceful.shutdown().await;
            });

            Self {
                addr,
                shutdown,
                handle: Some(handle),
            }
        }

        /// Endpoint this server listens on.
        pub fn endpoint(&self) -> Url {
            format!("http://127.0.0.1:{}", self.addr.port())
                .parse()
                .unwrap()
        }

        /// Returns a client for this server.
        pub fn peer(&self) -> HttpPeer {
            HttpPeer::builder(self.endpoint()).build().unwrap()
        }

        /// Triggers and waits for graceful shutdown.
        pub async fn shutdown(mut self) {
            self.shutdown.cancel();
            if let Some(x) = self.handle.take() {
                x.await.unwrap()
            }
        }
    }

    impl Drop for TestPoolServer {
        fn drop(&mut self) {
            if let Some(x) = &self.handle {
                x.abort()
            }
        }
    }
}
