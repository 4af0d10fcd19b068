//! Operations the sandbox delegates to the host
//!
//! Guest code never touches the network directly. Deferred host calls are
//! queued as [`HostOp`]s and settled by the execution session; the actual
//! HTTP exchange goes through a [`Transport`] supplied by the embedder.
//!
//! This allows the embedder to:
//! - Swap the HTTP stack (or fake it in tests)
//! - Keep every counter on the host side, outside guest reach
//!
//! ## Default behavior
//!
//! `Transport::fetch` defaults to an error, so `DisabledTransport` is the
//! empty impl.

use crate::http::{FetchInit, FetchRequest, FetchResponse};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Deferred privileged operations requested by the guest
#[derive(Debug, Clone, PartialEq)]
pub enum HostOp {
    /// `pkg.install(spec)`
    PkgInstall { spec: String },
    /// `fetch(url, init)`
    Fetch { url: String, init: FetchInit },
}

impl HostOp {
    pub fn name(&self) -> &'static str {
        match self {
            HostOp::PkgInstall { .. } => "pkgInstall",
            HostOp::Fetch { .. } => "fetch",
        }
    }
}

/// A queued host operation and the id the guest waits on
#[derive(Debug, Clone, PartialEq)]
pub struct HostRequest {
    pub id: u32,
    pub op: HostOp,
}

/// Future type alias for async operation results
pub type OpFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Performs buffered HTTP exchanges for the sandbox
///
/// Implementations must not apply their own quotas: the network proxy does
/// the accounting and wraps every call in a timeout. Dropping the returned
/// future must abort the transfer.
pub trait Transport: Send + Sync {
    /// Default: returns error "Fetch not available"
    fn fetch(&self, _request: FetchRequest) -> OpFuture<'_, Result<FetchResponse, String>> {
        Box::pin(async { Err("Fetch not available".into()) })
    }
}

/// Arc wrapper for Transport trait object
pub type TransportHandle = Arc<dyn Transport>;

/// Transport that refuses every request
pub struct DisabledTransport;

impl Transport for DisabledTransport {}

#[cfg(feature = "reqwest")]
pub use self::reqwest_transport::ReqwestTransport;

#[cfg(feature = "reqwest")]
mod reqwest_transport {
    use super::{OpFuture, Transport};
    use crate::http::{FetchRequest, FetchResponse, RedirectMode};
    use bytes::{Bytes, BytesMut};
    use reqwest::redirect::Policy;

    /// Production transport on top of reqwest
    ///
    /// A client is built per request because the redirect policy is a
    /// client-level setting in reqwest.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestTransport {
        user_agent: Option<String>,
    }

    impl ReqwestTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
            Self {
                user_agent: Some(user_agent.into()),
            }
        }

        fn client(&self, request: &FetchRequest) -> reqwest::Result<reqwest::Client> {
            let policy = match request.redirect {
                RedirectMode::Follow => Policy::limited(request.max_redirects as usize),
                RedirectMode::Manual => Policy::none(),
                RedirectMode::Error => Policy::custom(|attempt| attempt.error("redirects are not allowed")),
            };

            let mut builder = reqwest::Client::builder().redirect(policy);
            if let Some(agent) = &self.user_agent {
                builder = builder.user_agent(agent.clone());
            }
            builder.build()
        }

        async fn exchange(&self, request: FetchRequest) -> reqwest::Result<FetchResponse> {
            let client = self.client(&request)?;
            let method = match reqwest::Method::from_bytes(request.method.as_str().as_bytes()) {
                Ok(method) => method,
                Err(_) => reqwest::Method::GET,
            };

            let mut builder = client.request(method, &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = request.body {
                builder = builder.body(body);
            }

            let mut response = builder.send().await?;
            let status = response.status().as_u16();
            let final_url = response.url().to_string();
            let headers = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.as_str().to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();

            // Read one byte past the limit so the proxy can see the overflow
            let cap = usize::try_from(request.body_limit.saturating_add(1)).unwrap_or(usize::MAX);
            let mut body = BytesMut::new();
            while let Some(chunk) = response.chunk().await? {
                body.extend_from_slice(&chunk);
                if body.len() >= cap {
                    body.truncate(cap);
                    break;
                }
            }

            Ok(FetchResponse {
                status,
                headers,
                body: Bytes::from(body),
                final_url,
            })
        }
    }

    impl Transport for ReqwestTransport {
        fn fetch(&self, request: FetchRequest) -> OpFuture<'_, Result<FetchResponse, String>> {
            Box::pin(async move { self.exchange(request).await.map_err(|err| err.to_string()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_transport_refuses() {
        let transport = DisabledTransport;
        let result = transport
            .fetch(FetchRequest::get("https://example.com", 10, 0))
            .await;
        assert_eq!(result, Err("Fetch not available".to_string()));
    }

    #[test]
    fn test_op_names() {
        let op = HostOp::PkgInstall {
            spec: "left-pad".into(),
        };
        assert_eq!(op.name(), "pkgInstall");
    }

    #[test]
    fn test_requests_compare_by_value() {
        let request = |method: &str| HostRequest {
            id: 3,
            op: HostOp::Fetch {
                url: "https://a.test/".into(),
                init: FetchInit {
                    method: Some(method.into()),
                    ..FetchInit::default()
                },
            },
        };
        assert_eq!(request("POST"), request("POST"));
        assert_ne!(request("POST"), request("PUT"));
        assert_eq!(request("GET").op.name(), "fetch");
    }
}
