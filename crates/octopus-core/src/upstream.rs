//! Outbound calls to upstream clusters
//!
//! Filters issue calls through a [`ClusterManager`]. A call either completes inline or
//! returns an [`AsyncRequest`] handle; in the latter case the outcome is delivered later as
//! a [`CallCompletion`] on the worker that issued the call.

use crate::error::{Error, Result};
use crate::headers::{self, HeaderMap};
use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, Instrument};

/// Identifier of an outstanding call
pub type CallId = u64;

/// Request sent to an upstream cluster
#[derive(Debug, Clone, Default)]
pub struct HttpCallRequest {
    /// Request headers, including `:method`, `:path` and `:authority`
    pub headers: HeaderMap,
    /// Optional request body
    pub body: Option<Bytes>,
}

/// Response received from an upstream cluster
#[derive(Debug, Clone, Default)]
pub struct HttpCallResponse {
    /// Response headers, including `:status`
    pub headers: HeaderMap,
    /// Response body
    pub body: Bytes,
}

/// Why a call failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// Connection failure or stream reset
    Reset,
    /// The call exceeded its timeout
    Timeout,
    /// The response body was larger than allowed
    ExceedResponseBufferLimit,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Reset => write!(f, "reset"),
            Self::Timeout => write!(f, "timeout"),
            Self::ExceedResponseBufferLimit => write!(f, "exceed response buffer limit"),
        }
    }
}

/// Options applied to a single call
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Call timeout; `None` waits indefinitely
    pub timeout: Option<Duration>,
    /// Span the call's span is parented to
    pub parent_span: tracing::Span,
    /// Name recorded on the call's span
    pub child_span_name: String,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            parent_span: tracing::Span::none(),
            child_span_name: "script_route".to_string(),
        }
    }
}

impl RequestOptions {
    /// Options with a timeout
    pub fn with_timeout(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            ..Self::default()
        }
    }
}

/// Handle to an in-flight call
pub trait AsyncRequest: fmt::Debug {
    /// Identifier matched against [`CallCompletion::id`]
    fn id(&self) -> CallId;

    /// Cancel the call; no completion is delivered afterwards
    fn cancel(&mut self);
}

/// Immediate result of issuing a call
#[derive(Debug)]
pub enum CallDispatch {
    /// The call is in flight
    Pending(Box<dyn AsyncRequest>),
    /// The call finished before `send` returned
    Completed(std::result::Result<HttpCallResponse, FailureReason>),
}

/// Outcome of a call delivered back to the issuing worker
#[derive(Debug)]
pub struct CallCompletion {
    /// Call identifier
    pub id: CallId,
    /// Response or failure reason
    pub outcome: std::result::Result<HttpCallResponse, FailureReason>,
}

/// Entry point for outbound calls
pub trait ClusterManager: Send + Sync + fmt::Debug {
    /// Whether a cluster with this name is configured
    fn has_cluster(&self, name: &str) -> bool;

    /// Issue a call to `cluster`
    fn send(
        &self,
        cluster: &str,
        request: HttpCallRequest,
        options: RequestOptions,
    ) -> Result<CallDispatch>;
}

/// Body type alias
pub type Body = Full<Bytes>;

const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// [`ClusterManager`] that performs calls with hyper on a tokio runtime
///
/// Completions are pushed into a channel; the worker owning the streams drains it and
/// hands each completion to the filter that issued the call.
#[derive(Debug)]
pub struct HyperClusterManager {
    clusters: HashMap<String, String>,
    client: Client<HttpConnector, Body>,
    runtime: tokio::runtime::Handle,
    completions: mpsc::UnboundedSender<CallCompletion>,
    next_id: AtomicU64,
    max_response_bytes: usize,
}

impl HyperClusterManager {
    /// Create a manager spawning calls on `runtime`, plus the completion receiver
    pub fn new(runtime: tokio::runtime::Handle) -> (Self, mpsc::UnboundedReceiver<CallCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());

        let manager = Self {
            clusters: HashMap::new(),
            client,
            runtime,
            completions: tx,
            next_id: AtomicU64::new(1),
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
        };
        (manager, rx)
    }

    /// Register a cluster reachable at `address` (`host:port`)
    pub fn add_cluster(&mut self, name: impl Into<String>, address: impl Into<String>) {
        self.clusters.insert(name.into(), address.into());
    }

    /// Limit the size of buffered response bodies
    pub fn with_max_response_bytes(mut self, max_response_bytes: usize) -> Self {
        self.max_response_bytes = max_response_bytes;
        self
    }

    fn build_request(address: &str, request: HttpCallRequest) -> Result<http::Request<Body>> {
        let method = request
            .headers
            .method()
            .ok_or_else(|| Error::InvalidHeader("missing :method".to_string()))?;
        let path = request
            .headers
            .path()
            .ok_or_else(|| Error::InvalidHeader("missing :path".to_string()))?;

        let mut builder = http::Request::builder()
            .method(method)
            .uri(format!("http://{}{}", address, path));

        for (key, value) in request.headers.iter() {
            if !key.starts_with(':') {
                builder = builder.header(key, value);
            }
        }
        if let Some(host) = request.headers.host() {
            builder = builder.header(http::header::HOST, host);
        }

        Ok(builder.body(Full::new(request.body.unwrap_or_default()))?)
    }
}

impl ClusterManager for HyperClusterManager {
    fn has_cluster(&self, name: &str) -> bool {
        self.clusters.contains_key(name)
    }

    fn send(
        &self,
        cluster: &str,
        request: HttpCallRequest,
        options: RequestOptions,
    ) -> Result<CallDispatch> {
        let address = self
            .clusters
            .get(cluster)
            .ok_or_else(|| Error::UnknownCluster(cluster.to_string()))?;
        let request = Self::build_request(address, request)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = self.client.clone();
        let completions = self.completions.clone();
        let limit = self.max_response_bytes;
        let span = tracing::debug_span!(
            parent: &options.parent_span,
            "upstream_call",
            name = %options.child_span_name,
            cluster = %cluster,
            call_id = id
        );

        let task = self.runtime.spawn(
            async move {
                let outcome = match options.timeout {
                    Some(timeout) => tokio::time::timeout(timeout, perform(client, request, limit))
                        .await
                        .unwrap_or(Err(FailureReason::Timeout)),
                    None => perform(client, request, limit).await,
                };
                debug!(ok = outcome.is_ok(), "upstream call finished");
                // The receiver is gone when the worker shut down.
                let _ = completions.send(CallCompletion { id, outcome });
            }
            .instrument(span),
        );

        Ok(CallDispatch::Pending(Box::new(SpawnedCall {
            id,
            abort: task.abort_handle(),
        })))
    }
}

async fn perform(
    client: Client<HttpConnector, Body>,
    request: http::Request<Body>,
    limit: usize,
) -> std::result::Result<HttpCallResponse, FailureReason> {
    let response = client.request(request).await.map_err(|e| {
        match hyper_cause(&e) {
            Some(cause) => debug!(
                error = %cause,
                connect = e.is_connect(),
                closed = cause.is_closed(),
                incomplete = cause.is_incomplete_message(),
                "upstream call failed"
            ),
            None => debug!(error = %e, connect = e.is_connect(), "upstream call failed"),
        }
        FailureReason::Reset
    })?;

    let (parts, body) = response.into_parts();
    let body = Limited::new(body, limit)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                FailureReason::ExceedResponseBufferLimit
            } else {
                if let Some(cause) = hyper_cause(&*e) {
                    debug!(error = %cause, "upstream response body failed");
                }
                FailureReason::Reset
            }
        })?
        .to_bytes();

    let mut headers = HeaderMap::new();
    headers.add(headers::STATUS, parts.status.as_u16().to_string());
    for (name, value) in parts.headers.iter() {
        headers.add(
            name.as_str(),
            String::from_utf8_lossy(value.as_bytes()).into_owned(),
        );
    }

    Ok(HttpCallResponse { headers, body })
}

/// First [`hyper::Error`] in the source chain of `err`
fn hyper_cause<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a hyper::Error> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(cause) = err.downcast_ref::<hyper::Error>() {
            return Some(cause);
        }
        current = err.source();
    }
    None
}

#[derive(Debug)]
struct SpawnedCall {
    id: CallId,
    abort: tokio::task::AbortHandle,
}

impl AsyncRequest for SpawnedCall {
    fn id(&self) -> CallId {
        self.id
    }

    fn cancel(&mut self) {
        self.abort.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn get_request() -> HttpCallRequest {
        HttpCallRequest {
            headers: HeaderMap::from_pairs([(":method", "GET"), (":path", "/"), (":authority", "x")]),
            body: None,
        }
    }

    #[test]
    fn test_failure_reason_display() {
        assert_eq!(FailureReason::Reset.to_string(), "reset");
        assert_eq!(FailureReason::Timeout.to_string(), "timeout");
        assert_eq!(
            FailureReason::ExceedResponseBufferLimit.to_string(),
            "exceed response buffer limit"
        );
    }

    #[test]
    fn test_build_request_requires_method() {
        let request = HttpCallRequest {
            headers: HeaderMap::from_pairs([(":path", "/")]),
            body: None,
        };
        let err = HyperClusterManager::build_request("127.0.0.1:1", request).unwrap_err();
        assert!(matches!(err, Error::InvalidHeader(_)));
    }

    #[tokio::test]
    async fn test_unknown_cluster_is_rejected() {
        let (manager, _rx) = HyperClusterManager::new(tokio::runtime::Handle::current());
        assert!(!manager.has_cluster("missing"));
        let err = manager
            .send("missing", get_request(), RequestOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnknownCluster(_)));
    }

    #[tokio::test]
    async fn test_call_completes_through_channel() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let (mut manager, mut rx) = HyperClusterManager::new(tokio::runtime::Handle::current());
        manager.add_cluster("cluster_x", server.address().to_string());

        let dispatch = manager
            .send(
                "cluster_x",
                get_request(),
                RequestOptions::with_timeout(Some(Duration::from_secs(5))),
            )
            .unwrap();
        let pending = match dispatch {
            CallDispatch::Pending(pending) => pending,
            CallDispatch::Completed(_) => panic!("expected an in-flight call"),
        };

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.id, pending.id());
        let response = completion.outcome.unwrap();
        assert_eq!(response.headers.status(), Some(200));
        assert_eq!(&response.body[..], b"ok");
    }

    /// Accept one connection and answer it with something that is not HTTP
    async fn garbage_server() -> std::net::SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let _ = socket.write_all(b"not http at all\r\n\r\n").await;
            let _ = socket.shutdown().await;
        });
        addr
    }

    #[test]
    fn test_hyper_cause_absent_for_other_errors() {
        let err = std::io::Error::other("boom");
        assert!(hyper_cause(&err).is_none());
    }

    #[tokio::test]
    async fn test_protocol_error_has_hyper_cause() {
        let addr = garbage_server().await;
        let client: Client<HttpConnector, Body> =
            Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let request = HyperClusterManager::build_request(&addr.to_string(), get_request()).unwrap();

        let err = client.request(request).await.unwrap_err();
        assert!(!err.is_connect());
        assert!(hyper_cause(&err).is_some());
    }

    #[tokio::test]
    async fn test_protocol_error_surfaces_as_reset() {
        let addr = garbage_server().await;
        let (mut manager, mut rx) = HyperClusterManager::new(tokio::runtime::Handle::current());
        manager.add_cluster("broken", addr.to_string());

        manager
            .send("broken", get_request(), RequestOptions::default())
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.outcome.unwrap_err(), FailureReason::Reset);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let (mut manager, mut rx) = HyperClusterManager::new(tokio::runtime::Handle::current());
        manager.add_cluster("slow", server.address().to_string());

        manager
            .send(
                "slow",
                get_request(),
                RequestOptions::with_timeout(Some(Duration::from_millis(50))),
            )
            .unwrap();

        let completion = rx.recv().await.unwrap();
        assert_eq!(completion.outcome.unwrap_err(), FailureReason::Timeout);
    }
}
