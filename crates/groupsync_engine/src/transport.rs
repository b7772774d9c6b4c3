//! Transport layer abstraction for HTTP round trips.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

/// Ordered header list with case-insensitive lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Creates an empty header list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// Appends a header, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(name, value);
        self
    }

    /// First value of `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns true if `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: &'static str,
    /// Full URL including the query.
    pub url: Url,
    /// Request headers.
    pub headers: Headers,
    /// Encoded body.
    pub body: Bytes,
    /// Basic-auth credentials.
    pub basic_auth: Option<(String, Option<String>)>,
}

impl HttpRequest {
    /// Creates a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: "POST",
            url,
            headers: Headers::new(),
            body,
            basic_auth: None,
        }
    }

    /// Value of a query parameter.
    pub fn query(&self, key: &str) -> Option<String> {
        self.url
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// The protocol command, from the `Cmd` query parameter.
    pub fn command(&self) -> Option<String> {
        self.query("Cmd")
    }
}

/// A received response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Response headers.
    pub headers: Headers,
    /// Raw body.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates an empty response.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Bytes::new(),
        }
    }

    /// Adds a header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Sets the body and its content type.
    pub fn with_body(mut self, content_type: &str, body: impl Into<Bytes>) -> Self {
        self.headers.insert("Content-Type", content_type);
        self.body = body.into();
        self
    }

    /// Content type without parameters.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get("Content-Type")
            .map(|v| v.split(';').next().unwrap_or(v).trim())
    }
}

/// A failure below HTTP: the request never produced a status line.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportFault {
    /// Connection could not be established or was lost.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The request could not be built or was refused locally.
    #[error("request rejected: {0}")]
    Request(String),
}

impl TransportFault {
    /// Returns true if retrying could help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportFault::Connection(_))
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual network I/O. The engine races
/// every call against its own timeout and drops the future on cancel.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a request and returns the response.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportFault>;
}

/// What a [`MockHttpClient`] does with one request.
#[derive(Debug, Clone)]
pub enum MockReply {
    /// Return this response.
    Respond(HttpResponse),
    /// Fail below HTTP.
    Fault(TransportFault),
    /// Never answer.
    Hang,
}

/// A request seen by a [`MockHttpClient`].
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// When the request was sent.
    pub at: Instant,
    /// The request.
    pub request: HttpRequest,
}

type Handler = Arc<dyn Fn(&HttpRequest) -> MockReply + Send + Sync>;

/// A scripted HTTP client for testing.
///
/// Scripted replies are consumed first, in order; after that the handler
/// (if any) answers; otherwise requests fail with a connection fault.
#[derive(Default)]
pub struct MockHttpClient {
    script: Mutex<VecDeque<MockReply>>,
    handler: Mutex<Option<Handler>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MockHttpClient {
    /// Creates a mock with an empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a response.
    pub fn push_response(&self, response: HttpResponse) {
        self.script.lock().push_back(MockReply::Respond(response));
    }

    /// Queues a fault.
    pub fn push_fault(&self, fault: TransportFault) {
        self.script.lock().push_back(MockReply::Fault(fault));
    }

    /// Queues a request that never completes.
    pub fn push_hang(&self) {
        self.script.lock().push_back(MockReply::Hang);
    }

    /// Sets the fallback handler used once the script is empty.
    pub fn set_handler<F>(&self, handler: F)
    where
        F: Fn(&HttpRequest) -> MockReply + Send + Sync + 'static,
    {
        *self.handler.lock() = Some(Arc::new(handler));
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Number of requests seen so far.
    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Scripted replies not consumed yet.
    pub fn remaining(&self) -> usize {
        self.script.lock().len()
    }
}

#[async_trait]
impl HttpClient for MockHttpClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportFault> {
        let reply = {
            let scripted = self.script.lock().pop_front();
            match scripted {
                Some(reply) => reply,
                None => match self.handler.lock().clone() {
                    Some(handler) => handler(&request),
                    None => MockReply::Fault(TransportFault::Connection("no scripted response".into())),
                },
            }
        };
        self.requests.lock().push(RecordedRequest {
            at: Instant::now(),
            request,
        });
        match reply {
            MockReply::Respond(response) => Ok(response),
            MockReply::Fault(fault) => Err(fault),
            MockReply::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> HttpRequest {
        HttpRequest::post(
            Url::parse("https://mail.example.com/eas?Cmd=Sync&User=alice").unwrap(),
            Bytes::from_static(b"<Sync/>"),
        )
    }

    #[test]
    fn headers_are_case_insensitive() {
        let headers = Headers::new().with("Retry-After", "5").with("X-MS-RP", "12.1");
        assert_eq!(headers.get("retry-after"), Some("5"));
        assert!(headers.contains("x-ms-rp"));
        assert!(!headers.contains("X-MS-Location"));
        assert_eq!(headers.iter().count(), 2);
    }

    #[test]
    fn content_type_strips_parameters() {
        let resp = HttpResponse::new(200).with_body("text/xml; charset=utf-8", "<a/>");
        assert_eq!(resp.content_type(), Some("text/xml"));
    }

    #[test]
    fn request_query_lookup() {
        let req = request();
        assert_eq!(req.command().as_deref(), Some("Sync"));
        assert_eq!(req.query("User").as_deref(), Some("alice"));
        assert_eq!(req.query("DeviceId"), None);
    }

    #[tokio::test]
    async fn mock_replays_script_then_handler() {
        let mock = MockHttpClient::new();
        mock.push_response(HttpResponse::new(503));
        mock.push_fault(TransportFault::Connection("reset".into()));
        mock.set_handler(|req| {
            let status = if req.command().as_deref() == Some("Sync") { 200 } else { 404 };
            MockReply::Respond(HttpResponse::new(status))
        });

        assert_eq!(mock.send(request()).await.unwrap().status, 503);
        assert!(mock.send(request()).await.unwrap_err().is_retryable());
        assert_eq!(mock.send(request()).await.unwrap().status, 200);
        assert_eq!(mock.request_count(), 3);
        assert_eq!(mock.remaining(), 0);
    }

    #[tokio::test]
    async fn mock_without_script_faults() {
        let mock = MockHttpClient::new();
        let err = mock.send(request()).await.unwrap_err();
        assert!(matches!(err, TransportFault::Connection(_)));
        assert!(!TransportFault::Request("bad".into()).is_retryable());
    }
}
