//! [`HttpClient`] backed by `reqwest`.

use crate::transport::{Headers, HttpClient, HttpRequest, HttpResponse, TransportFault};
use async_trait::async_trait;
use reqwest::redirect::Policy;

/// Production HTTP client.
///
/// Redirects are not followed: 302 and 451 carry protocol meaning and are
/// classified by the transport machine. Timeouts are the machine's job too.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Builds a client.
    pub fn new() -> Result<Self, TransportFault> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| TransportFault::Request(e.to_string()))?;
        Ok(Self { client })
    }

    /// Wraps an existing client. It should not follow redirects.
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportFault> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| TransportFault::Request(e.to_string()))?;
        let mut builder = self.client.request(method, request.url.clone());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        if let Some((user, password)) = &request.basic_auth {
            builder = builder.basic_auth(user, password.as_ref());
        }

        let response = builder.body(request.body).send().await.map_err(|e| {
            if e.is_builder() {
                TransportFault::Request(e.to_string())
            } else {
                TransportFault::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let mut headers = Headers::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str(), value);
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportFault::Connection(e.to_string()))?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}
