//! The production [`HttpClient`]: a thin `reqwest` wrapper. The core never retries
//! inside the client itself (spec.md §6.1) — retry is entirely the Retry
//! Controller's concern; this type's only job is to turn an [`HttpRequest`] into
//! an [`HttpResponse`] or a failure.

use async_trait::async_trait;

use crate::repo::HttpClient;
use crate::types::{HttpRequest, HttpResponse};

/// Wraps a single shared `reqwest::Client` (connection pooling, keep-alive).
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn send(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let response = builder.body(request.body).send().await?;
        Ok(HttpResponse { status: response.status().as_u16() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_body_and_headers_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/webhook"))
            .and(body_string("event payload"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let client = ReqwestHttpClient::new();
        let request = HttpRequest {
            url: format!("{}/webhook", server.uri()),
            headers: vec![("Accept".to_string(), "*/*".to_string())],
            body: "event payload".to_string(),
        };

        let response = client.send(request).await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn surfaces_non_2xx_status_without_treating_it_as_an_io_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(503)).mount(&server).await;

        let client = ReqwestHttpClient::new();
        let request = HttpRequest { url: server.uri(), headers: vec![], body: String::new() };

        let response = client.send(request).await.unwrap();
        assert!(!response.is_success());
        assert_eq!(response.status, 503);
    }

    #[tokio::test]
    async fn connection_failure_is_an_error_not_a_response() {
        let client = ReqwestHttpClient::new();
        let request = HttpRequest { url: "http://127.0.0.1:1".to_string(), headers: vec![], body: String::new() };

        assert!(client.send(request).await.is_err());
    }
}
