//! Shared HTTP plumbing for the network-backed adapter variants.
//!
//! Wraps a pooled reqwest client with the provider's base URL, default
//! headers and auth strategy, maps error responses to the adapter error
//! taxonomy, and splits SSE bodies into `data:` payload lines.

use futures::Stream;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::error::AdapterError;

#[derive(Clone, Debug)]
pub enum AuthStrategy {
    Bearer { token: String },
    Header { name: String, value: String },
    Basic { username: String, password: String },
    None,
}

#[derive(Clone)]
pub struct HttpProviderClient {
    http: Client,
    base_url: String,
    default_headers: HeaderMap,
    basic: Option<(String, String)>,
}

impl HttpProviderClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        headers: &HashMap<String, String>,
        auth: AuthStrategy,
    ) -> Result<Self, AdapterError> {
        let mut default_headers = HeaderMap::new();
        let mut basic = None;

        match auth {
            AuthStrategy::Bearer { token } => {
                let value = format!("Bearer {token}")
                    .parse()
                    .map_err(|_| AdapterError::config("credential is not a valid header value"))?;
                default_headers.insert("Authorization", value);
            }
            AuthStrategy::Header { name, value } => {
                let name = name
                    .parse::<reqwest::header::HeaderName>()
                    .map_err(|_| AdapterError::config(format!("invalid auth header name {name}")))?;
                let value = value
                    .parse()
                    .map_err(|_| AdapterError::config("credential is not a valid header value"))?;
                default_headers.insert(name, value);
            }
            AuthStrategy::Basic { username, password } => {
                basic = Some((username, password));
            }
            AuthStrategy::None => {}
        }

        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (k.parse::<reqwest::header::HeaderName>(), v.parse()) {
                default_headers.insert(name, value);
            }
        }

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_headers,
            basic,
        })
    }

    fn build_url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn request(&self, method: Method, path: &str, timeout: Duration) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, self.build_url(path))
            .headers(self.default_headers.clone())
            .timeout(timeout);
        if let Some((username, password)) = &self.basic {
            builder = builder.basic_auth(username, Some(password));
        }
        builder
    }

    pub async fn post_json<TReq: Serialize, TResp: DeserializeOwned>(
        &self,
        path: &str,
        body: &TReq,
        timeout: Duration,
    ) -> Result<TResp, AdapterError> {
        let resp = self
            .request(Method::POST, path, timeout)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }

    /// POST returning the raw response, for streaming bodies. The status
    /// is still checked here so callers only see committed streams.
    pub async fn post_json_raw<TReq: Serialize>(
        &self,
        path: &str,
        body: &TReq,
        timeout: Duration,
    ) -> Result<Response, AdapterError> {
        let resp = self
            .request(Method::POST, path, timeout)
            .json(body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp)
    }

    /// POST a raw JSON value with extra per-request headers, used by the
    /// proxy variant's header forwarding.
    pub async fn post_value_with_headers(
        &self,
        path: &str,
        body: &serde_json::Value,
        extra: &HashMap<String, String>,
        timeout: Duration,
    ) -> Result<Response, AdapterError> {
        let mut builder = self.request(Method::POST, path, timeout).json(body);
        for (k, v) in extra {
            if let (Ok(name), Ok(value)) = (
                k.parse::<reqwest::header::HeaderName>(),
                v.parse::<reqwest::header::HeaderValue>(),
            ) {
                builder = builder.header(name, value);
            }
        }
        let resp = builder.send().await?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp)
    }

    pub async fn get_json<TResp: DeserializeOwned>(
        &self,
        path: &str,
        timeout: Duration,
    ) -> Result<TResp, AdapterError> {
        let resp = self.request(Method::GET, path, timeout).send().await?;
        if !resp.status().is_success() {
            return Err(map_error_response(resp).await);
        }
        Ok(resp.json::<TResp>().await?)
    }
}

/// Fold a non-success response into the error taxonomy, pulling a
/// message out of the common JSON error shapes when present.
pub async fn map_error_response(resp: Response) -> AdapterError {
    let status = resp.status().as_u16();
    let message = match resp.text().await {
        Ok(body) => serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| {
                v.get("error")
                    .and_then(|e| e.get("message").or(Some(e)))
                    .and_then(|m| m.as_str().map(str::to_string))
            })
            .unwrap_or(body),
        Err(_) => "failed to read error response".to_string(),
    };
    AdapterError::from_status(status, format!("upstream returned {status}: {message}"))
}

/// Split an SSE or NDJSON body into payload lines.
///
/// For SSE frames the `data: ` prefix is stripped and the `[DONE]`
/// sentinel ends the stream; bare NDJSON lines pass through unchanged.
/// One upstream read is issued only per consumed line, so transport
/// backpressure propagates to the upstream socket.
pub fn payload_lines(
    response: Response,
) -> impl Stream<Item = Result<String, AdapterError>> + Send {
    async_stream::stream! {
        let mut bytes_stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
            match chunk_result {
                Ok(chunk) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(line_end) = buffer.find('\n') {
                        let line = buffer[..line_end].trim().to_string();
                        buffer = buffer[line_end + 1..].to_string();

                        if line.is_empty() {
                            continue;
                        }
                        if let Some(payload) = line.strip_prefix("data:") {
                            let payload = payload.trim();
                            if payload == "[DONE]" {
                                return;
                            }
                            yield Ok(payload.to_string());
                        } else {
                            yield Ok(line);
                        }
                    }
                }
                Err(e) => {
                    yield Err(AdapterError::from(e));
                    return;
                }
            }
        }
    }
}
