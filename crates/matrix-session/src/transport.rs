//! HTTP 传输层
//!
//! 引擎只需要「发请求，拿到状态码 + 原始字节」；状态码不在这一层解释。

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, Method, Url};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::HttpClientConfig;
use crate::error::{MatrixError, Result};
use crate::version::version_string;

/// 一次请求的原始响应
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 非 2xx 转为 `MatrixError::Http`
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(MatrixError::Http {
                status: self.status,
                body: String::from_utf8_lossy(&self.body).into_owned(),
            })
        }
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.body).map_err(|e| MatrixError::Decode(e.to_string()))
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// `path` 为已编码的绝对路径（以 `/` 开头），`params` 为查询参数
    async fn send_request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse>;
}

/// 把若干路径段拼成已编码的路径，每段单独百分号编码
pub fn encode_path(segments: &[&str]) -> Result<String> {
    let mut url = Url::parse("http://localhost/").map_err(|e| MatrixError::Runtime(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| MatrixError::Runtime("URL 不能作为路径基址".to_string()))?
        .clear()
        .extend(segments);
    Ok(url.path().to_string())
}

/// 基于 reqwest 的传输实现
pub struct HttpTransport {
    client: Client,
    base_url: Url,
    access_token: Option<String>,
}

impl HttpTransport {
    pub fn new(homeserver: &str, access_token: Option<String>, config: &HttpClientConfig) -> Result<Self> {
        let base_url = Url::parse(homeserver)
            .map_err(|e| MatrixError::Config(format!("无效的 homeserver 地址 {}: {}", homeserver, e)))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(version_string())
            .build()
            .map_err(|e| MatrixError::Transport(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ HTTP 传输已创建 (homeserver: {})", base_url);
        Ok(Self {
            client,
            base_url,
            access_token,
        })
    }

    fn url_for(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| MatrixError::InvalidData(format!("无效的请求路径 {}: {}", path, e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        let url = self.url_for(path)?;
        debug!("➡️ {} {}", method, url.path());

        let mut request = self.client.request(method, url).query(params);
        if let Some(token) = &self.access_token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        debug!("⬅️ {} ({} bytes)", status, body.len());
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn encodes_each_segment() {
        let encoded = encode_path(&["_matrix", "client", "v3", "user", "@a:hs", "account_data", "m.x y"]).unwrap();
        assert_eq!(encoded, "/_matrix/client/v3/user/@a:hs/account_data/m.x%20y");
    }

    #[test]
    fn error_for_status_keeps_body() {
        let err = HttpResponse::new(429, "slow down").error_for_status().unwrap_err();
        assert_eq!(err, MatrixError::Http { status: 429, body: "slow down".into() });
    }

    #[tokio::test]
    async fn sends_query_and_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/sync"))
            .and(query_param("since", "s1"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"next_batch":"s2"}"#))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), Some("tok".into()), &HttpClientConfig::default()).unwrap();
        let response = transport
            .send_request(
                Method::GET,
                "/_matrix/client/v3/sync",
                &[("since".to_string(), "s1".to_string())],
                None,
            )
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.json::<serde_json::Value>().unwrap()["next_batch"], "s2");
    }

    #[tokio::test]
    async fn non_success_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let transport = HttpTransport::new(&server.uri(), None, &HttpClientConfig::default()).unwrap();
        let response = transport
            .send_request(Method::GET, "/anything", &[], None)
            .await
            .unwrap();
        assert_eq!(response.status, 502);
        assert!(!response.is_success());
    }

    #[test]
    fn rejects_invalid_homeserver() {
        let result = HttpTransport::new("not a url", None, &HttpClientConfig::default());
        assert!(matches!(result, Err(MatrixError::Config(_))));
    }
}
