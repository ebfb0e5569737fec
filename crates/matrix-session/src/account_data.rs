//! 用户级账户数据（account data）
//!
//! 以字符串类型名为键的远端 JSON 存储。SecretStore 通过它读写 key description、默认 key 指针和加密后的 secret。

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::transport::{encode_path, Transport};

#[async_trait]
pub trait AccountDataChannel: Send + Sync {
    /// 不存在时返回 `Ok(None)`
    async fn get_account_data(&self, data_type: &str) -> Result<Option<serde_json::Value>>;

    async fn put_account_data(&self, data_type: &str, value: serde_json::Value) -> Result<()>;
}

/// `GET|PUT /_matrix/client/v3/user/{userId}/account_data/{type}`
pub struct HttpAccountData {
    transport: Arc<dyn Transport>,
    user_id: String,
}

impl HttpAccountData {
    pub fn new(transport: Arc<dyn Transport>, user_id: impl Into<String>) -> Self {
        Self {
            transport,
            user_id: user_id.into(),
        }
    }

    fn path(&self, data_type: &str) -> Result<String> {
        encode_path(&["_matrix", "client", "v3", "user", &self.user_id, "account_data", data_type])
    }
}

#[async_trait]
impl AccountDataChannel for HttpAccountData {
    async fn get_account_data(&self, data_type: &str) -> Result<Option<serde_json::Value>> {
        let response = self
            .transport
            .send_request(Method::GET, &self.path(data_type)?, &[], None)
            .await?;
        if response.status == 404 {
            debug!("account data {} 不存在", data_type);
            return Ok(None);
        }
        let response = response.error_for_status()?;
        Ok(Some(response.json()?))
    }

    async fn put_account_data(&self, data_type: &str, value: serde_json::Value) -> Result<()> {
        self.transport
            .send_request(Method::PUT, &self.path(data_type)?, &[], Some(value))
            .await?
            .error_for_status()?;
        debug!("📤 account data {} 已上传", data_type);
        Ok(())
    }
}

/// 进程内实现
#[derive(Debug, Default)]
pub struct MemoryAccountData {
    entries: RwLock<HashMap<String, serde_json::Value>>,
}

impl MemoryAccountData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl AccountDataChannel for MemoryAccountData {
    async fn get_account_data(&self, data_type: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.entries.read().get(data_type).cloned())
    }

    async fn put_account_data(&self, data_type: &str, value: serde_json::Value) -> Result<()> {
        self.entries.write().insert(data_type.to_string(), value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpClientConfig;
    use crate::error::MatrixError;
    use crate::transport::HttpTransport;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn channel(server: &MockServer) -> HttpAccountData {
        let transport = HttpTransport::new(&server.uri(), Some("tok".into()), &HttpClientConfig::default()).unwrap();
        HttpAccountData::new(Arc::new(transport), "@alice:hs")
    }

    #[tokio::test]
    async fn missing_type_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/user/@alice:hs/account_data/m.secret_storage.default_key"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"errcode": "M_NOT_FOUND"})))
            .mount(&server)
            .await;

        let data = channel(&server).await;
        assert_eq!(data.get_account_data("m.secret_storage.default_key").await.unwrap(), None);
    }

    #[tokio::test]
    async fn get_and_put_round_trip_through_http() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/_matrix/client/v3/user/@alice:hs/account_data/m.direct"))
            .and(body_json(json!({"@bob:hs": ["!dm:hs"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_matrix/client/v3/user/@alice:hs/account_data/m.direct"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"@bob:hs": ["!dm:hs"]})))
            .mount(&server)
            .await;

        let data = channel(&server).await;
        data.put_account_data("m.direct", json!({"@bob:hs": ["!dm:hs"]})).await.unwrap();
        let value = data.get_account_data("m.direct").await.unwrap().unwrap();
        assert_eq!(value["@bob:hs"][0], "!dm:hs");
    }

    #[tokio::test]
    async fn server_error_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let data = channel(&server).await;
        let err = data.get_account_data("m.direct").await.unwrap_err();
        assert_eq!(err.http_status(), Some(500));
        assert!(matches!(err, MatrixError::Http { .. }));
    }

    #[tokio::test]
    async fn memory_channel_overwrites() {
        let data = MemoryAccountData::new();
        data.put_account_data("t", json!(1)).await.unwrap();
        data.put_account_data("t", json!(2)).await.unwrap();
        assert_eq!(data.get_account_data("t").await.unwrap(), Some(json!(2)));
        assert_eq!(data.len(), 1);
    }
}
