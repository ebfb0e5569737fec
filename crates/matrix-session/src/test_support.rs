//! 测试用的脚本化传输

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use std::collections::VecDeque;
use std::time::Duration;

use crate::error::{MatrixError, Result};
use crate::transport::{HttpResponse, Transport};

/// 一次被记录的请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: Method,
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl RecordedRequest {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// 按顺序返回预置响应；脚本耗尽后返回传输错误
#[derive(Default)]
pub struct MockTransport {
    script: Mutex<VecDeque<Result<HttpResponse>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    delay: Option<Duration>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 每个请求在返回前等待 `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn push_response(&self, response: HttpResponse) {
        self.script.lock().push_back(Ok(response));
    }

    pub fn push_json(&self, body: serde_json::Value) {
        self.push_response(HttpResponse::new(200, body.to_string()));
    }

    pub fn push_error(&self, error: MatrixError) {
        self.script.lock().push_back(Err(error));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_request(
        &self,
        method: Method,
        path: &str,
        params: &[(String, String)],
        body: Option<serde_json::Value>,
    ) -> Result<HttpResponse> {
        self.requests.lock().push(RecordedRequest {
            method,
            path: path.to_string(),
            params: params.to_vec(),
            body,
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(MatrixError::Transport("no scripted response".to_string())))
    }
}
