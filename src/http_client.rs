use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;

use crate::net::{HttpResponse, HttpTransport, ServiceError};

/// 主机端 HTTP 传输：reqwest 阻塞客户端，整体请求受超时约束。
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| ServiceError::Transport(format!("http client init: {}", err)))?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn post_json(&self, url: &str, bearer: &str, body: &[u8]) -> Result<HttpResponse, ServiceError> {
        let response = self
            .client
            .post(url)
            .bearer_auth(bearer)
            .header(CONTENT_TYPE, "application/json")
            .body(body.to_vec())
            .send()
            .map_err(|err| ServiceError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|err| ServiceError::Transport(err.to_string()))?
            .to_vec();
        Ok(HttpResponse { status, body })
    }
}
