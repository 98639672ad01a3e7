// 上传接口 HTTP 客户端

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Client, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::body::progress_body;
use crate::uploader::progress::ProgressSink;
use crate::uploader::transport::{
    extract_server_message, ChunkRequest, CompleteRequest, InitRequest, InitResponse,
    TransportError, UploadTransport,
};

/// 分片上传接口地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadEndpoints {
    pub init_url: String,
    pub chunk_url: String,
    pub complete_url: String,
}

/// 基于 reqwest 的上传传输实现
#[derive(Debug, Clone)]
pub struct HttpTransport {
    /// HTTP客户端
    client: Client,
    /// 接口地址
    endpoints: UploadEndpoints,
}

impl HttpTransport {
    /// 创建 HTTP 传输
    ///
    /// # 参数
    /// * `endpoints` - 接口地址
    /// * `request_timeout` - 单个请求超时（分片上传默认不设超时）
    pub fn new(endpoints: UploadEndpoints, request_timeout: Option<Duration>) -> Result<Self> {
        let mut builder = Client::builder();
        if let Some(timeout) = request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to create HTTP client")?;

        info!(
            "初始化上传客户端: init={}, chunk={}, complete={}",
            endpoints.init_url, endpoints.chunk_url, endpoints.complete_url
        );

        Ok(Self::with_client(client, endpoints))
    }

    /// 使用已有的 reqwest 客户端（共享连接池、自定义请求头等）
    pub fn with_client(client: Client, endpoints: UploadEndpoints) -> Self {
        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &UploadEndpoints {
        &self.endpoints
    }
}

/// reqwest 错误转换
pub(crate) fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Network(err.to_string())
    }
}

/// 读取响应：非 2xx 转为 Http 错误，空响应体为 null
pub(crate) async fn read_json(response: Response) -> Result<Value, TransportError> {
    let status = response.status();
    let text = response.text().await.map_err(map_reqwest_error)?;

    debug!("响应: status={}, body_len={}", status, text.len());

    if !status.is_success() {
        return Err(TransportError::Http {
            status: status.as_u16(),
            message: extract_server_message(&text),
        });
    }

    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    serde_json::from_str(&text).map_err(|e| TransportError::Parse(e.to_string()))
}

#[async_trait]
impl UploadTransport for HttpTransport {
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, TransportError> {
        info!(
            "初始化上传: filename={}, size={}, mime={}",
            request.filename, request.size, request.mime
        );

        let response = self
            .client
            .post(&self.endpoints.init_url)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let value = read_json(response).await?;
        let init_response: InitResponse =
            serde_json::from_value(value).map_err(|e| TransportError::Parse(e.to_string()))?;

        match init_response.upload_id.as_deref() {
            Some(id) if !id.is_empty() => {
                info!(
                    "初始化成功: uploadId={}, recommendedChunkSize={:?}",
                    id, init_response.recommended_chunk_size
                );
                Ok(init_response)
            }
            _ => {
                error!("初始化响应缺少 uploadId");
                Err(TransportError::MissingUploadId)
            }
        }
    }

    async fn upload_chunk(
        &self,
        request: ChunkRequest,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransportError> {
        let index = request.index;
        let size = request.payload.len() as u64;

        debug!(
            "上传分片: uploadId={}, part={}/{}, size={}",
            request.upload_id, index, request.total, size
        );

        let body = progress_body(request.payload.clone(), move |sent| {
            progress.report(index, sent)
        });

        // 构建 multipart form
        let part = multipart::Part::stream_with_length(body, size)
            .file_name(request.part_name())
            .mime_str("application/octet-stream")
            .map_err(map_reqwest_error)?;

        let form = multipart::Form::new()
            .text("uploadId", request.upload_id.clone())
            .text("index", index.to_string())
            .text("total", request.total.to_string())
            .part("chunk", part);

        let response = self
            .client
            .post(&self.endpoints.chunk_url)
            .multipart(form)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!("上传分片失败: part={}, status={}", index, status);
            return Err(TransportError::Http {
                status: status.as_u16(),
                message: extract_server_message(&text),
            });
        }

        debug!("上传分片成功: part={}", index);
        Ok(())
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<Value, TransportError> {
        info!("完成上传: uploadId={}", request.upload_id);

        let response = self
            .client
            .post(&self.endpoints.complete_url)
            .json(request)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        read_json(response).await
    }
}
