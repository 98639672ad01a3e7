// 直传（不分片）
//
// 小文件一次请求上传：multipart 中每个文件一个 `file` 字段，可选 `privacy` 字段。
// 进度回调与分片上传相同；固定 5 分钟超时。

use anyhow::{Context, Result};
use reqwest::{multipart, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::error::{UploadError, UploadResult};
use super::progress::{ProgressCallback, ProgressSink, ProgressTracker};
use super::session::UploadFile;
use super::transport::TransportError;
use crate::api::body::progress_body;
use crate::api::client::{map_reqwest_error, read_json};

/// 直传超时: 5 分钟
pub const DIRECT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// 默认直传路径
pub const DEFAULT_DIRECT_UPLOAD_PATH: &str = "/api/upload";

/// 文件可见性
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Privacy {
    Public,
    Private,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Private => "private",
        }
    }
}

/// 直传选项
#[derive(Clone, Default)]
pub struct DirectUploadOptions {
    /// 可见性（不设置则不发送该字段）
    pub privacy: Option<Privacy>,
    /// 进度回调
    pub progress: Option<ProgressCallback>,
    /// 取消令牌
    pub cancel_token: Option<CancellationToken>,
}

/// 直传客户端
#[derive(Debug, Clone)]
pub struct DirectUploader {
    client: Client,
    url: String,
    timeout: Duration,
}

impl DirectUploader {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self::with_client(client, url))
    }

    pub fn with_client(client: Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            timeout: DIRECT_UPLOAD_TIMEOUT,
        }
    }

    /// 上传一个或多个文件
    ///
    /// # 返回
    /// 服务器返回的 JSON（文件列表为空时直接返回 `InvalidInput`）
    pub async fn upload(
        &self,
        files: Vec<UploadFile>,
        options: DirectUploadOptions,
    ) -> UploadResult<Value> {
        if files.is_empty() {
            return Err(UploadError::InvalidInput("没有要上传的文件".to_string()));
        }

        let sizes: Vec<u64> = files.iter().map(|f| f.size()).collect();
        let tracker = Arc::new(ProgressTracker::new(sizes, options.progress.clone()));

        info!(
            "直传开始: url={}, 文件数={}, 总大小={} bytes",
            self.url,
            files.len(),
            tracker.total_bytes()
        );

        let mut form = multipart::Form::new();
        for (index, file) in files.into_iter().enumerate() {
            let sink = tracker.clone();
            let size = file.size();
            let body = progress_body(file.data, move |sent| sink.report(index, sent));
            let part = multipart::Part::stream_with_length(body, size)
                .file_name(file.name)
                .mime_str(&file.mime_type)
                .map_err(|e| UploadError::Parse(format!("无效的 MIME 类型: {}", e)))?;
            form = form.part("file", part);
        }
        if let Some(privacy) = options.privacy {
            form = form.text("privacy", privacy.as_str());
        }

        let request = async {
            let response = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .multipart(form)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            read_json(response).await
        };

        let result = match &options.cancel_token {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(TransportError::Canceled),
                r = request => r,
            },
            None => request.await,
        };

        match result {
            Ok(value) => {
                for index in 0..tracker.chunk_count() {
                    tracker.mark_chunk_done(index);
                }
                info!("直传完成: url={}", self.url);
                Ok(value)
            }
            Err(TransportError::Canceled) => {
                warn!("直传已取消: url={}", self.url);
                Err(UploadError::Canceled)
            }
            Err(e) => {
                error!("直传失败: url={}, 错误: {}", self.url, e);
                Err(map_direct_error(e))
            }
        }
    }
}

/// 传输错误转换为直传错误
fn map_direct_error(err: TransportError) -> UploadError {
    match err {
        TransportError::Canceled => UploadError::Canceled,
        TransportError::Timeout => UploadError::Timeout,
        TransportError::Network(msg) => UploadError::Network(msg),
        TransportError::Parse(msg) => UploadError::Parse(msg),
        TransportError::Http { status, message } => UploadError::ServerRejected {
            status,
            message: message.unwrap_or_else(|| format!("HTTP {}", status)),
        },
        TransportError::MissingUploadId => UploadError::Parse("响应缺少 uploadId".to_string()),
    }
}
