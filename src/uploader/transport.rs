// 上传传输层
//
// 三个接口（由调用方提供 URL）：
//
// | 接口     | 请求体                                                   | 响应                                          |
// |----------|----------------------------------------------------------|-----------------------------------------------|
// | init     | JSON `{ filename, size, mime, ...extra }`                | `{ uploadId, recommendedChunkSize? }`         |
// | chunk    | multipart `uploadId` / `index` / `total` / `chunk`       | 2xx 即成功                                     |
// | complete | JSON `{ uploadId, ...extra }`                            | 调用方定义的 JSON，原样返回                     |
//
// 分片文件名为 `<filename>.part-<index>`，index/total 为十进制字符串。

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

use super::progress::ProgressSink;

/// 初始化请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitRequest {
    pub filename: String,
    pub size: u64,
    pub mime: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 初始化响应
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitResponse {
    #[serde(default)]
    pub upload_id: Option<String>,
    #[serde(default)]
    pub recommended_chunk_size: Option<u64>,
}

/// 分片请求
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub upload_id: String,
    pub index: usize,
    pub total: usize,
    pub file_name: String,
    pub payload: Bytes,
}

impl ChunkRequest {
    /// multipart 中的分片文件名
    pub fn part_name(&self) -> String {
        format!("{}.part-{}", self.file_name, self.index)
    }
}

/// 完成请求
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompleteRequest {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// 传输错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 请求被取消
    Canceled,
    /// 服务器返回非成功状态
    Http { status: u16, message: Option<String> },
    /// 网络错误
    Network(String),
    /// 超时
    Timeout,
    /// 响应解析失败
    Parse(String),
    /// 初始化响应缺少 uploadId
    MissingUploadId,
}

impl TransportError {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        match self {
            TransportError::Network(_) | TransportError::Timeout => true,
            TransportError::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// 面向用户的错误信息（优先使用服务器返回的信息）
    pub fn message(&self) -> String {
        match self {
            TransportError::Canceled => "请求已取消".to_string(),
            TransportError::Http {
                message: Some(msg), ..
            } => msg.clone(),
            TransportError::Http {
                status,
                message: None,
            } => format!("HTTP {}", status),
            TransportError::Network(msg) => msg.clone(),
            TransportError::Timeout => "请求超时".to_string(),
            TransportError::Parse(msg) => format!("响应解析失败: {}", msg),
            TransportError::MissingUploadId => "服务器未返回 uploadId".to_string(),
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for TransportError {}

/// 上传传输接口
///
/// 取消由上层通过丢弃 future 实现，实现方无需关心取消令牌
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 初始化上传会话
    async fn init(&self, request: &InitRequest) -> Result<InitResponse, TransportError>;

    /// 上传单个分片，发送过程中通过 `progress` 报告累计字节数
    async fn upload_chunk(
        &self,
        request: ChunkRequest,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<(), TransportError>;

    /// 完成上传（服务器合并分片）
    async fn complete(&self, request: &CompleteRequest) -> Result<Value, TransportError>;
}

/// 从错误响应体中提取服务器信息（`error` 或 `message` 字段）
pub fn extract_server_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    ["error", "message"]
        .iter()
        .filter_map(|key| value.get(*key))
        .find_map(|v| v.as_str().map(str::to_string))
        .filter(|s| !s.is_empty())
}
