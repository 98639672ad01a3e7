// 上传会话与状态机
//
// 状态流转：
//   Idle → Initializing → Transferring → Completing → Completed
//   Initializing / Transferring / Completing → Failed | Canceled
//   Idle → Transferring              （断点续传，跳过初始化）
//   Failed → Completing              （仅在所有分片已上传后重试合并）

use anyhow::{Context, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

use super::error::UploadError;

/// 默认 MIME 类型
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

/// 上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    /// 未开始
    Idle,
    /// 初始化会话中
    Initializing,
    /// 分片上传中
    Transferring,
    /// 合并中
    Completing,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Canceled,
}

impl UploadState {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// 是否为活跃状态（可以被取消）
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::Transferring | Self::Completing
        )
    }

    /// 检查状态切换是否合法
    pub fn can_transition_to(&self, next: UploadState) -> bool {
        use UploadState::*;
        match (self, next) {
            (Idle, Initializing) | (Idle, Transferring) => true,
            (Initializing, Transferring) => true,
            (Transferring, Completing) => true,
            (Completing, Completed) => true,
            (Failed, Completing) => true,
            (from, Failed) | (from, Canceled) => from.is_active(),
            _ => false,
        }
    }

    /// 切换状态，非法切换返回错误
    pub fn transition(&mut self, next: UploadState) -> Result<(), UploadError> {
        if !self.can_transition_to(next) {
            return Err(UploadError::InvalidState {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Initializing => write!(f, "initializing"),
            Self::Transferring => write!(f, "transferring"),
            Self::Completing => write!(f, "completing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// 待上传文件（已读入内存）
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// 文件名
    pub name: String,
    /// MIME 类型
    pub mime_type: String,
    /// 文件内容
    pub data: Bytes,
    /// 调用方附加的元数据（初始化和完成接口都会带上）
    pub extra: Map<String, Value>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: DEFAULT_MIME_TYPE.to_string(),
            data: data.into(),
            extra: Map::new(),
        }
    }

    /// 从本地路径读取文件
    pub async fn from_path(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("读取上传文件失败: {:?}", path))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        Ok(Self::new(name, data))
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = mime_type.into();
        self
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    /// 文件大小
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// 上传会话（初始化接口返回后创建，之后不再修改）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadSession {
    /// 服务器分配的上传 ID
    pub upload_id: String,
    /// 总分片数
    pub total_chunks: usize,
    /// 分片大小
    pub chunk_size: u64,
    /// 文件名
    pub file_name: String,
    /// 文件大小
    pub file_size: u64,
    /// MIME 类型
    pub mime_type: String,
    /// 附加元数据
    #[serde(default)]
    pub extra: Map<String, Value>,
}
