// 上传错误定义
//
// 分片上传与直传共用一套错误分类，调用方根据 kind 展示不同提示

use thiserror::Error;

/// 上传错误类型
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UploadError {
    /// 初始化会话失败（无需清理）
    #[error("初始化上传失败: {0}")]
    InitFailed(String),
    /// 分片上传失败（整个会话失败）
    #[error("分片 #{index} 上传失败: {message}")]
    ChunkTransferFailed { index: usize, message: String },
    /// 所有分片已上传，服务器拒绝合并
    #[error("完成上传失败: {0}")]
    CompletionFailed(String),
    /// 调用方主动取消
    #[error("上传已取消")]
    Canceled,
    /// 网络错误（直传）
    #[error("网络错误: {0}")]
    Network(String),
    /// 超时（直传）
    #[error("上传超时")]
    Timeout,
    /// 响应解析失败（直传）
    #[error("解析错误: {0}")]
    Parse(String),
    /// 服务器拒绝请求（直传）
    #[error("服务器拒绝上传 ({status}): {message}")]
    ServerRejected { status: u16, message: String },
    /// 断点续传存储不可用（只影响续传能力）
    #[error("续传存储不可用: {0}")]
    StorageUnavailable(String),
    /// 调用参数无效（请求未发出）
    #[error("参数无效: {0}")]
    InvalidInput(String),
    /// 非法的状态切换
    #[error("非法状态切换: {from} -> {to}")]
    InvalidState { from: String, to: String },
}

/// 错误类别（供调用方选择提示文案）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadErrorKind {
    InitFailed,
    ChunkTransferFailed,
    CompletionFailed,
    Canceled,
    Network,
    Timeout,
    Parse,
    ServerRejected,
    StorageUnavailable,
    InvalidInput,
    InvalidState,
}

impl UploadError {
    /// 错误类别
    pub fn kind(&self) -> UploadErrorKind {
        match self {
            UploadError::InitFailed(_) => UploadErrorKind::InitFailed,
            UploadError::ChunkTransferFailed { .. } => UploadErrorKind::ChunkTransferFailed,
            UploadError::CompletionFailed(_) => UploadErrorKind::CompletionFailed,
            UploadError::Canceled => UploadErrorKind::Canceled,
            UploadError::Network(_) => UploadErrorKind::Network,
            UploadError::Timeout => UploadErrorKind::Timeout,
            UploadError::Parse(_) => UploadErrorKind::Parse,
            UploadError::ServerRejected { .. } => UploadErrorKind::ServerRejected,
            UploadError::StorageUnavailable(_) => UploadErrorKind::StorageUnavailable,
            UploadError::InvalidInput(_) => UploadErrorKind::InvalidInput,
            UploadError::InvalidState { .. } => UploadErrorKind::InvalidState,
        }
    }

    /// 是否为取消（取消不算失败）
    pub fn is_canceled(&self) -> bool {
        matches!(self, UploadError::Canceled)
    }
}

pub type UploadResult<T> = Result<T, UploadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let err = UploadError::ChunkTransferFailed {
            index: 3,
            message: "HTTP 500".to_string(),
        };
        assert_eq!(err.kind(), UploadErrorKind::ChunkTransferFailed);
        assert_eq!(err.to_string(), "分片 #3 上传失败: HTTP 500");

        assert!(UploadError::Canceled.is_canceled());
        assert!(!UploadError::Timeout.is_canceled());
    }
}
