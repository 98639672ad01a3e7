// Resumable Uploader Library
// 断点续传分片上传核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 上传服务 HTTP 接口
pub mod api;

// 断点续传持久化模块
pub mod persistence;

// 上传引擎模块
pub mod uploader;

// 导出常用类型
pub use api::{HttpTransport, UploadEndpoints};
pub use config::AppConfig;
pub use persistence::{PendingUpload, ResumeRecord, ResumeStore};
pub use uploader::{
    DirectUploadOptions, DirectUploader, Privacy, UploadEngine, UploadError, UploadErrorKind,
    UploadFile, UploadOptions, UploadProgress, UploadResult, UploadState,
};
