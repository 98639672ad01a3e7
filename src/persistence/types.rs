//! 续传持久化类型定义

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::uploader::session::UploadSession;

/// 续传元数据
///
/// 与文件内容分开存放，分片完成时只重写这一部分
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResumeMeta {
    /// 上传会话（初始化接口返回后保存）
    pub session: UploadSession,
    /// 已被服务器确认的分片索引
    #[serde(default)]
    pub completed_chunks: BTreeSet<usize>,
}

impl ResumeMeta {
    pub fn new(session: UploadSession) -> Self {
        Self {
            session,
            completed_chunks: BTreeSet::new(),
        }
    }

    /// 全部分片是否都已确认
    pub fn all_chunks_done(&self) -> bool {
        self.completed_chunks.len() >= self.session.total_chunks
    }
}

/// 续传记录（文件内容 + 元数据）
#[derive(Debug, Clone, PartialEq)]
pub struct ResumeRecord {
    pub upload_id: String,
    pub file: Bytes,
    pub meta: ResumeMeta,
    pub updated_at: DateTime<Utc>,
}

/// `.meta` 文件内容
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredMeta {
    pub upload_id: String,
    pub meta: ResumeMeta,
    pub updated_at: DateTime<Utc>,
}

/// 待续传登记项（轻量摘要，不含文件内容）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PendingUpload {
    pub upload_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub total_chunks: usize,
    #[serde(default)]
    pub completed_chunks: usize,
    /// 调用方附加的元数据（例如目标目录）
    #[serde(default)]
    pub extra: Map<String, Value>,
    pub updated_at: DateTime<Utc>,
}

impl PendingUpload {
    /// 从续传元数据生成摘要
    pub fn from_meta(meta: &ResumeMeta) -> Self {
        let session = &meta.session;
        Self {
            upload_id: session.upload_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            mime_type: session.mime_type.clone(),
            total_chunks: session.total_chunks,
            completed_chunks: meta.completed_chunks.len(),
            extra: session.extra.clone(),
            updated_at: Utc::now(),
        }
    }
}
