//! 断点续传持久化模块
//!
//! 由两部分组成：
//! - 文件存储（[`BlobStore`]）：按上传 ID 保存原始文件内容和续传元数据
//! - 登记表（[`PendingRegistry`]）：所有未完成上传的轻量摘要，一个 JSON 文件
//!
//! ## 文件结构
//!
//! ```text
//! resume/
//! ├── pending_uploads.json   # 登记表
//! ├── {upload_id}.blob       # 原始文件内容
//! └── {upload_id}.meta       # 续传元数据
//! ```
//!
//! ## 一致性
//!
//! 两部分之间是最终一致的。[`ResumeStore::recoverable`] 遍历登记表，
//! 文件内容已不存在的登记项会被直接删除（无法续传）。
//!
//! 存储失败从不影响上传本身：[`ResumeStore`] 的写入接口只记录警告。

pub mod blob_store;
pub mod registry;
pub mod types;

pub use blob_store::BlobStore;
pub use registry::{PendingRegistry, REGISTRY_FILE_NAME};
pub use types::{PendingUpload, ResumeMeta, ResumeRecord};

use bytes::Bytes;
use std::path::Path;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// 续传存储（文件存储 + 登记表）
#[derive(Debug)]
pub struct ResumeStore {
    blobs: BlobStore,
    registry: PendingRegistry,
    /// 元数据和登记项按同一顺序更新
    checkpoint_lock: Mutex<()>,
}

impl ResumeStore {
    /// 在指定目录下打开续传存储
    pub fn open(dir: &Path) -> Self {
        Self {
            blobs: BlobStore::open(dir),
            registry: PendingRegistry::open(dir),
            checkpoint_lock: Mutex::new(()),
        }
    }

    /// 不可用的续传存储
    pub fn unavailable() -> Self {
        Self {
            blobs: BlobStore::unavailable(),
            registry: PendingRegistry::unavailable(),
            checkpoint_lock: Mutex::new(()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.blobs.is_available() && self.registry.is_available()
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn registry(&self) -> &PendingRegistry {
        &self.registry
    }

    /// 保存续传检查点（文件内容 + 元数据 + 登记项）
    pub async fn checkpoint(&self, file: &Bytes, meta: &ResumeMeta) {
        let _guard = self.checkpoint_lock.lock().await;
        let upload_id = &meta.session.upload_id;

        if let Err(e) = self.blobs.save(upload_id, file, meta).await {
            warn!(
                "保存续传记录失败，本次上传不支持续传: upload_id={}, 错误: {}",
                upload_id, e
            );
            return;
        }
        if let Err(e) = self.registry.upsert(upload_id, PendingUpload::from_meta(meta)) {
            warn!("更新登记表失败: upload_id={}, 错误: {}", upload_id, e);
        }
    }

    /// 记录分片已被服务器确认
    pub async fn record_chunk_done(&self, upload_id: &str, chunk_index: usize) {
        let _guard = self.checkpoint_lock.lock().await;
        let mut summary = None;
        let result = self
            .blobs
            .update_meta(upload_id, |meta| {
                meta.completed_chunks.insert(chunk_index);
                summary = Some(PendingUpload::from_meta(meta));
            })
            .await;

        match result {
            Ok(true) => {
                if let Some(entry) = summary {
                    if let Err(e) = self.registry.upsert(upload_id, entry) {
                        warn!("更新登记表失败: upload_id={}, 错误: {}", upload_id, e);
                    }
                }
            }
            Ok(false) => {
                debug!("续传记录不存在，跳过检查点: upload_id={}", upload_id);
            }
            Err(e) => {
                warn!(
                    "记录分片完成失败: upload_id={}, chunk={}, 错误: {}",
                    upload_id, chunk_index, e
                );
            }
        }
    }

    /// 删除续传记录和登记项
    pub async fn discard(&self, upload_id: &str) {
        let _guard = self.checkpoint_lock.lock().await;
        if let Err(e) = self.blobs.delete(upload_id).await {
            warn!("删除续传记录失败: upload_id={}, 错误: {}", upload_id, e);
        }
        if let Err(e) = self.registry.remove(upload_id) {
            warn!("删除登记项失败: upload_id={}, 错误: {}", upload_id, e);
        }
    }

    /// 列出所有可续传的上传
    ///
    /// 文件内容已不存在的登记项会被删除
    pub async fn recoverable(&self) -> Vec<ResumeRecord> {
        let entries = self.registry.list();
        let mut records = Vec::with_capacity(entries.len());

        for upload_id in entries.keys() {
            match self.blobs.load(upload_id).await {
                Some(record) => records.push(record),
                None => {
                    info!("续传文件已不存在，删除登记项: upload_id={}", upload_id);
                    self.discard(upload_id).await;
                }
            }
        }

        info!("可续传的上传: {} 个", records.len());
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::session::UploadSession;
    use serde_json::{json, Map};

    fn meta(upload_id: &str, file_size: u64, total_chunks: usize) -> ResumeMeta {
        ResumeMeta::new(UploadSession {
            upload_id: upload_id.to_string(),
            total_chunks,
            chunk_size: file_size.div_ceil(total_chunks as u64),
            file_name: format!("{}.bin", upload_id),
            file_size,
            mime_type: "application/octet-stream".to_string(),
            extra: Map::new(),
        })
    }

    #[tokio::test]
    async fn test_checkpoint_and_record_chunk_done() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::open(dir.path());
        assert!(store.is_available());

        let file = Bytes::from(vec![7u8; 30]);
        store.checkpoint(&file, &meta("up-1", 30, 3)).await;

        store.record_chunk_done("up-1", 2).await;
        store.record_chunk_done("up-1", 0).await;

        let entries = store.registry().list();
        assert_eq!(entries["up-1"].completed_chunks, 2);
        assert_eq!(entries["up-1"].total_chunks, 3);

        let records = store.recoverable().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file, file);
        assert_eq!(
            records[0].meta.completed_chunks.iter().copied().collect::<Vec<_>>(),
            vec![0, 2]
        );
    }

    #[tokio::test]
    async fn test_registry_entry_keeps_caller_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::open(dir.path());

        let mut with_folder = meta("up-4", 20, 2);
        with_folder.session.extra.insert("folder".to_string(), json!("/inbox"));
        store.checkpoint(&Bytes::from(vec![3u8; 20]), &with_folder).await;
        store.record_chunk_done("up-4", 1).await;

        let entry = &store.registry().list()["up-4"];
        assert_eq!(entry.extra["folder"], json!("/inbox"));
        assert_eq!(entry.completed_chunks, 1);
    }

    #[tokio::test]
    async fn test_discard_removes_both_parts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::open(dir.path());

        store.checkpoint(&Bytes::from(vec![1u8; 10]), &meta("up-2", 10, 1)).await;
        store.discard("up-2").await;

        assert!(store.blobs().load("up-2").await.is_none());
        assert!(store.registry().list().is_empty());
        assert!(store.recoverable().await.is_empty());
    }

    #[tokio::test]
    async fn test_recoverable_drops_orphan_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = ResumeStore::open(dir.path());

        store.checkpoint(&Bytes::from(vec![1u8; 10]), &meta("keep", 10, 1)).await;
        store.checkpoint(&Bytes::from(vec![2u8; 10]), &meta("evicted", 10, 1)).await;
        std::fs::remove_file(dir.path().join("evicted.blob")).unwrap();

        let records = store.recoverable().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].upload_id, "keep");

        let entries = store.registry().list();
        assert!(entries.contains_key("keep"));
        assert!(!entries.contains_key("evicted"));
    }

    #[tokio::test]
    async fn test_unavailable_store_swallows_errors() {
        let store = ResumeStore::unavailable();
        assert!(!store.is_available());

        store.checkpoint(&Bytes::from_static(b"x"), &meta("up-3", 1, 1)).await;
        store.record_chunk_done("up-3", 0).await;
        store.discard("up-3").await;
        assert!(store.recoverable().await.is_empty());
    }
}
