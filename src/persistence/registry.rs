//! 待续传登记表
//!
//! 所有未完成上传的摘要保存在同一个 JSON 文件中（`pending_uploads.json`），
//! 列出"进行中的上传"时不需要读取文件内容。
//!
//! 登记表与文件存储之间是最终一致的：登记项可能没有对应的文件内容（例如被清理），
//! 调用方在 `load` 返回 None 时应删除该登记项。

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::types::PendingUpload;
use crate::uploader::error::{UploadError, UploadResult};

/// 登记表文件名
pub const REGISTRY_FILE_NAME: &str = "pending_uploads.json";

/// 待续传登记表
#[derive(Debug)]
pub struct PendingRegistry {
    /// 登记表文件路径（None 表示不可用）
    path: Option<PathBuf>,
    /// 读-改-写互斥
    lock: Mutex<()>,
}

impl PendingRegistry {
    /// 在指定目录下打开登记表
    pub fn open(dir: &Path) -> Self {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!("登记表目录不可用 {:?}: {}", dir, e);
            return Self::unavailable();
        }
        Self {
            path: Some(dir.join(REGISTRY_FILE_NAME)),
            lock: Mutex::new(()),
        }
    }

    /// 不可用的登记表
    pub fn unavailable() -> Self {
        Self {
            path: None,
            lock: Mutex::new(()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.path.is_some()
    }

    /// 列出所有登记项
    ///
    /// 文件不存在或损坏时返回空表
    pub fn list(&self) -> BTreeMap<String, PendingUpload> {
        let Some(path) = self.path.as_deref() else {
            return BTreeMap::new();
        };
        let _guard = self.lock.lock();
        read_entries(path)
    }

    /// 新增或更新登记项
    pub fn upsert(&self, upload_id: &str, mut entry: PendingUpload) -> UploadResult<()> {
        let path = self.require_path()?;
        let _guard = self.lock.lock();

        entry.upload_id = upload_id.to_string();
        entry.updated_at = Utc::now();

        let mut entries = read_entries(path);
        entries.insert(upload_id.to_string(), entry);
        write_entries(path, &entries)?;

        debug!("已更新登记项: upload_id={}", upload_id);
        Ok(())
    }

    /// 删除登记项
    pub fn remove(&self, upload_id: &str) -> UploadResult<()> {
        let path = self.require_path()?;
        let _guard = self.lock.lock();

        let mut entries = read_entries(path);
        if entries.remove(upload_id).is_some() {
            write_entries(path, &entries)?;
            debug!("已删除登记项: upload_id={}", upload_id);
        }
        Ok(())
    }

    fn require_path(&self) -> UploadResult<&Path> {
        self.path
            .as_deref()
            .ok_or_else(|| UploadError::StorageUnavailable("登记表不可用".to_string()))
    }
}

fn read_entries(path: &Path) -> BTreeMap<String, PendingUpload> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_slice(&raw) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("登记表损坏 {:?}: {}，按空表处理", path, e);
            BTreeMap::new()
        }
    }
}

fn write_entries(path: &Path, entries: &BTreeMap<String, PendingUpload>) -> UploadResult<()> {
    let json = serde_json::to_vec(entries)
        .map_err(|e| UploadError::StorageUnavailable(format!("序列化登记表失败: {}", e)))?;

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, json)
        .and_then(|_| fs::rename(&temp_path, path))
        .map_err(|e| UploadError::StorageUnavailable(format!("写入登记表失败: {}", e)))
}
