//! 续传文件存储
//!
//! 每个上传一组文件：
//!
//! ```text
//! resume/
//! ├── {upload_id}.blob    # 原始文件内容
//! └── {upload_id}.meta    # 续传元数据（JSON 格式）
//! ```
//!
//! 写入先落临时文件再原子重命名。目录不可用时退化为"不支持续传"：
//! 写入/删除返回 `StorageUnavailable`，读取返回 `None`。

use bytes::Bytes;
use chrono::Utc;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::types::{ResumeMeta, ResumeRecord, StoredMeta};
use crate::uploader::error::{UploadError, UploadResult};

/// 文件内容扩展名
const BLOB_EXTENSION: &str = "blob";

/// 元数据扩展名
const META_EXTENSION: &str = "meta";

/// 续传文件存储
#[derive(Debug)]
pub struct BlobStore {
    /// 存储目录（None 表示不可用）
    dir: Option<PathBuf>,
    /// 写锁（同一进程内串行化写入，避免临时文件互相覆盖）
    write_lock: Mutex<()>,
}

impl BlobStore {
    /// 打开存储目录，目录无法创建时返回不可用的存储
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        match std::fs::create_dir_all(&dir) {
            Ok(()) => {
                debug!("续传存储目录: {:?}", dir);
                Self {
                    dir: Some(dir),
                    write_lock: Mutex::new(()),
                }
            }
            Err(e) => {
                warn!("续传存储目录不可用 {:?}: {}，续传功能关闭", dir, e);
                Self::unavailable()
            }
        }
    }

    /// 不可用的存储
    pub fn unavailable() -> Self {
        Self {
            dir: None,
            write_lock: Mutex::new(()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.dir.is_some()
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn require_dir(&self) -> UploadResult<&Path> {
        self.dir
            .as_deref()
            .ok_or_else(|| UploadError::StorageUnavailable("存储目录不可用".to_string()))
    }

    /// 保存续传记录
    pub async fn save(&self, upload_id: &str, file: &Bytes, meta: &ResumeMeta) -> UploadResult<()> {
        let dir = self.require_dir()?;
        let _guard = self.write_lock.lock().await;

        write_atomic(&blob_path(dir, upload_id), file).await?;
        write_meta(dir, upload_id, meta).await?;

        debug!(
            "已保存续传记录: upload_id={}, size={} bytes",
            upload_id,
            file.len()
        );
        Ok(())
    }

    /// 加载续传记录
    ///
    /// 文件缺失、不完整或解析失败都返回 None
    pub async fn load(&self, upload_id: &str) -> Option<ResumeRecord> {
        let dir = self.dir.as_deref()?;

        let meta_path = meta_path(dir, upload_id);
        let raw = match fs::read(&meta_path).await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("续传元数据不存在 {:?}: {}", meta_path, e);
                return None;
            }
        };
        let stored: StoredMeta = match serde_json::from_slice(&raw) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("解析续传元数据失败 {:?}: {}", meta_path, e);
                return None;
            }
        };

        let blob_path = blob_path(dir, upload_id);
        let file = match fs::read(&blob_path).await {
            Ok(data) => Bytes::from(data),
            Err(e) => {
                warn!("续传文件内容缺失 {:?}: {}", blob_path, e);
                return None;
            }
        };

        if file.len() as u64 != stored.meta.session.file_size {
            warn!(
                "续传文件大小不匹配: upload_id={}, 期望={}, 实际={}",
                upload_id,
                stored.meta.session.file_size,
                file.len()
            );
            return None;
        }

        Some(ResumeRecord {
            upload_id: stored.upload_id,
            file,
            meta: stored.meta,
            updated_at: stored.updated_at,
        })
    }

    /// 更新元数据（不重写文件内容）
    ///
    /// # Returns
    /// - `Ok(true)` - 更新成功
    /// - `Ok(false)` - 记录不存在
    pub async fn update_meta<F>(&self, upload_id: &str, updater: F) -> UploadResult<bool>
    where
        F: FnOnce(&mut ResumeMeta),
    {
        let dir = self.require_dir()?;
        let _guard = self.write_lock.lock().await;

        let raw = match fs::read(meta_path(dir, upload_id)).await {
            Ok(raw) => raw,
            Err(_) => return Ok(false),
        };
        let mut stored: StoredMeta = serde_json::from_slice(&raw)
            .map_err(|e| UploadError::StorageUnavailable(format!("解析续传元数据失败: {}", e)))?;

        updater(&mut stored.meta);
        write_meta(dir, upload_id, &stored.meta).await?;
        Ok(true)
    }

    /// 删除续传记录（不存在视为成功）
    pub async fn delete(&self, upload_id: &str) -> UploadResult<()> {
        let dir = self.require_dir()?;
        let _guard = self.write_lock.lock().await;

        for path in [blob_path(dir, upload_id), meta_path(dir, upload_id)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(UploadError::StorageUnavailable(format!(
                        "删除 {:?} 失败: {}",
                        path, e
                    )))
                }
            }
        }

        debug!("已删除续传记录: upload_id={}", upload_id);
        Ok(())
    }
}

/// 上传 ID 由服务器分配，编码后作为文件名
fn file_stem(upload_id: &str) -> String {
    urlencoding::encode(upload_id).into_owned()
}

fn blob_path(dir: &Path, upload_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", file_stem(upload_id), BLOB_EXTENSION))
}

fn meta_path(dir: &Path, upload_id: &str) -> PathBuf {
    dir.join(format!("{}.{}", file_stem(upload_id), META_EXTENSION))
}

async fn write_meta(dir: &Path, upload_id: &str, meta: &ResumeMeta) -> UploadResult<()> {
    let stored = StoredMeta {
        upload_id: upload_id.to_string(),
        meta: meta.clone(),
        updated_at: Utc::now(),
    };
    let json = serde_json::to_vec_pretty(&stored)
        .map_err(|e| UploadError::StorageUnavailable(format!("序列化续传元数据失败: {}", e)))?;
    write_atomic(&meta_path(dir, upload_id), &json).await
}

/// 先写临时文件，再原子重命名
async fn write_atomic(path: &Path, data: &[u8]) -> UploadResult<()> {
    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp_path = PathBuf::from(temp_name);

    fs::write(&temp_path, data)
        .await
        .map_err(|e| UploadError::StorageUnavailable(format!("写入 {:?} 失败: {}", temp_path, e)))?;
    fs::rename(&temp_path, path)
        .await
        .map_err(|e| UploadError::StorageUnavailable(format!("重命名 {:?} 失败: {}", path, e)))?;
    Ok(())
}
