// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::api::UploadEndpoints;
use crate::uploader::{
    UploadOptions, DEFAULT_CONCURRENCY, DEFAULT_DIRECT_UPLOAD_PATH, DEFAULT_MAX_RETRIES,
};

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 断点续传配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 上传服务地址（例如 `https://files.example.com`）
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 初始化接口路径
    #[serde(default = "default_init_path")]
    pub init_path: String,
    /// 分片接口路径
    #[serde(default = "default_chunk_path")]
    pub chunk_path: String,
    /// 合并接口路径
    #[serde(default = "default_complete_path")]
    pub complete_path: String,
    /// 直传接口路径
    #[serde(default = "default_direct_path")]
    pub direct_path: String,
    /// 最大并发分片数
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// 单个分片的最大重试次数（0 表示失败立即终止）
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 固定分片大小（字节，不设置则自动决定）
    #[serde(default)]
    pub chunk_size: Option<u64>,
    /// 单个分片请求超时（秒，不设置则不限时）
    #[serde(default)]
    pub chunk_request_timeout_secs: Option<u64>,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_init_path() -> String {
    "/api/upload/init".to_string()
}

fn default_chunk_path() -> String {
    "/api/upload/chunk".to_string()
}

fn default_complete_path() -> String {
    "/api/upload/complete".to_string()
}

fn default_direct_path() -> String {
    DEFAULT_DIRECT_UPLOAD_PATH.to_string()
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            init_path: default_init_path(),
            chunk_path: default_chunk_path(),
            complete_path: default_complete_path(),
            direct_path: default_direct_path(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            chunk_size: None,
            chunk_request_timeout_secs: None,
        }
    }
}

impl UploadConfig {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    /// 分片上传接口地址
    pub fn endpoints(&self) -> UploadEndpoints {
        UploadEndpoints {
            init_url: self.url(&self.init_path),
            chunk_url: self.url(&self.chunk_path),
            complete_url: self.url(&self.complete_path),
        }
    }

    /// 直传接口地址
    pub fn direct_url(&self) -> String {
        self.url(&self.direct_path)
    }

    /// 上传引擎选项
    pub fn options(&self) -> UploadOptions {
        UploadOptions {
            concurrency: self.concurrency.max(1),
            max_retries: self.max_retries,
            chunk_size: self.chunk_size,
        }
    }

    pub fn chunk_request_timeout(&self) -> Option<Duration> {
        self.chunk_request_timeout_secs.map(Duration::from_secs)
    }
}

/// 断点续传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 是否启用断点续传
    #[serde(default = "default_persistence_enabled")]
    pub enabled: bool,
    /// 续传数据目录
    #[serde(default = "default_resume_dir")]
    pub resume_dir: PathBuf,
}

fn default_persistence_enabled() -> bool {
    true
}

fn default_resume_dir() -> PathBuf {
    PathBuf::from("resume")
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: default_persistence_enabled(),
            resume_dir: default_resume_dir(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        if config.upload.base_url.trim().is_empty() {
            anyhow::bail!("配置文件中的上传服务地址为空");
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            fs::create_dir_all(parent)
                .await
                .context("Failed to create config directory")?;
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {}", e);
                let default_config = Self::default();

                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.concurrency, 4);
        assert_eq!(config.upload.max_retries, 0);
        assert_eq!(config.upload.direct_path, "/api/upload");
        assert!(config.upload.chunk_request_timeout().is_none());
        assert!(config.persistence.enabled);
        assert!(config.log.enabled);
        assert_eq!(config.log.retention_days, 7);
        assert_eq!(config.log.level, "info");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.base_url = "https://files.example.com".to_string();
        config.upload.concurrency = 8;
        config.upload.chunk_request_timeout_secs = Some(30);
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.upload.base_url, "https://files.example.com");
        assert_eq!(loaded.upload.concurrency, 8);
        assert_eq!(
            loaded.upload.chunk_request_timeout(),
            Some(Duration::from_secs(30))
        );
        assert_eq!(loaded.persistence.resume_dir, config.persistence.resume_dir);
    }

    #[tokio::test]
    async fn test_partial_config_uses_defaults() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path().to_str().unwrap();
        tokio::fs::write(
            path,
            "[upload]\nbase_url = \"https://up.example.com/\"\nmax_retries = 2\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(config.upload.max_retries, 2);
        assert_eq!(config.upload.concurrency, 4);
        assert_eq!(
            config.upload.endpoints(),
            UploadEndpoints {
                init_url: "https://up.example.com/api/upload/init".to_string(),
                chunk_url: "https://up.example.com/api/upload/chunk".to_string(),
                complete_url: "https://up.example.com/api/upload/complete".to_string(),
            }
        );
        assert_eq!(config.upload.direct_url(), "https://up.example.com/api/upload");
        assert_eq!(config.upload.options().max_retries, 2);
    }

    #[tokio::test]
    async fn test_load_or_default_writes_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let path = path.to_str().unwrap();

        let config = AppConfig::load_or_default(path).await;
        assert_eq!(config.upload.concurrency, 4);
        assert!(std::path::Path::new(path).exists());
    }
}
