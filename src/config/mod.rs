// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 应用数据目录（默认下载文件夹与位置存储都在这里）
    #[serde(default = "default_app_dir")]
    pub app_dir: PathBuf,
    /// 临时文件目录
    #[serde(default = "default_part_dir")]
    pub part_dir: PathBuf,
    /// 最大同时下载任务数
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,
    /// 默认保存位置的存储文件
    #[serde(default = "default_folder_file")]
    pub default_folder_file: PathBuf,
}

fn default_app_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_part_dir() -> PathBuf {
    PathBuf::from("data/parts")
}

fn default_max_concurrent_tasks() -> usize {
    3
}

fn default_folder_file() -> PathBuf {
    PathBuf::from("data/default_folder.json")
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            app_dir: default_app_dir(),
            part_dir: default_part_dir(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            default_folder_file: default_folder_file(),
        }
    }
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

impl AppConfig {
    /// 从文件加载配置，文件不存在时使用默认配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        if !std::path::Path::new(path).exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;

        if config.download.max_concurrent_tasks == 0 {
            anyhow::bail!("max_concurrent_tasks 必须大于 0");
        }

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {}", path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.download.max_concurrent_tasks, 3);
        assert_eq!(config.download.app_dir, PathBuf::from("data"));
        assert_eq!(config.log.level, "info");
        assert!(config.log.enabled);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [download]
            max_concurrent_tasks = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.download.max_concurrent_tasks, 5);
        assert_eq!(config.download.part_dir, PathBuf::from("data/parts"));
        assert_eq!(config.log.retention_days, 7);
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let config = AppConfig::load_from_file("/nonexistent/config.toml")
            .await
            .unwrap();
        assert_eq!(config.download.max_concurrent_tasks, 3);
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[download]\nmax_concurrent_tasks = 0\n")
            .await
            .unwrap();
        assert!(AppConfig::load_from_file(path.to_str().unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = AppConfig::default();
        config.download.max_concurrent_tasks = 8;
        config.save_to_file(path.to_str().unwrap()).await.unwrap();

        let loaded = AppConfig::load_from_file(path.to_str().unwrap()).await.unwrap();
        assert_eq!(loaded.download.max_concurrent_tasks, 8);
    }
}
