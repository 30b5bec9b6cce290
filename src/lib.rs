// HTTP 下载管理器
//
// 并发受限、可暂停续传的 HTTP(S) 下载队列

// 通用工具
pub mod common;

// 配置管理
pub mod config;

// 下载核心
pub mod downloader;

// 文件系统
pub mod filesystem;

// 日志系统
pub mod logging;

pub use config::AppConfig;
pub use downloader::{
    DownloadEngine, DownloadEvent, DownloadManager, DownloadTask, SaveLocation,
    SaveLocationManager, TaskStatus,
};
pub use filesystem::{PortableResolver, SecureLocationResolver};
