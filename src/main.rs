// 命令行入口
//
// 接收 URL 参数，跑完整个下载队列后退出

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info};

use http_downloader_rust::common::{format_bytes, format_eta, format_speed};
use http_downloader_rust::config::AppConfig;
use http_downloader_rust::downloader::{
    DownloadEngine, DownloadEvent, DownloadManager, JsonFileStore, SaveLocationManager,
};
use http_downloader_rust::filesystem::{PortableResolver, SecureLocationResolver};
use http_downloader_rust::logging;

const CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> Result<()> {
    let urls: Vec<String> = std::env::args().skip(1).collect();
    if urls.is_empty() {
        eprintln!("用法: http-downloader <URL> [URL...]");
        std::process::exit(2);
    }

    let config = AppConfig::load_from_file(CONFIG_PATH).await?;
    let _log_guard = logging::init_logging(&config.log);

    for url in &urls {
        validate_url(url).with_context(|| format!("无效的下载链接: {}", url))?;
    }

    std::fs::create_dir_all(&config.download.app_dir)
        .with_context(|| format!("创建数据目录失败: {}", config.download.app_dir.display()))?;

    let resolver: Arc<dyn SecureLocationResolver> = Arc::new(PortableResolver);
    let save_locations = Arc::new(SaveLocationManager::new(
        resolver.clone(),
        Box::new(JsonFileStore::new(config.download.default_folder_file.clone())),
        config.download.app_dir.clone(),
    )?);

    let (engine_tx, engine_rx) = mpsc::unbounded_channel();
    let engine = DownloadEngine::new(config.download.part_dir.clone(), engine_tx)?;

    let manager = DownloadManager::new(
        Arc::new(engine),
        resolver,
        save_locations.clone(),
        config.download.max_concurrent_tasks,
        engine_rx,
    );

    info!(
        "开始下载 {} 个任务 -> {}",
        urls.len(),
        save_locations.default_location().folder.display()
    );

    let mut events = manager.subscribe_events();
    for url in urls {
        manager.add_task(url, None).await;
    }

    let total = manager.get_all_tasks().await.len();
    let mut failures = 0usize;

    // 消费事件流直到所有任务到达终态
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                error!("事件消费滞后，丢失 {} 条", n);
                continue;
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        };

        match &event {
            DownloadEvent::Progress {
                task_id,
                bytes_written,
                total_bytes,
                speed,
                eta_seconds,
                ..
            } => {
                let total = total_bytes
                    .map(format_bytes)
                    .unwrap_or_else(|| "?".to_string());
                let eta = eta_seconds.map(format_eta).unwrap_or_else(|| "--".to_string());
                println!(
                    "[{}] {} / {}  {}  剩余 {}",
                    short_id(task_id),
                    format_bytes(*bytes_written),
                    total,
                    format_speed(*speed),
                    eta
                );
            }
            DownloadEvent::NameChanged { task_id, file_name } => {
                println!("[{}] 文件名: {}", short_id(task_id), file_name);
            }
            DownloadEvent::Completed { task_id, .. } => {
                println!("[{}] 完成", short_id(task_id));
            }
            DownloadEvent::Failed { task_id, error } => {
                failures += 1;
                println!("[{}] 失败: {}", short_id(task_id), error);
            }
            _ => {}
        }

        let tasks = manager.get_all_tasks().await;
        if tasks.iter().all(|t| t.status.is_terminal()) {
            break;
        }
    }

    let tasks = manager.get_all_tasks().await;
    let downloaded: u64 = tasks.iter().map(|t| t.bytes_written).sum();
    info!(
        "全部结束: 共 {} 个任务，{} 个失败，合计 {}",
        total,
        failures,
        format_bytes(downloaded)
    );

    if failures > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// 只接受带主机名的 http/https 链接
fn validate_url(url: &str) -> Result<()> {
    let parsed = reqwest::Url::parse(url).context("链接解析失败")?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => anyhow::bail!("不支持的协议: {}", other),
    }
    if parsed.host_str().is_none() {
        anyhow::bail!("链接缺少主机名");
    }
    Ok(())
}

fn short_id(task_id: &str) -> &str {
    task_id.get(..8).unwrap_or(task_id)
}
