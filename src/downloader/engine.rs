// 传输引擎
//
// 持有唯一的 HTTP 客户端，把每个下载跑成一个独立的流式传输任务。
// 引擎内部由单个命令循环串行管理 任务ID→传输 的映射，
// 公开接口都是即发即忘的命令，结果通过事件通道异步送达。
// 同一任务的事件按发送顺序到达协调器

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use reqwest::header;
use serde::{Deserialize, Serialize};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::EngineError;
use super::events::EngineEvent;

/// 写入缓冲大小
const WRITE_BUFFER_SIZE: usize = 256 * 1024;

/// 拆除原因：无（自然结束）
const TEARDOWN_NONE: u8 = 0;
/// 拆除原因：暂停（保留临时文件并回传续传令牌）
const TEARDOWN_PAUSE: u8 = 1;
/// 拆除原因：取消（静默丢弃临时文件，不发任何事件）
const TEARDOWN_CANCEL: u8 = 2;

/// 续传令牌内部载荷（对协调器不透明）
#[derive(Debug, Serialize, Deserialize)]
struct ResumeState {
    url: String,
    part_path: PathBuf,
    bytes_written: u64,
}

fn encode_resume_token(state: &ResumeState) -> Option<Vec<u8>> {
    serde_json::to_vec(state).ok()
}

fn decode_resume_token(token: &[u8]) -> Option<ResumeState> {
    serde_json::from_slice(token).ok()
}

/// 传输命令接口
///
/// 协调器只依赖这个 trait，测试用记录桩替换真实引擎。
/// 所有方法即发即忘，不阻塞调用方
pub trait Transport: Send + Sync {
    /// 从头开始下载
    fn start(&self, task_id: &str, url: &str);
    /// 用续传令牌继续下载
    fn resume(&self, task_id: &str, token: &[u8]);
    /// 请求暂停，引擎会回一个 `Paused` 事件
    fn pause(&self, task_id: &str);
    /// 请求取消，静默拆除，不回事件
    fn cancel(&self, task_id: &str);
}

enum EngineCommand {
    Start {
        task_id: String,
        url: String,
    },
    Resume {
        task_id: String,
        token: Vec<u8>,
    },
    Pause {
        task_id: String,
    },
    Cancel {
        task_id: String,
    },
    /// 传输任务结束后的内部清理通知
    Done {
        task_id: String,
        op_seq: u64,
    },
}

/// 活跃传输的句柄
struct ActiveTransfer {
    /// 单调递增的操作序号，防止迟到的 Done 清掉后继传输
    op_seq: u64,
    cancel_token: CancellationToken,
    teardown: Arc<AtomicU8>,
}

/// 下载引擎
pub struct DownloadEngine {
    commands: mpsc::UnboundedSender<EngineCommand>,
}

impl DownloadEngine {
    /// 创建引擎并启动命令循环
    ///
    /// `part_dir` 为临时文件目录，不存在时创建
    pub fn new(part_dir: PathBuf, events: mpsc::UnboundedSender<EngineEvent>) -> Result<Self> {
        std::fs::create_dir_all(&part_dir)
            .with_context(|| format!("创建临时文件目录失败: {}", part_dir.display()))?;

        let client = reqwest::Client::builder()
            .build()
            .context("构建 HTTP 客户端失败")?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_worker(client, part_dir, events, tx.clone(), rx));

        Ok(Self { commands: tx })
    }
}

impl Transport for DownloadEngine {
    fn start(&self, task_id: &str, url: &str) {
        let _ = self.commands.send(EngineCommand::Start {
            task_id: task_id.to_string(),
            url: url.to_string(),
        });
    }

    fn resume(&self, task_id: &str, token: &[u8]) {
        let _ = self.commands.send(EngineCommand::Resume {
            task_id: task_id.to_string(),
            token: token.to_vec(),
        });
    }

    fn pause(&self, task_id: &str) {
        let _ = self.commands.send(EngineCommand::Pause {
            task_id: task_id.to_string(),
        });
    }

    fn cancel(&self, task_id: &str) {
        let _ = self.commands.send(EngineCommand::Cancel {
            task_id: task_id.to_string(),
        });
    }
}

/// 引擎命令循环
///
/// 映射只在这里读写，天然串行，无需加锁
async fn run_worker(
    client: reqwest::Client,
    part_dir: PathBuf,
    events: mpsc::UnboundedSender<EngineEvent>,
    commands_tx: mpsc::UnboundedSender<EngineCommand>,
    mut commands_rx: mpsc::UnboundedReceiver<EngineCommand>,
) {
    let mut active: HashMap<String, ActiveTransfer> = HashMap::new();
    let mut next_seq: u64 = 0;

    while let Some(cmd) = commands_rx.recv().await {
        match cmd {
            EngineCommand::Start { task_id, url } => {
                // 同一任务已有活跃传输时忽略重复启动
                if active.contains_key(&task_id) {
                    debug!("任务 {} 已在传输中，忽略重复启动", task_id);
                    continue;
                }
                next_seq += 1;
                spawn_transfer(
                    &client,
                    &part_dir,
                    &events,
                    &commands_tx,
                    &mut active,
                    next_seq,
                    task_id,
                    url,
                    0,
                );
            }
            EngineCommand::Resume { task_id, token } => {
                if active.contains_key(&task_id) {
                    debug!("任务 {} 已在传输中，忽略重复恢复", task_id);
                    continue;
                }
                let Some(state) = decode_resume_token(&token) else {
                    let _ = events.send(EngineEvent::Failed {
                        task_id,
                        error: EngineError::InvalidResponse,
                    });
                    continue;
                };
                next_seq += 1;
                spawn_transfer(
                    &client,
                    &part_dir,
                    &events,
                    &commands_tx,
                    &mut active,
                    next_seq,
                    task_id,
                    state.url,
                    state.bytes_written,
                );
            }
            EngineCommand::Pause { task_id } => {
                if let Some(transfer) = active.get(&task_id) {
                    transfer.teardown.store(TEARDOWN_PAUSE, Ordering::SeqCst);
                    transfer.cancel_token.cancel();
                }
            }
            EngineCommand::Cancel { task_id } => {
                // 立即移出映射，后继的 start/resume 不受迟到拆除影响
                if let Some(transfer) = active.remove(&task_id) {
                    transfer.teardown.store(TEARDOWN_CANCEL, Ordering::SeqCst);
                    transfer.cancel_token.cancel();
                } else {
                    // 暂停后取消：没有活跃传输，但临时文件可能还在
                    let leftover = part_dir.join(format!("{}.part", task_id));
                    tokio::spawn(async move {
                        let _ = tokio::fs::remove_file(leftover).await;
                    });
                }
            }
            EngineCommand::Done { task_id, op_seq } => {
                if active.get(&task_id).map(|t| t.op_seq) == Some(op_seq) {
                    active.remove(&task_id);
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn spawn_transfer(
    client: &reqwest::Client,
    part_dir: &Path,
    events: &mpsc::UnboundedSender<EngineEvent>,
    commands_tx: &mpsc::UnboundedSender<EngineCommand>,
    active: &mut HashMap<String, ActiveTransfer>,
    op_seq: u64,
    task_id: String,
    url: String,
    resume_offset: u64,
) {
    let cancel_token = CancellationToken::new();
    let teardown = Arc::new(AtomicU8::new(TEARDOWN_NONE));
    active.insert(
        task_id.clone(),
        ActiveTransfer {
            op_seq,
            cancel_token: cancel_token.clone(),
            teardown: teardown.clone(),
        },
    );

    let client = client.clone();
    let part_path = part_dir.join(format!("{}.part", task_id));
    let events = events.clone();
    let commands_tx = commands_tx.clone();

    tokio::spawn(async move {
        run_transfer(
            client,
            task_id.clone(),
            url,
            part_path,
            resume_offset,
            cancel_token,
            teardown,
            &events,
        )
        .await;
        let _ = commands_tx.send(EngineCommand::Done { task_id, op_seq });
    });
}

/// 单次传输
///
/// 结束时按拆除原因收尾：
/// - 自然结束 → `Finished`
/// - 暂停 → 落盘后回 `Paused(令牌)`，落盘失败回 `Paused(None)`
/// - 取消 → 删除临时文件，不发事件
/// - 出错 → `Failed`，删除临时文件
#[allow(clippy::too_many_arguments)]
async fn run_transfer(
    client: reqwest::Client,
    task_id: String,
    url: String,
    part_path: PathBuf,
    resume_offset: u64,
    cancel_token: CancellationToken,
    teardown: Arc<AtomicU8>,
    events: &mpsc::UnboundedSender<EngineEvent>,
) {
    let outcome = stream_to_part(
        &client,
        &task_id,
        &url,
        &part_path,
        resume_offset,
        &cancel_token,
        events,
    )
    .await;

    match outcome {
        Ok(TransferOutcome::Finished) => {
            let _ = events.send(EngineEvent::Finished {
                task_id,
                temp_path: part_path,
            });
        }
        Ok(TransferOutcome::Interrupted { preserved }) => {
            match teardown.load(Ordering::SeqCst) {
                TEARDOWN_PAUSE => {
                    let token = preserved.and_then(|bytes_written| {
                        encode_resume_token(&ResumeState {
                            url,
                            part_path: part_path.clone(),
                            bytes_written,
                        })
                    });
                    if token.is_none() {
                        // 断点没保住，临时文件一并丢弃
                        warn!("任务 {} 暂停时未能保留断点，恢复将从头下载", task_id);
                        let _ = tokio::fs::remove_file(&part_path).await;
                    }
                    let _ = events.send(EngineEvent::Paused {
                        task_id,
                        resume_token: token,
                    });
                }
                _ => {
                    // 取消拆除：静默清理
                    let _ = tokio::fs::remove_file(&part_path).await;
                }
            }
        }
        Err(error) => {
            let _ = tokio::fs::remove_file(&part_path).await;
            // 取消途中出的错同样静默
            if teardown.load(Ordering::SeqCst) != TEARDOWN_CANCEL {
                let _ = events.send(EngineEvent::Failed { task_id, error });
            }
        }
    }
}

enum TransferOutcome {
    Finished,
    /// 被暂停或取消中断；None 表示落盘失败，断点不可用
    Interrupted { preserved: Option<u64> },
}

async fn stream_to_part(
    client: &reqwest::Client,
    task_id: &str,
    url: &str,
    part_path: &Path,
    resume_offset: u64,
    cancel_token: &CancellationToken,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<TransferOutcome, EngineError> {
    // 令牌偏移与磁盘实际长度取小者，磁盘缺字节时从缺口续传
    let on_disk = tokio::fs::metadata(part_path).await.map(|m| m.len()).unwrap_or(0);
    let mut offset = resume_offset.min(on_disk);

    let mut request = client.get(url);
    if offset > 0 {
        request = request.header(header::RANGE, format!("bytes={}-", offset));
    }

    let response = tokio::select! {
        _ = cancel_token.cancelled() => {
            return Ok(TransferOutcome::Interrupted { preserved: Some(offset) });
        }
        result = request.send() => {
            result.map_err(|e| EngineError::Transfer(e.to_string()))?
        }
    };

    let status = response.status();
    if offset > 0 && status.as_u16() == 200 {
        // 服务端无视 Range，只能整文件重来
        debug!("任务 {} 续传请求得到 200，从头重新下载", task_id);
        offset = 0;
    } else if offset > 0 && status.as_u16() != 206 {
        if status.as_u16() == 416 {
            return Err(EngineError::InvalidResponse);
        }
        return Err(EngineError::HttpStatus(status.as_u16()));
    } else if !status.is_success() {
        return Err(EngineError::HttpStatus(status.as_u16()));
    }

    let total_bytes = match response.headers().get(header::CONTENT_LENGTH) {
        Some(len) => len
            .to_str()
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|len| len + offset),
        None => None,
    };

    if let Some(name) = suggested_filename(&response) {
        let _ = events.send(EngineEvent::SuggestedName {
            task_id: task_id.to_string(),
            name,
        });
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(part_path)
        .await
        .map_err(|e| EngineError::Transfer(e.to_string()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| EngineError::Transfer(e.to_string()))?;
    } else {
        file.set_len(0)
            .await
            .map_err(|e| EngineError::Transfer(e.to_string()))?;
    }

    let mut bytes_written = offset;
    let mut buffer: Vec<u8> = Vec::with_capacity(WRITE_BUFFER_SIZE);
    let mut stream = response.bytes_stream();

    loop {
        let chunk = tokio::select! {
            _ = cancel_token.cancelled() => {
                // 先把缓冲落盘再交出控制权，令牌偏移必须与磁盘一致
                if flush_buffer(&mut file, &mut buffer).await.is_err() {
                    return Ok(TransferOutcome::Interrupted { preserved: None });
                }
                return Ok(TransferOutcome::Interrupted { preserved: Some(bytes_written) });
            }
            chunk = stream.next() => chunk,
        };

        match chunk {
            Some(Ok(data)) => {
                buffer.extend_from_slice(&data);
                bytes_written += data.len() as u64;
                if buffer.len() >= WRITE_BUFFER_SIZE {
                    flush_buffer(&mut file, &mut buffer)
                        .await
                        .map_err(|e| EngineError::Transfer(e.to_string()))?;
                }
                let _ = events.send(EngineEvent::Progress {
                    task_id: task_id.to_string(),
                    bytes_written,
                    total_bytes,
                });
            }
            Some(Err(e)) => {
                return Err(EngineError::Transfer(e.to_string()));
            }
            None => {
                flush_buffer(&mut file, &mut buffer)
                    .await
                    .map_err(|e| EngineError::Transfer(e.to_string()))?;
                file.flush()
                    .await
                    .map_err(|e| EngineError::Transfer(e.to_string()))?;
                return Ok(TransferOutcome::Finished);
            }
        }
    }
}

async fn flush_buffer(file: &mut tokio::fs::File, buffer: &mut Vec<u8>) -> std::io::Result<()> {
    if !buffer.is_empty() {
        file.write_all(buffer).await?;
        buffer.clear();
    }
    file.flush().await
}

/// 从 Content-Disposition 解析建议文件名
///
/// 支持 `filename="..."` 与 RFC 5987 的 `filename*=UTF-8''...`，
/// 后者优先。解析失败或为空时返回 None
fn suggested_filename(response: &reqwest::Response) -> Option<String> {
    let raw = response
        .headers()
        .get(header::CONTENT_DISPOSITION)?
        .to_str()
        .ok()?;

    let mut plain: Option<String> = None;
    for part in raw.split(';') {
        let part = part.trim();
        if let Some(value) = part.strip_prefix("filename*=") {
            // 形如 UTF-8''encoded-name；格式不对就退回普通 filename
            if let Some(encoded) = value.splitn(2, "''").nth(1) {
                if let Ok(decoded) = urlencoding::decode(encoded) {
                    if !decoded.trim().is_empty() {
                        return Some(decoded.into_owned());
                    }
                }
            }
        } else if let Some(value) = part.strip_prefix("filename=") {
            let name = value.trim_matches('"').trim();
            if !name.is_empty() {
                plain = Some(name.to_string());
            }
        }
    }
    plain
}
