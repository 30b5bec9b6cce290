// 下载协调器
//
// 任务列表的唯一写入者。公开命令（添加/暂停/恢复/取消/重试）与
// 引擎、收尾器的结果消费都收敛到同一把锁后面，引擎和收尾器的
// 结果先经由通道送达事件循环，再由循环持锁应用。
// 对外通过广播通道发布事件，通过 watch 通道发布任务列表快照

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use super::engine::Transport;
use super::error::FinalizeError;
use super::events::{DownloadEvent, EngineEvent};
use super::finalizer::{self, FinalizeOutcome, FinalizeRequest};
use super::progress::SpeedEstimator;
use super::save_location::SaveLocationManager;
use super::task::{DownloadTask, SaveLocation, TaskStatus};
use crate::filesystem::{naming, SecureLocationResolver};

/// 事件广播缓冲
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 收尾结果（带代次围栏）
struct FinalizeMsg {
    task_id: String,
    generation: u64,
    result: Result<FinalizeOutcome, FinalizeError>,
}

/// 协调器内部状态，整体由一把锁保护
struct Inner {
    /// 任务列表，新任务插在头部
    items: Vec<DownloadTask>,
    /// 活跃任务的速度估算器
    metrics: HashMap<String, SpeedEstimator>,
    /// 暂停后等待续传的任务，准入时用令牌恢复而非从头下载
    resume_after_pause: HashSet<String>,
    /// 任务代次，取消与收尾派发时递增，迟到的收尾结果据此丢弃
    generations: HashMap<String, u64>,
}

/// 下载管理器
pub struct DownloadManager {
    inner: Mutex<Inner>,
    transport: Arc<dyn Transport>,
    resolver: Arc<dyn SecureLocationResolver>,
    save_locations: Arc<SaveLocationManager>,
    max_concurrent_tasks: usize,
    started: Instant,
    events_tx: broadcast::Sender<DownloadEvent>,
    snapshot_tx: watch::Sender<Vec<DownloadTask>>,
    finalize_tx: mpsc::UnboundedSender<FinalizeMsg>,
}

impl DownloadManager {
    /// 创建管理器并启动事件循环
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SecureLocationResolver>,
        save_locations: Arc<SaveLocationManager>,
        max_concurrent_tasks: usize,
        engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Arc<Self> {
        let (manager, finalize_rx) =
            Self::build(transport, resolver, save_locations, max_concurrent_tasks);
        tokio::spawn(manager.clone().run_event_loop(engine_rx, finalize_rx));
        manager
    }

    fn build(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn SecureLocationResolver>,
        save_locations: Arc<SaveLocationManager>,
        max_concurrent_tasks: usize,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<FinalizeMsg>) {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (snapshot_tx, _) = watch::channel(Vec::new());
        let (finalize_tx, finalize_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            inner: Mutex::new(Inner {
                items: Vec::new(),
                metrics: HashMap::new(),
                resume_after_pause: HashSet::new(),
                generations: HashMap::new(),
            }),
            transport,
            resolver,
            save_locations,
            max_concurrent_tasks,
            started: Instant::now(),
            events_tx,
            snapshot_tx,
            finalize_tx,
        });
        (manager, finalize_rx)
    }

    /// 订阅事件流
    pub fn subscribe_events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.events_tx.subscribe()
    }

    /// 订阅任务列表快照
    pub fn watch_snapshot(&self) -> watch::Receiver<Vec<DownloadTask>> {
        self.snapshot_tx.subscribe()
    }

    /// 当前任务列表
    pub async fn get_all_tasks(&self) -> Vec<DownloadTask> {
        self.inner.lock().await.items.clone()
    }

    /// 添加下载任务，返回任务 ID
    ///
    /// 未指定保存位置时使用全局默认位置
    pub async fn add_task(&self, url: String, location: Option<SaveLocation>) -> String {
        let save_location = location.unwrap_or_else(|| self.save_locations.default_location());
        let file_name = naming::url_file_name(&url);
        let task = DownloadTask::new(url.clone(), file_name.clone(), save_location);
        let task_id = task.id.clone();

        info!("添加下载任务 {} -> {}", task_id, file_name);

        let inner = &mut *self.inner.lock().await;
        // 新任务插在头部；准入扫描也从头部开始（见 dispatch_locked）
        inner.items.insert(0, task);
        self.publish(
            &inner.items,
            DownloadEvent::Created {
                task_id: task_id.clone(),
                url,
                file_name,
            },
        );
        self.dispatch_locked(inner);
        task_id
    }

    /// 请求暂停
    ///
    /// 传输中的任务进入 Pausing 等引擎确认；排队任务直接暂停
    pub async fn pause(&self, task_id: &str) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        match inner.items[idx].status {
            TaskStatus::Downloading => {
                self.transition(inner, idx, TaskStatus::Pausing);
                self.transport.pause(task_id);
            }
            TaskStatus::Queued => {
                self.transition(inner, idx, TaskStatus::Paused);
                self.publish(
                    &inner.items,
                    DownloadEvent::Paused {
                        task_id: task_id.to_string(),
                    },
                );
            }
            _ => {}
        }
    }

    /// 恢复暂停的任务（重新排队，持令牌者从断点续传）
    pub async fn resume(&self, task_id: &str) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        match inner.items[idx].status {
            TaskStatus::Paused => {
                inner.resume_after_pause.insert(task_id.to_string());
                self.transition(inner, idx, TaskStatus::Queued);
                self.publish(
                    &inner.items,
                    DownloadEvent::Resumed {
                        task_id: task_id.to_string(),
                    },
                );
                self.dispatch_locked(inner);
            }
            TaskStatus::Pausing => {
                // 暂停握手还没完成，先记下恢复请求；
                // 引擎确认暂停后任务直接回到队列（见 on_paused）
                inner.resume_after_pause.insert(task_id.to_string());
            }
            TaskStatus::Failed => {
                self.retry_locked(inner, idx);
            }
            _ => {}
        }
    }

    /// 重试失败的任务（从头下载）
    pub async fn retry(&self, task_id: &str) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        if inner.items[idx].status == TaskStatus::Failed {
            self.retry_locked(inner, idx);
        }
    }

    /// 取消任务
    ///
    /// 终态任务忽略；收尾中的任务通过代次围栏丢弃迟到的收尾结果
    pub async fn cancel(&self, task_id: &str) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        let status = inner.items[idx].status;
        if status.is_terminal() {
            return;
        }

        bump_generation(&mut inner.generations, task_id);
        inner.metrics.remove(task_id);
        inner.resume_after_pause.remove(task_id);

        // 传输中与暂停中的任务都可能在引擎侧留有临时文件
        if !matches!(status, TaskStatus::Finishing) {
            self.transport.cancel(task_id);
        }

        inner.items[idx].mark_canceled();
        self.publish(
            &inner.items,
            DownloadEvent::StatusChanged {
                task_id: task_id.to_string(),
                old_status: status,
                new_status: TaskStatus::Canceled,
            },
        );
        self.publish(
            &inner.items,
            DownloadEvent::Canceled {
                task_id: task_id.to_string(),
            },
        );
        self.dispatch_locked(inner);
    }

    fn retry_locked(&self, inner: &mut Inner, idx: usize) {
        let task = &mut inner.items[idx];
        let task_id = task.id.clone();
        task.status = TaskStatus::Queued;
        task.bytes_written = 0;
        task.progress = Some(0.0);
        task.total_bytes = None;
        task.error = None;
        task.resume_token = None;
        inner.resume_after_pause.remove(&task_id);
        self.publish(
            &inner.items,
            DownloadEvent::StatusChanged {
                task_id,
                old_status: TaskStatus::Failed,
                new_status: TaskStatus::Queued,
            },
        );
        self.dispatch_locked(inner);
    }

    /// 事件循环：消费引擎事件与收尾结果
    async fn run_event_loop(
        self: Arc<Self>,
        mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
        mut finalize_rx: mpsc::UnboundedReceiver<FinalizeMsg>,
    ) {
        loop {
            tokio::select! {
                event = engine_rx.recv() => match event {
                    Some(event) => self.handle_engine_event(event).await,
                    None => break,
                },
                msg = finalize_rx.recv() => match msg {
                    Some(msg) => self.handle_finalize_result(msg).await,
                    None => break,
                },
            }
        }
        debug!("下载管理器事件循环退出");
    }

    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Progress {
                task_id,
                bytes_written,
                total_bytes,
            } => self.on_progress(&task_id, bytes_written, total_bytes).await,
            EngineEvent::SuggestedName { task_id, name } => {
                self.on_suggested_name(&task_id, &name).await
            }
            EngineEvent::Paused {
                task_id,
                resume_token,
            } => self.on_paused(&task_id, resume_token).await,
            EngineEvent::Finished { task_id, temp_path } => {
                self.on_finished(&task_id, temp_path).await
            }
            EngineEvent::Failed { task_id, error } => {
                self.on_failed(&task_id, error.to_string()).await
            }
        }
    }

    async fn on_progress(&self, task_id: &str, bytes_written: u64, total_bytes: Option<u64>) {
        let now = self.now_secs();
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        if inner.items[idx].status != TaskStatus::Downloading {
            return;
        }

        let effective_total = total_bytes.or(inner.items[idx].total_bytes);
        let Some(estimator) = inner.metrics.get_mut(task_id) else {
            return;
        };
        // 节流丢弃的观测不触碰任何可见状态
        let Some(sample) = estimator.update(now, bytes_written, effective_total) else {
            return;
        };

        let task = &mut inner.items[idx];
        task.bytes_written = bytes_written;
        task.total_bytes = effective_total;
        task.progress = sample.progress;
        task.speed = sample.speed;
        task.eta_seconds = sample.eta_seconds;

        self.publish(
            &inner.items,
            DownloadEvent::Progress {
                task_id: task_id.to_string(),
                bytes_written,
                total_bytes: effective_total,
                progress: sample.progress,
                speed: sample.speed,
                eta_seconds: sample.eta_seconds,
            },
        );
    }

    async fn on_suggested_name(&self, task_id: &str, name: &str) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        if !inner.items[idx].status.is_active() {
            return;
        }
        let extension = name.rsplit_once('.').map(|(_, ext)| ext);
        let sanitized = naming::sanitize_file_name(name, extension);
        if sanitized == inner.items[idx].file_name {
            return;
        }
        inner.items[idx].file_name = sanitized.clone();
        self.publish(
            &inner.items,
            DownloadEvent::NameChanged {
                task_id: task_id.to_string(),
                file_name: sanitized,
            },
        );
    }

    async fn on_paused(&self, task_id: &str, resume_token: Option<Vec<u8>>) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        // 引擎也可能在未收到暂停命令时确认暂停（竞态下的迟到事件）
        if !matches!(
            inner.items[idx].status,
            TaskStatus::Pausing | TaskStatus::Downloading
        ) {
            return;
        }

        if resume_token.is_none() {
            warn!("任务 {} 暂停时未能保留断点，恢复将从头下载", task_id);
        }
        let old_status = inner.items[idx].status;
        // 握手期间到达的恢复请求：确认暂停后不落在 Paused，直接回队列
        let pending_resume = inner.resume_after_pause.contains(task_id);
        let task = &mut inner.items[idx];
        task.resume_token = resume_token;
        task.speed = 0.0;
        task.eta_seconds = None;
        inner.metrics.remove(task_id);

        if pending_resume {
            inner.items[idx].status = TaskStatus::Queued;
            self.publish(
                &inner.items,
                DownloadEvent::StatusChanged {
                    task_id: task_id.to_string(),
                    old_status,
                    new_status: TaskStatus::Queued,
                },
            );
        } else {
            inner.items[idx].status = TaskStatus::Paused;
            self.publish(
                &inner.items,
                DownloadEvent::StatusChanged {
                    task_id: task_id.to_string(),
                    old_status,
                    new_status: TaskStatus::Paused,
                },
            );
            self.publish(
                &inner.items,
                DownloadEvent::Paused {
                    task_id: task_id.to_string(),
                },
            );
        }
        self.dispatch_locked(inner);
    }

    async fn on_finished(&self, task_id: &str, temp_path: std::path::PathBuf) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        // 迟到的完成事件（任务已暂停/排队/终态）不触发收尾
        if inner.items[idx].status != TaskStatus::Downloading {
            return;
        }

        let old_status = inner.items[idx].status;
        let task = &mut inner.items[idx];
        task.status = TaskStatus::Finishing;
        task.speed = 0.0;
        task.eta_seconds = None;
        if task.total_bytes.is_some() {
            task.progress = Some(1.0);
        }
        inner.metrics.remove(task_id);
        inner.resume_after_pause.remove(task_id);

        let generation = bump_generation(&mut inner.generations, task_id);
        let request = FinalizeRequest {
            task_id: task_id.to_string(),
            temp_path,
            save_location: inner.items[idx].save_location.clone(),
            file_name: inner.items[idx].file_name.clone(),
        };

        self.publish(
            &inner.items,
            DownloadEvent::StatusChanged {
                task_id: task_id.to_string(),
                old_status,
                new_status: TaskStatus::Finishing,
            },
        );
        // 收尾不占槽位，立即放行下一个排队任务
        self.dispatch_locked(inner);

        let resolver = self.resolver.clone();
        let finalize_tx = self.finalize_tx.clone();
        let task_id = task_id.to_string();
        tokio::spawn(async move {
            let result = finalizer::run_finalize(resolver, request).await;
            let _ = finalize_tx.send(FinalizeMsg {
                task_id,
                generation,
                result,
            });
        });
    }

    async fn on_failed(&self, task_id: &str, message: String) {
        let inner = &mut *self.inner.lock().await;
        let Some(idx) = index_of(&inner.items, task_id) else {
            return;
        };
        if inner.items[idx].status.is_terminal() {
            return;
        }

        warn!("任务 {} 失败: {}", task_id, message);
        let old_status = inner.items[idx].status;
        inner.items[idx].mark_failed(message.clone());
        inner.metrics.remove(task_id);
        inner.resume_after_pause.remove(task_id);

        self.publish(
            &inner.items,
            DownloadEvent::StatusChanged {
                task_id: task_id.to_string(),
                old_status,
                new_status: TaskStatus::Failed,
            },
        );
        self.publish(
            &inner.items,
            DownloadEvent::Failed {
                task_id: task_id.to_string(),
                error: message,
            },
        );
        self.dispatch_locked(inner);
    }

    async fn handle_finalize_result(&self, msg: FinalizeMsg) {
        let inner = &mut *self.inner.lock().await;
        // 代次不匹配说明任务在收尾期间被取消，结果作废
        if inner.generations.get(&msg.task_id) != Some(&msg.generation) {
            debug!("任务 {} 的收尾结果已过期，丢弃", msg.task_id);
            return;
        }
        let Some(idx) = index_of(&inner.items, msg.task_id.as_str()) else {
            return;
        };
        if inner.items[idx].status != TaskStatus::Finishing {
            return;
        }

        match msg.result {
            Ok(outcome) => {
                if let Some(token) = &outcome.refreshed_token {
                    self.save_locations
                        .persist_refreshed_token(&outcome.resolved_folder, token);
                }
                let task = &mut inner.items[idx];
                task.status = TaskStatus::Completed;
                task.progress = Some(1.0);
                task.resume_token = None;
                // 任务自身的保存位置同步为实际落位的文件夹与新令牌
                task.save_location.folder = outcome.resolved_folder.clone();
                if let Some(token) = outcome.refreshed_token.clone() {
                    task.save_location.bookmark = Some(token);
                }
                info!(
                    "任务 {} 已完成: {}",
                    msg.task_id,
                    outcome.final_path.display()
                );
                self.publish(
                    &inner.items,
                    DownloadEvent::StatusChanged {
                        task_id: msg.task_id.clone(),
                        old_status: TaskStatus::Finishing,
                        new_status: TaskStatus::Completed,
                    },
                );
                self.publish(
                    &inner.items,
                    DownloadEvent::Completed {
                        task_id: msg.task_id,
                        completed_at: chrono::Utc::now().timestamp(),
                    },
                );
            }
            Err(e) => {
                let message = e.to_string();
                warn!("任务 {} 收尾失败: {}", msg.task_id, message);
                inner.items[idx].mark_failed(message.clone());
                self.publish(
                    &inner.items,
                    DownloadEvent::StatusChanged {
                        task_id: msg.task_id.clone(),
                        old_status: TaskStatus::Finishing,
                        new_status: TaskStatus::Failed,
                    },
                );
                self.publish(
                    &inner.items,
                    DownloadEvent::Failed {
                        task_id: msg.task_id,
                        error: message,
                    },
                );
            }
        }
        self.dispatch_locked(inner);
    }

    /// 准入扫描
    ///
    /// 活跃数（Downloading + Pausing）未达上限时，按列表顺序放行
    /// 排队任务。列表头部是最新任务，所以槽位紧张时后添加的任务
    /// 先获得准入
    fn dispatch_locked(&self, inner: &mut Inner) {
        let now = self.now_secs();
        let mut active = inner
            .items
            .iter()
            .filter(|t| t.status.is_active())
            .count();

        for idx in 0..inner.items.len() {
            if active >= self.max_concurrent_tasks {
                break;
            }
            if inner.items[idx].status != TaskStatus::Queued {
                continue;
            }

            let task_id = inner.items[idx].id.clone();
            let with_token = inner.resume_after_pause.remove(&task_id)
                && inner.items[idx].resume_token.is_some();

            let task = &mut inner.items[idx];
            task.mark_downloading();
            if with_token {
                let token = task.resume_token.clone().unwrap_or_default();
                inner
                    .metrics
                    .insert(task_id.clone(), SpeedEstimator::seeded(now, task.bytes_written));
                self.transport.resume(&task_id, &token);
            } else {
                task.bytes_written = 0;
                task.progress = Some(0.0);
                task.total_bytes = None;
                task.resume_token = None;
                inner
                    .metrics
                    .insert(task_id.clone(), SpeedEstimator::new(now));
                self.transport.start(&task_id, &task.url);
            }
            active += 1;

            self.publish(
                &inner.items,
                DownloadEvent::StatusChanged {
                    task_id,
                    old_status: TaskStatus::Queued,
                    new_status: TaskStatus::Downloading,
                },
            );
        }
    }

    fn transition(&self, inner: &mut Inner, idx: usize, new_status: TaskStatus) {
        let old_status = inner.items[idx].status;
        if old_status == new_status {
            return;
        }
        let task_id = inner.items[idx].id.clone();
        inner.items[idx].status = new_status;
        self.publish(
            &inner.items,
            DownloadEvent::StatusChanged {
                task_id,
                old_status,
                new_status,
            },
        );
    }

    fn publish(&self, items: &[DownloadTask], event: DownloadEvent) {
        let _ = self.events_tx.send(event);
        // send_replace 在没有订阅者时也保持最新快照
        self.snapshot_tx.send_replace(items.to_vec());
    }

    fn now_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

fn index_of(items: &[DownloadTask], task_id: &str) -> Option<usize> {
    items.iter().position(|t| t.id == task_id)
}

fn bump_generation(generations: &mut HashMap<String, u64>, task_id: &str) -> u64 {
    let counter = generations.entry(task_id.to_string()).or_insert(0);
    *counter += 1;
    *counter
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::error::EngineError;
    use crate::downloader::save_location::JsonFileStore;
    use crate::filesystem::PortableResolver;
    use std::path::PathBuf;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start(String),
        Resume(String),
        Pause(String),
        Cancel(String),
    }

    #[derive(Default)]
    struct RecordingTransport {
        calls: std::sync::Mutex<Vec<Call>>,
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn start(&self, task_id: &str, _url: &str) {
            self.calls.lock().unwrap().push(Call::Start(task_id.to_string()));
        }
        fn resume(&self, task_id: &str, _token: &[u8]) {
            self.calls.lock().unwrap().push(Call::Resume(task_id.to_string()));
        }
        fn pause(&self, task_id: &str) {
            self.calls.lock().unwrap().push(Call::Pause(task_id.to_string()));
        }
        fn cancel(&self, task_id: &str) {
            self.calls.lock().unwrap().push(Call::Cancel(task_id.to_string()));
        }
    }

    struct Fixture {
        manager: Arc<DownloadManager>,
        transport: Arc<RecordingTransport>,
        _app_dir: tempfile::TempDir,
        _finalize_rx: mpsc::UnboundedReceiver<FinalizeMsg>,
    }

    fn fixture(max_concurrent: usize) -> Fixture {
        let app_dir = tempfile::tempdir().unwrap();
        let resolver: Arc<dyn SecureLocationResolver> = Arc::new(PortableResolver);
        let save_locations = Arc::new(
            SaveLocationManager::new(
                resolver.clone(),
                Box::new(JsonFileStore::new(app_dir.path().join("folder.json"))),
                app_dir.path().to_path_buf(),
            )
            .unwrap(),
        );
        let transport = Arc::new(RecordingTransport::default());
        let (manager, finalize_rx) = DownloadManager::build(
            transport.clone(),
            resolver,
            save_locations,
            max_concurrent,
        );
        Fixture {
            manager,
            transport,
            _app_dir: app_dir,
            _finalize_rx: finalize_rx,
        }
    }

    async fn status_of(manager: &DownloadManager, task_id: &str) -> TaskStatus {
        manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == task_id)
            .unwrap()
            .status
    }

    #[tokio::test]
    async fn test_add_dispatches_within_cap() {
        let fx = fixture(2);
        let id = fx
            .manager
            .add_task("https://example.com/a.bin".to_string(), None)
            .await;
        assert_eq!(status_of(&fx.manager, &id).await, TaskStatus::Downloading);
        assert_eq!(fx.transport.calls(), vec![Call::Start(id)]);
    }

    #[tokio::test]
    async fn test_cap_queues_excess_tasks() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        let b = fx.manager.add_task("https://e.com/b".to_string(), None).await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Downloading);
        assert_eq!(status_of(&fx.manager, &b).await, TaskStatus::Queued);
        assert_eq!(fx.transport.calls(), vec![Call::Start(a)]);
    }

    #[tokio::test]
    async fn test_newest_queued_task_admitted_first() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        let b = fx.manager.add_task("https://e.com/b".to_string(), None).await;
        let c = fx.manager.add_task("https://e.com/c".to_string(), None).await;

        fx.manager.cancel(&a).await;

        // 空出的槽位给最新添加的 c，不是等得更久的 b
        assert_eq!(status_of(&fx.manager, &c).await, TaskStatus::Downloading);
        assert_eq!(status_of(&fx.manager, &b).await, TaskStatus::Queued);
        assert!(fx.transport.calls().contains(&Call::Start(c)));
        assert!(!fx.transport.calls().contains(&Call::Start(b)));
    }

    #[tokio::test]
    async fn test_cancel_terminal_is_noop() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager.cancel(&a).await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Canceled);

        let calls_before = fx.transport.calls().len();
        fx.manager.cancel(&a).await;
        assert_eq!(fx.transport.calls().len(), calls_before);
    }

    #[tokio::test]
    async fn test_pause_then_engine_confirms() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;

        fx.manager.pause(&a).await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Pausing);
        assert!(fx.transport.calls().contains(&Call::Pause(a.clone())));

        fx.manager
            .handle_engine_event(EngineEvent::Paused {
                task_id: a.clone(),
                resume_token: Some(vec![1, 2, 3]),
            })
            .await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_resume_uses_token() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager.pause(&a).await;
        fx.manager
            .handle_engine_event(EngineEvent::Paused {
                task_id: a.clone(),
                resume_token: Some(vec![9]),
            })
            .await;

        fx.manager.resume(&a).await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Downloading);
        assert!(fx.transport.calls().contains(&Call::Resume(a)));
    }

    #[tokio::test]
    async fn test_resume_while_pausing_requeues_after_ack() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;

        fx.manager.pause(&a).await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Pausing);

        // 暂停握手完成前用户又点了恢复
        fx.manager.resume(&a).await;
        fx.manager
            .handle_engine_event(EngineEvent::Paused {
                task_id: a.clone(),
                resume_token: Some(vec![7]),
            })
            .await;

        // 确认暂停后不停留在 Paused，直接回队列并被准入
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Downloading);
        assert!(fx.transport.calls().contains(&Call::Resume(a)));
    }

    #[tokio::test]
    async fn test_finished_ignored_for_paused_task() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager.pause(&a).await;
        fx.manager
            .handle_engine_event(EngineEvent::Paused {
                task_id: a.clone(),
                resume_token: Some(vec![1]),
            })
            .await;

        // 迟到的完成事件不能把暂停的任务拖进收尾
        fx.manager
            .handle_engine_event(EngineEvent::Finished {
                task_id: a.clone(),
                temp_path: PathBuf::from("/tmp/nonexistent.part"),
            })
            .await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Paused);
    }

    #[tokio::test]
    async fn test_paused_without_token_restarts() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager.pause(&a).await;
        fx.manager
            .handle_engine_event(EngineEvent::Paused {
                task_id: a.clone(),
                resume_token: None,
            })
            .await;

        fx.manager.resume(&a).await;
        // 无令牌只能从头下载
        let calls = fx.transport.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::Start(a.clone())).count(), 2);
    }

    #[tokio::test]
    async fn test_pause_queued_skips_engine() {
        let fx = fixture(1);
        let _a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        let b = fx.manager.add_task("https://e.com/b".to_string(), None).await;

        fx.manager.pause(&b).await;
        assert_eq!(status_of(&fx.manager, &b).await, TaskStatus::Paused);
        assert!(!fx.transport.calls().contains(&Call::Pause(b)));
    }

    #[tokio::test]
    async fn test_failure_then_retry_restarts_clean() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;

        fx.manager
            .handle_engine_event(EngineEvent::Failed {
                task_id: a.clone(),
                error: EngineError::HttpStatus(503),
            })
            .await;
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.as_deref().unwrap().contains("503"));

        fx.manager.retry(&a).await;
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Downloading);
        assert!(task.error.is_none());
        assert_eq!(task.bytes_written, 0);
    }

    #[tokio::test]
    async fn test_finishing_frees_slot() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        let b = fx.manager.add_task("https://e.com/b".to_string(), None).await;
        assert_eq!(status_of(&fx.manager, &b).await, TaskStatus::Queued);

        fx.manager
            .handle_engine_event(EngineEvent::Finished {
                task_id: a.clone(),
                temp_path: PathBuf::from("/tmp/nonexistent.part"),
            })
            .await;

        // 收尾不占槽位，b 立即准入
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Finishing);
        assert_eq!(status_of(&fx.manager, &b).await, TaskStatus::Downloading);
    }

    #[tokio::test]
    async fn test_stale_finalize_result_is_fenced() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager
            .handle_engine_event(EngineEvent::Finished {
                task_id: a.clone(),
                temp_path: PathBuf::from("/tmp/nonexistent.part"),
            })
            .await;

        // 收尾期间取消，代次递增
        fx.manager.cancel(&a).await;
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Canceled);

        fx.manager
            .handle_finalize_result(FinalizeMsg {
                task_id: a.clone(),
                generation: 1,
                result: Ok(FinalizeOutcome {
                    final_path: PathBuf::from("/tmp/out.bin"),
                    resolved_folder: PathBuf::from("/tmp"),
                    refreshed_token: None,
                }),
            })
            .await;
        // 过期结果被丢弃，任务保持取消态
        assert_eq!(status_of(&fx.manager, &a).await, TaskStatus::Canceled);
    }

    #[tokio::test]
    async fn test_finalize_success_completes_task() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager
            .handle_engine_event(EngineEvent::Finished {
                task_id: a.clone(),
                temp_path: PathBuf::from("/tmp/nonexistent.part"),
            })
            .await;

        fx.manager
            .handle_finalize_result(FinalizeMsg {
                task_id: a.clone(),
                generation: 1,
                result: Ok(FinalizeOutcome {
                    final_path: PathBuf::from("/tmp/out.bin"),
                    resolved_folder: PathBuf::from("/tmp"),
                    refreshed_token: None,
                }),
            })
            .await;
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        // 完成时进度强制为 1，断点与位置同步到实际落位处
        assert_eq!(task.progress, Some(1.0));
        assert!(task.resume_token.is_none());
        assert_eq!(task.save_location.folder, PathBuf::from("/tmp"));
    }

    #[tokio::test]
    async fn test_finalize_failure_marks_failed() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager
            .handle_engine_event(EngineEvent::Finished {
                task_id: a.clone(),
                temp_path: PathBuf::from("/tmp/nonexistent.part"),
            })
            .await;

        fx.manager
            .handle_finalize_result(FinalizeMsg {
                task_id: a.clone(),
                generation: 1,
                result: Err(FinalizeError::CreateDir("permission denied".to_string())),
            })
            .await;
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert!(task.error.is_some());
    }

    #[tokio::test]
    async fn test_throttled_progress_leaves_task_unchanged() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;

        // 准入后立刻到达的观测落在节流窗口内，可见状态不得变化
        fx.manager
            .handle_engine_event(EngineEvent::Progress {
                task_id: a.clone(),
                bytes_written: 1000,
                total_bytes: Some(10_000),
            })
            .await;
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert_eq!(task.bytes_written, 0);
        assert!(task.total_bytes.is_none());
        assert_eq!(task.speed, 0.0);
    }

    #[tokio::test]
    async fn test_progress_publishes_after_interval() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        let mut events = fx.manager.subscribe_events();

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        fx.manager
            .handle_engine_event(EngineEvent::Progress {
                task_id: a.clone(),
                bytes_written: 5000,
                total_bytes: Some(10_000),
            })
            .await;

        let mut saw_progress = false;
        while let Ok(event) = events.try_recv() {
            if let DownloadEvent::Progress { task_id, speed, progress, .. } = event {
                assert_eq!(task_id, a);
                assert!(speed > 0.0);
                assert!((progress.unwrap() - 0.5).abs() < 1e-9);
                saw_progress = true;
            }
        }
        assert!(saw_progress);
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert!(task.speed > 0.0);
    }

    #[tokio::test]
    async fn test_suggested_name_applies_once_active() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;

        fx.manager
            .handle_engine_event(EngineEvent::SuggestedName {
                task_id: a.clone(),
                name: "report final.pdf".to_string(),
            })
            .await;
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert_eq!(task.file_name, "report final.pdf");
    }

    #[tokio::test]
    async fn test_suggested_name_ignored_after_pause() {
        let fx = fixture(1);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        fx.manager.pause(&a).await;
        fx.manager
            .handle_engine_event(EngineEvent::Paused {
                task_id: a.clone(),
                resume_token: None,
            })
            .await;

        fx.manager
            .handle_engine_event(EngineEvent::SuggestedName {
                task_id: a.clone(),
                name: "late.bin".to_string(),
            })
            .await;
        let task = fx
            .manager
            .get_all_tasks()
            .await
            .into_iter()
            .find(|t| t.id == a)
            .unwrap();
        assert_ne!(task.file_name, "late.bin");
    }

    #[tokio::test]
    async fn test_new_tasks_insert_at_front() {
        let fx = fixture(3);
        let a = fx.manager.add_task("https://e.com/a".to_string(), None).await;
        let b = fx.manager.add_task("https://e.com/b".to_string(), None).await;

        let tasks = fx.manager.get_all_tasks().await;
        assert_eq!(tasks[0].id, b);
        assert_eq!(tasks[1].id, a);
    }
}
