// 下载任务数据模型

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务状态
///
/// 状态机的唯一推进者是协调器，其他组件只读
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 排队等待槽位
    Queued,
    /// 正在传输
    Downloading,
    /// 暂停请求已发出，等待引擎确认
    Pausing,
    /// 已暂停（可能持有续传令牌）
    Paused,
    /// 传输完成，收尾中（不占并发槽位）
    Finishing,
    /// 已完成
    Completed,
    /// 已失败（可重试）
    Failed,
    /// 已取消
    Canceled,
}

impl TaskStatus {
    /// 是否为终态（取消请求对终态任务是空操作）
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// 是否占用并发槽位
    ///
    /// `Finishing` 不计入：传输已结束，收尾在阻塞线程上进行
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Downloading | TaskStatus::Pausing)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Pausing => "pausing",
            TaskStatus::Paused => "paused",
            TaskStatus::Finishing => "finishing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }
}

/// 保存位置：目标文件夹加可选的安全位置令牌
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveLocation {
    /// 目标文件夹路径
    pub folder: PathBuf,
    /// 安全位置令牌（不参与序列化，进程内有效）
    #[serde(skip)]
    pub bookmark: Option<Vec<u8>>,
}

impl SaveLocation {
    pub fn new(folder: PathBuf, bookmark: Option<Vec<u8>>) -> Self {
        Self { folder, bookmark }
    }
}

/// 下载任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadTask {
    /// 任务 ID（UUID v4）
    pub id: String,
    /// 下载链接
    pub url: String,
    /// 显示文件名（可能随 Content-Disposition 更新）
    pub file_name: String,
    /// 保存位置
    pub save_location: SaveLocation,
    /// 当前状态
    pub status: TaskStatus,
    /// 进度（0.0 - 1.0），总大小未知时为 None
    pub progress: Option<f64>,
    /// 已写入字节数
    pub bytes_written: u64,
    /// 总字节数（未知时为 None）
    pub total_bytes: Option<u64>,
    /// 当前速度（字节/秒，指数滑动平均）
    pub speed: f64,
    /// 预计剩余时间（秒）
    pub eta_seconds: Option<f64>,
    /// 失败原因（仅 Failed 状态持有）
    pub error: Option<String>,
    /// 续传令牌（不参与序列化，进程内有效）
    #[serde(skip)]
    pub resume_token: Option<Vec<u8>>,
    /// 创建时间（Unix 时间戳）
    pub created_at: i64,
}

impl DownloadTask {
    pub fn new(url: String, file_name: String, save_location: SaveLocation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            file_name,
            save_location,
            status: TaskStatus::Queued,
            progress: Some(0.0),
            bytes_written: 0,
            total_bytes: None,
            speed: 0.0,
            eta_seconds: None,
            error: None,
            resume_token: None,
            created_at: chrono::Utc::now().timestamp(),
        }
    }

    /// 进入传输状态，清除上一轮的速度与错误残留
    pub fn mark_downloading(&mut self) {
        self.status = TaskStatus::Downloading;
        self.speed = 0.0;
        self.eta_seconds = None;
        self.error = None;
    }

    /// 进入取消终态，丢弃续传令牌
    pub fn mark_canceled(&mut self) {
        self.status = TaskStatus::Canceled;
        self.speed = 0.0;
        self.eta_seconds = None;
        self.resume_token = None;
    }

    /// 进入失败终态
    pub fn mark_failed(&mut self, message: String) {
        self.status = TaskStatus::Failed;
        self.speed = 0.0;
        self.eta_seconds = None;
        self.error = Some(message);
    }
}
