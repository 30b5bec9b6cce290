// 下载事件定义
//
// 协调器通过广播通道向外发布类型化事件，订阅者（CLI、测试）按需消费

use serde::{Deserialize, Serialize};

use super::error::EngineError;
use super::task::TaskStatus;

/// 对外发布的下载事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum DownloadEvent {
    /// 任务已创建并入队
    Created {
        task_id: String,
        url: String,
        file_name: String,
    },
    /// 进度更新（已按 0.2 秒节流）
    Progress {
        task_id: String,
        bytes_written: u64,
        total_bytes: Option<u64>,
        progress: Option<f64>,
        speed: f64,
        eta_seconds: Option<f64>,
    },
    /// 状态迁移
    StatusChanged {
        task_id: String,
        old_status: TaskStatus,
        new_status: TaskStatus,
    },
    /// 服务端建议的文件名生效
    NameChanged { task_id: String, file_name: String },
    /// 已暂停（引擎确认后）
    Paused { task_id: String },
    /// 已恢复
    Resumed { task_id: String },
    /// 已完成（文件已落位）
    Completed { task_id: String, completed_at: i64 },
    /// 已失败
    Failed { task_id: String, error: String },
    /// 已取消
    Canceled { task_id: String },
}

impl DownloadEvent {
    pub fn task_id(&self) -> &str {
        match self {
            DownloadEvent::Created { task_id, .. }
            | DownloadEvent::Progress { task_id, .. }
            | DownloadEvent::StatusChanged { task_id, .. }
            | DownloadEvent::NameChanged { task_id, .. }
            | DownloadEvent::Paused { task_id }
            | DownloadEvent::Resumed { task_id }
            | DownloadEvent::Completed { task_id, .. }
            | DownloadEvent::Failed { task_id, .. }
            | DownloadEvent::Canceled { task_id } => task_id,
        }
    }
}

/// 引擎内部事件
///
/// 引擎到协调器的单向通道载荷，不对外暴露。
/// 同一任务的事件按发送顺序到达
#[derive(Debug)]
pub enum EngineEvent {
    /// 收到数据块后的进度汇报（未节流，由协调器节流）
    Progress {
        task_id: String,
        bytes_written: u64,
        total_bytes: Option<u64>,
    },
    /// 从响应头解析出的建议文件名（每次传输至多一次）
    SuggestedName { task_id: String, name: String },
    /// 暂停确认；令牌缺失表示落盘失败，只能从头重来
    Paused {
        task_id: String,
        resume_token: Option<Vec<u8>>,
    },
    /// 传输完成，临时文件就绪
    Finished {
        task_id: String,
        temp_path: std::path::PathBuf,
    },
    /// 传输失败（不包括主动取消）
    Failed {
        task_id: String,
        error: EngineError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_tag() {
        let event = DownloadEvent::Paused {
            task_id: "abc".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"paused\""));
        assert!(json.contains("\"task_id\":\"abc\""));
    }

    #[test]
    fn test_status_changed_payload() {
        let event = DownloadEvent::StatusChanged {
            task_id: "t1".to_string(),
            old_status: TaskStatus::Queued,
            new_status: TaskStatus::Downloading,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"old_status\":\"queued\""));
        assert!(json.contains("\"new_status\":\"downloading\""));
    }

    #[test]
    fn test_task_id_accessor() {
        let event = DownloadEvent::Failed {
            task_id: "xyz".to_string(),
            error: "boom".to_string(),
        };
        assert_eq!(event.task_id(), "xyz");
    }
}
