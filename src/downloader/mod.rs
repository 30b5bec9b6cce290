// 下载模块
//
// 传输引擎、进度估算、收尾与队列协调

pub mod engine;
pub mod error;
pub mod events;
pub mod finalizer;
pub mod manager;
pub mod progress;
pub mod save_location;
pub mod task;

pub use engine::{DownloadEngine, Transport};
pub use error::{BookmarkError, EngineError, FinalizeError};
pub use events::{DownloadEvent, EngineEvent};
pub use manager::DownloadManager;
pub use save_location::{DefaultFolderStore, JsonFileStore, SaveLocationManager};
pub use task::{DownloadTask, SaveLocation, TaskStatus};
