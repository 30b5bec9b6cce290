// 收尾器
//
// 传输完成后把临时文件落位到目标文件夹。整个流程是阻塞的
// 文件系统操作，放到阻塞线程上执行。任何一步失败都删除临时文件，
// 不留半成品

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use super::error::FinalizeError;
use super::task::SaveLocation;
use crate::filesystem::naming;
use crate::filesystem::SecureLocationResolver;

/// 收尾请求
#[derive(Debug)]
pub struct FinalizeRequest {
    pub task_id: String,
    pub temp_path: PathBuf,
    pub save_location: SaveLocation,
    pub file_name: String,
}

/// 收尾结果
#[derive(Debug)]
pub struct FinalizeOutcome {
    /// 文件最终落位的完整路径
    pub final_path: PathBuf,
    /// 实际使用的目标文件夹（令牌解析后可能与存储路径不同）
    pub resolved_folder: PathBuf,
    /// 解析过程刷新出的新令牌，调用方应持久化
    pub refreshed_token: Option<Vec<u8>>,
}

/// 执行收尾
///
/// 解析位置令牌 → 获取访问权 → 保证目录存在 → 清洗文件名 →
/// 避让同名文件 → 原子移动。令牌失效时退回使用原始路径
pub async fn run_finalize(
    resolver: Arc<dyn SecureLocationResolver>,
    request: FinalizeRequest,
) -> Result<FinalizeOutcome, FinalizeError> {
    let result = tokio::task::spawn_blocking(move || finalize_blocking(&*resolver, &request)).await;

    match result {
        Ok(outcome) => outcome,
        Err(e) => Err(FinalizeError::Relocate(format!("收尾任务异常终止: {}", e))),
    }
}

fn finalize_blocking(
    resolver: &dyn SecureLocationResolver,
    request: &FinalizeRequest,
) -> Result<FinalizeOutcome, FinalizeError> {
    let outcome = relocate(resolver, request);
    if outcome.is_err() {
        // 失败路径统一清理临时文件
        if let Err(e) = std::fs::remove_file(&request.temp_path) {
            if request.temp_path.exists() {
                warn!("任务 {} 临时文件清理失败: {}", request.task_id, e);
            }
        }
    }
    outcome
}

fn relocate(
    resolver: &dyn SecureLocationResolver,
    request: &FinalizeRequest,
) -> Result<FinalizeOutcome, FinalizeError> {
    let mut refreshed_token = None;
    let folder = match &request.save_location.bookmark {
        Some(token) => match resolver.resolve(token) {
            Ok(resolution) => {
                refreshed_token = resolution.refreshed_token;
                resolution.path
            }
            Err(e) => {
                // 令牌失效不致命，退回原始路径再试
                warn!(
                    "任务 {} 位置令牌解析失败（{}），使用原始路径",
                    request.task_id, e
                );
                request.save_location.folder.clone()
            }
        },
        None => request.save_location.folder.clone(),
    };

    let _guard = resolver
        .access(&folder)
        .map_err(|e| FinalizeError::Access(e.to_string()))?;

    naming::ensure_dir(&folder).map_err(|e| FinalizeError::CreateDir(e.to_string()))?;

    let extension = request.file_name.rsplit_once('.').map(|(_, ext)| ext);
    let safe_name = naming::sanitize_file_name(&request.file_name, extension);
    let destination = naming::unique_destination(&folder, &safe_name);

    naming::move_replacing(&request.temp_path, &destination)
        .map_err(|e| FinalizeError::Relocate(e.to_string()))?;

    Ok(FinalizeOutcome {
        final_path: destination,
        resolved_folder: folder,
        refreshed_token,
    })
}
