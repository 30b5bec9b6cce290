// 安全位置令牌
//
// 保存位置可能在应用可写区域之外，访问前需要把持久化的
// 位置令牌解析回路径并显式获取访问权。令牌的生成与解析收敛在
// 一个 trait 后面，收尾流程只面对结构化的 获取/释放 语义

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::downloader::error::BookmarkError;

/// 令牌解析结果
#[derive(Debug)]
pub struct Resolution {
    /// 解析出的文件夹路径
    pub path: PathBuf,
    /// 令牌内容已过时，调用方应持久化刷新后的令牌
    pub refreshed_token: Option<Vec<u8>>,
}

/// 作用域式访问凭据，Drop 时释放
pub struct AccessGuard {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AccessGuard {
    pub fn new(release: Option<Box<dyn FnOnce() + Send>>) -> Self {
        Self { release }
    }

    /// 无需释放动作的空凭据
    pub fn noop() -> Self {
        Self { release: None }
    }
}

impl Drop for AccessGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for AccessGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessGuard").finish()
    }
}

/// 安全位置解析器
///
/// 平台相关的受限目录授权在这里注入，核心流程不感知具体机制
pub trait SecureLocationResolver: Send + Sync {
    /// 为文件夹生成可持久化的位置令牌
    fn create(&self, folder: &Path) -> Result<Vec<u8>, BookmarkError>;

    /// 把令牌解析回路径，必要时附带刷新后的令牌
    fn resolve(&self, token: &[u8]) -> Result<Resolution, BookmarkError>;

    /// 获取目录的访问权，返回作用域凭据
    fn access(&self, folder: &Path) -> Result<AccessGuard, BookmarkError>;
}

/// 令牌内部载荷
#[derive(Debug, Serialize, Deserialize)]
struct TokenPayload {
    path: PathBuf,
}

/// 默认解析器：令牌即规范化路径
///
/// 没有系统级授权机制的平台上，令牌只用于跨启动定位目录。
/// 目录被移动或删除后令牌视为失效
#[derive(Debug, Default)]
pub struct PortableResolver;

impl SecureLocationResolver for PortableResolver {
    fn create(&self, folder: &Path) -> Result<Vec<u8>, BookmarkError> {
        let canonical = folder
            .canonicalize()
            .map_err(|e| BookmarkError::Io(e.to_string()))?;
        let payload = TokenPayload { path: canonical };
        serde_json::to_vec(&payload).map_err(|e| BookmarkError::Io(e.to_string()))
    }

    fn resolve(&self, token: &[u8]) -> Result<Resolution, BookmarkError> {
        let payload: TokenPayload =
            serde_json::from_slice(token).map_err(|_| BookmarkError::Invalid)?;

        let canonical = payload.path.canonicalize().map_err(|_| BookmarkError::Stale)?;

        // 路径形态变化（例如符号链接更替）时刷新令牌
        let refreshed_token = if canonical != payload.path {
            Some(self.create(&canonical)?)
        } else {
            None
        };

        Ok(Resolution {
            path: canonical,
            refreshed_token,
        })
    }

    fn access(&self, folder: &Path) -> Result<AccessGuard, BookmarkError> {
        if !folder.is_dir() {
            return Err(BookmarkError::Stale);
        }
        Ok(AccessGuard::noop())
    }
}
