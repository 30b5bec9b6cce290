// 默认保存位置管理
//
// 维护全局默认保存位置：应用可写区域内的文件夹直接用路径，
// 区域外的文件夹生成安全位置令牌并持久化。存储后端通过 trait 注入

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::RwLock;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::task::SaveLocation;
use crate::filesystem::SecureLocationResolver;

/// 持久化的位置记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredLocation {
    pub folder: PathBuf,
    /// base64 编码的位置令牌
    pub bookmark_b64: Option<String>,
}

/// 默认位置存储后端
pub trait DefaultFolderStore: Send + Sync {
    fn get(&self) -> Result<Option<StoredLocation>>;
    fn set(&self, location: &StoredLocation) -> Result<()>;
}

/// JSON 文件存储
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl DefaultFolderStore for JsonFileStore {
    fn get(&self) -> Result<Option<StoredLocation>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let data = std::fs::read(&self.path)
            .with_context(|| format!("读取默认位置文件失败: {}", self.path.display()))?;
        let location = serde_json::from_slice(&data).context("默认位置文件格式无效")?;
        Ok(Some(location))
    }

    fn set(&self, location: &StoredLocation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("创建目录失败: {}", parent.display()))?;
        }
        let data = serde_json::to_vec_pretty(location)?;
        std::fs::write(&self.path, data)
            .with_context(|| format!("写入默认位置文件失败: {}", self.path.display()))?;
        Ok(())
    }
}

/// 保存位置管理器
pub struct SaveLocationManager {
    resolver: Arc<dyn SecureLocationResolver>,
    store: Box<dyn DefaultFolderStore>,
    app_dir: PathBuf,
    current: RwLock<SaveLocation>,
}

impl SaveLocationManager {
    /// 加载存储的默认位置，无存储或令牌失效时回退到应用内下载目录
    pub fn new(
        resolver: Arc<dyn SecureLocationResolver>,
        store: Box<dyn DefaultFolderStore>,
        app_dir: PathBuf,
    ) -> Result<Self> {
        let manager = Self {
            resolver,
            store,
            app_dir,
            current: RwLock::new(SaveLocation::new(PathBuf::new(), None)),
        };

        let initial = manager.load_initial()?;
        if let Ok(mut current) = manager.current.write() {
            *current = initial;
        }
        Ok(manager)
    }

    fn load_initial(&self) -> Result<SaveLocation> {
        match self.store.get() {
            Ok(Some(stored)) => {
                let bookmark = stored
                    .bookmark_b64
                    .as_deref()
                    .and_then(|b64| BASE64.decode(b64).ok());

                if let Some(token) = &bookmark {
                    match self.resolver.resolve(token) {
                        Ok(resolution) => {
                            // 解析过程刷新了令牌就立即写回
                            if let Some(refreshed) = &resolution.refreshed_token {
                                self.persist(&resolution.path, Some(refreshed))?;
                                return Ok(SaveLocation::new(
                                    resolution.path,
                                    Some(refreshed.clone()),
                                ));
                            }
                            return Ok(SaveLocation::new(resolution.path, bookmark));
                        }
                        Err(e) => {
                            warn!("存储的位置令牌解析失败（{}），回退到默认目录", e);
                        }
                    }
                } else if stored.folder.is_dir() {
                    return Ok(SaveLocation::new(stored.folder, None));
                }
            }
            Ok(None) => {}
            Err(e) => warn!("读取默认位置失败（{}），回退到默认目录", e),
        }

        let fallback = self.default_downloads_folder();
        std::fs::create_dir_all(&fallback)
            .with_context(|| format!("创建下载目录失败: {}", fallback.display()))?;
        Ok(SaveLocation::new(fallback, None))
    }

    /// 应用内默认下载目录
    pub fn default_downloads_folder(&self) -> PathBuf {
        self.app_dir.join("Downloads")
    }

    /// 当前默认保存位置
    pub fn default_location(&self) -> SaveLocation {
        self.current
            .read()
            .map(|c| c.clone())
            .unwrap_or_else(|_| SaveLocation::new(self.default_downloads_folder(), None))
    }

    /// 设置新的默认保存位置
    ///
    /// 应用目录之外的文件夹需要生成位置令牌
    pub fn set_default(&self, folder: PathBuf) -> Result<SaveLocation> {
        let bookmark = if folder.starts_with(&self.app_dir) {
            None
        } else {
            match self.resolver.create(&folder) {
                Ok(token) => Some(token),
                Err(e) => {
                    warn!("文件夹 {} 令牌生成失败: {}", folder.display(), e);
                    None
                }
            }
        };

        self.persist(&folder, bookmark.as_deref())?;
        let location = SaveLocation::new(folder, bookmark);
        if let Ok(mut current) = self.current.write() {
            *current = location.clone();
        }
        info!("默认保存位置已更新: {}", location.folder.display());
        Ok(location)
    }

    /// 收尾过程刷新了令牌时写回存储
    ///
    /// 只有与当前默认位置一致的文件夹才更新，任务级自定义位置不持久化
    pub fn persist_refreshed_token(&self, folder: &Path, token: &[u8]) {
        let is_default = self
            .current
            .read()
            .map(|c| c.folder == folder)
            .unwrap_or(false);
        if !is_default {
            return;
        }
        if let Err(e) = self.persist(folder, Some(token)) {
            warn!("刷新后的位置令牌写回失败: {}", e);
            return;
        }
        if let Ok(mut current) = self.current.write() {
            current.bookmark = Some(token.to_vec());
        }
    }

    fn persist(&self, folder: &Path, token: Option<&[u8]>) -> Result<()> {
        self.store.set(&StoredLocation {
            folder: folder.to_path_buf(),
            bookmark_b64: token.map(|t| BASE64.encode(t)),
        })
    }
}
