use thiserror::Error;

/// 传输层错误
///
/// 引擎不会跨协调器边界抛出异常，所有失败都以 `failed` 事件携带此类型送达
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// 非 2xx 响应
    #[error("HTTP 状态码异常: {0}")]
    HttpStatus(u16),
    /// 响应格式无法处理（例如续传请求得到意料之外的状态）
    #[error("响应无效或无法处理")]
    InvalidResponse,
    /// 连接/协议等传输层失败，带可读描述
    #[error("传输失败: {0}")]
    Transfer(String),
}

/// 收尾阶段错误
#[derive(Debug, Clone, Error)]
pub enum FinalizeError {
    /// 保存位置访问授权失败
    #[error("访问授权失败: {0}")]
    Access(String),
    /// 目标目录创建失败
    #[error("创建目标目录失败: {0}")]
    CreateDir(String),
    /// 文件落位失败
    #[error("文件移动失败: {0}")]
    Relocate(String),
}

/// 安全位置令牌错误
///
/// `Stale` 不是致命错误：解析失败时收尾流程会退回使用原始路径
#[derive(Debug, Clone, Error)]
pub enum BookmarkError {
    /// 令牌指向的目录已不存在或无法解析
    #[error("位置令牌已失效")]
    Stale,
    /// 令牌字节无法解码
    #[error("位置令牌格式无效")]
    Invalid,
    /// 底层文件系统错误
    #[error("文件系统错误: {0}")]
    Io(String),
}
