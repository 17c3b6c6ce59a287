//! 错误处理模块
//! 定义了所有应用级别的错误类型

use thiserror::Error;

/// 应用主错误类型
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// 运行时创建错误
    #[error("Runtime create error: {0}")]
    RuntimeCreate(String),
    /// Zeta分布创建错误
    #[error("Zeta distribution create error: {0}")]
    ZetaCreate(String),
    /// 键空间采样失败（拒绝次数过多）
    #[error("Key space error: {0}")]
    KeySpace(String),
    /// 存储调用错误（仅用于建表、探测等非负载路径）
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    /// IO错误
    #[error("IO error: {0}")]
    Io(String),
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Io(err.to_string())
    }
}

impl AppError {
    /// 是否为启动期配置类错误
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            AppError::Config(_) | AppError::ZetaCreate(_) | AppError::KeySpace(_)
        )
    }
}

/// 存储调用错误
///
/// 每个存储调用都显式返回该类型；负载核心在操作边界捕获，
/// 转成失败的 `OperationOutcome`，不会重试。
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("request timed out")]
    Timeout,
    #[error("request throttled: {0}")]
    Throttled(String),
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation failed: {0}")]
    Validation(String),
    /// 分页协议错误：游标不前进，或在只允许单页的场景返回了游标
    #[error("pagination protocol error: {0}")]
    Pagination(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// 存储结果类型别名
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 错误上下文扩展trait
pub trait ErrorContext<T> {
    /// 添加上下文信息
    fn with_context(self, context: &str) -> Result<T>;
}

impl<T> ErrorContext<T> for Result<T> {
    fn with_context(self, context: &str) -> Result<T> {
        self.map_err(|e| match e {
            AppError::RuntimeCreate(msg) => AppError::RuntimeCreate(format!("{context}: {msg}")),
            AppError::ZetaCreate(msg) => AppError::ZetaCreate(format!("{context}: {msg}")),
            AppError::KeySpace(msg) => AppError::KeySpace(format!("{context}: {msg}")),
            AppError::Io(msg) => AppError::Io(format!("{context}: {msg}")),
            AppError::Config(msg) => AppError::Config(format!("{context}: {msg}")),
            // 存储错误保留原始类型，便于调用方按种类处理
            AppError::Store(err) => AppError::Store(err),
        })
    }
}

impl<T> ErrorContext<T> for StoreResult<T> {
    fn with_context(self, context: &str) -> Result<T> {
        self.map_err(AppError::from).with_context(context)
    }
}
