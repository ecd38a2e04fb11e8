//! 错误类型
//!
//! `Closed` 是正常的关闭信号；`TeardownViolation` 表示 Supervisor 自身的实现缺陷。

use crate::supervisor::SessionState;

/// 生产函数失败
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("produce failed: {message}")]
pub struct ProduceError {
    message: String,
}

impl ProduceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// 流句柄与 Supervisor 的错误
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// 流已关闭或正在释放，push 被拒绝
    #[error("stream is closed")]
    Closed,

    /// 生产函数失败（只影响当前 worker）
    #[error(transparent)]
    ProduceFailure(#[from] ProduceError),

    /// teardown 被调用了第二次
    #[error("stream handle torn down more than once")]
    TeardownViolation,

    /// 配置无效
    #[error("invalid configuration: {0}")]
    Config(String),

    /// 状态机不允许该操作
    #[error("supervisor is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: SessionState,
        actual: SessionState,
    },

    /// 无法创建线程
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

impl StreamError {
    /// 是否是预期中的关闭信号
    pub fn is_closed(&self) -> bool {
        matches!(self, StreamError::Closed)
    }
}

pub type StreamResult<T> = Result<T, StreamError>;
