//! Supervisor 配置

use std::time::Duration;

use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// worker 数量，至少为 1
    pub worker_count: usize,
    /// worker 启动后、第一次生产前的等待时间
    pub warmup: Duration,
    /// 每轮推送之后的等待时间
    pub pacing: Duration,
    /// 线程名前缀，worker 线程名为 `{prefix}-worker-{id}`
    pub thread_name: String,
    /// 默认通道容量（0 表示无限）
    pub channel_capacity: usize,
}

impl SupervisorConfig {
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count,
            ..Self::default()
        }
    }

    pub fn with_warmup(mut self, warmup: Duration) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.worker_count == 0 {
            return Err(StreamError::Config("worker_count must be at least 1".into()));
        }
        if self.thread_name.is_empty() {
            return Err(StreamError::Config("thread_name must not be empty".into()));
        }
        Ok(())
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            warmup: Duration::ZERO,
            pacing: Duration::ZERO,
            thread_name: "tether".to_string(),
            channel_capacity: 0,
        }
    }
}
