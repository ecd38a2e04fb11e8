//! 跨边界流句柄
//!
//! `StreamHandle` 持有 Sink、外部取消查询和释放钩子，对两侧都只暴露同步过的操作：
//! - push 与 teardown 共用同一把锁，teardown 开始后 Sink 不会再被调用
//! - `closed` 是单向标志，第一个关闭者记录关闭原因
//! - teardown 只执行一次，第二次调用返回 `TeardownViolation`
//! - 关闭时运行关闭通知，唤醒阻塞在 Sink 里的 push
//!
//! teardown 只对本 crate 可见：外部只能通过 Supervisor 或原生交还路径释放。

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use once_cell::sync::OnceCell;

use crate::error::{StreamError, StreamResult};
use crate::sink::{CancelQuery, ReleaseHook, Sink};

/// 流关闭原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// ManagingRuntime 主动取消
    Cancelled,
    /// Supervisor 判定会话自然结束
    Completed,
    /// 所有 worker 都已自行退出
    Exhausted,
    /// 外部取消查询返回 true
    External,
}

/// Sink 与释放钩子，teardown 时一起取出
struct Resources<T> {
    sink: Option<Box<dyn Sink<T>>>,
    release: Option<Box<dyn ReleaseHook>>,
}

pub struct StreamHandle<T> {
    resources: Mutex<Resources<T>>,
    closed: AtomicBool,
    reason: OnceCell<CloseReason>,
    torn_down: AtomicBool,
    cancel_query: Option<Box<dyn CancelQuery>>,
    close_notify: Vec<Box<dyn Fn() + Send + Sync>>,
    pushed: AtomicU64,
}

impl<T> StreamHandle<T> {
    pub fn new(sink: impl Sink<T> + 'static) -> Self {
        Self {
            resources: Mutex::new(Resources {
                sink: Some(Box::new(sink)),
                release: None,
            }),
            closed: AtomicBool::new(false),
            reason: OnceCell::new(),
            torn_down: AtomicBool::new(false),
            cancel_query: None,
            close_notify: Vec::new(),
            pushed: AtomicU64::new(0),
        }
    }

    /// 附加外部取消查询，worker 每轮都会轮询
    pub fn with_cancel_query(mut self, query: impl CancelQuery + 'static) -> Self {
        self.cancel_query = Some(Box::new(query));
        self
    }

    /// 附加关闭通知，打开到关闭的转换发生时调用一次
    ///
    /// 可能在任意线程、包括持有 Sink 锁的 push 期间被调用，不能再调用句柄的 push。
    pub fn with_close_notify(mut self, notify: impl Fn() + Send + Sync + 'static) -> Self {
        self.close_notify.push(Box::new(notify));
        self
    }

    /// 附加释放钩子，teardown 时调用一次
    pub fn on_release(mut self, hook: impl ReleaseHook + 'static) -> Self {
        self.lock_resources_mut().release = Some(Box::new(hook));
        self
    }

    pub fn into_shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// 推送一个数据项
    ///
    /// 关闭之后开始的 push 一律失败；关闭之前已持锁的 push 可以完成。
    /// 阻塞在 Sink 中的 push 由关闭通知唤醒。
    pub fn push(&self, item: T) -> StreamResult<()> {
        // 外部查询在锁外轮询，锁内只看原子标志
        if self.is_closed() {
            return Err(StreamError::Closed);
        }
        let mut resources = self.lock_resources();
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Closed);
        }
        let Some(sink) = resources.sink.as_mut() else {
            return Err(StreamError::Closed);
        };
        if !sink.offer(item) {
            return Err(StreamError::Closed);
        }
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// 非阻塞地检查是否已关闭
    pub fn is_closed(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        match &self.cancel_query {
            Some(query) if query.check() => {
                self.request_close(CloseReason::External);
                true
            }
            _ => false,
        }
    }

    /// 请求关闭（幂等）
    ///
    /// 返回 true 表示本次调用完成了打开到关闭的转换。
    pub fn request_close(&self, reason: CloseReason) -> bool {
        let first = self.reason.set(reason).is_ok();
        self.closed.store(true, Ordering::Release);
        if first {
            tracing::debug!(?reason, "stream closed");
            for notify in &self.close_notify {
                notify();
            }
        }
        first
    }

    /// 第一个关闭者记录的原因
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }

    /// 释放 Sink 与释放钩子
    ///
    /// 只能调用一次，调用方必须保证此时没有活跃的 worker。
    pub(crate) fn teardown(&self) -> StreamResult<()> {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            tracing::error!("stream handle teardown invoked twice");
            return Err(StreamError::TeardownViolation);
        }
        self.request_close(CloseReason::Completed);

        let (sink, release) = {
            let mut resources = self.lock_resources();
            (resources.sink.take(), resources.release.take())
        };
        drop(sink);
        if let Some(hook) = release {
            hook.release();
        }
        tracing::debug!(pushed = self.pushed(), "stream handle released");
        Ok(())
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// 已被 Sink 接收的数据项数量
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    // Sink 内部 panic 不应让其它 worker 或 teardown 跟着 panic
    fn lock_resources(&self) -> MutexGuard<'_, Resources<T>> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_resources_mut(&mut self) -> &mut Resources<T> {
        self.resources.get_mut().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for StreamHandle<T> {
    fn drop(&mut self) {
        // 从未交给 Supervisor 的句柄由持有者在此释放
        if !self.is_torn_down() {
            let _ = self.teardown();
        }
    }
}

impl<T> fmt::Debug for StreamHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamHandle")
            .field("closed", &self.closed.load(Ordering::Acquire))
            .field("reason", &self.close_reason())
            .field("torn_down", &self.is_torn_down())
            .field("pushed", &self.pushed())
            .finish()
    }
}
