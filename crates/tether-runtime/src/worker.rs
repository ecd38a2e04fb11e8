//! Worker 循环
//!
//! 每个 worker 轮询关闭标志、生产数据项并推送，直到流关闭或生产失败。
//! worker 从不释放句柄资源，退出时只通知 Supervisor 的存活计数。
//!
//! 生产函数不能无限期阻塞，否则会拖住整个会话的关闭。

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::ProduceError;
use crate::handle::StreamHandle;
use crate::supervisor::WorkerTracker;

/// worker 在池中的序号
pub type WorkerId = usize;

/// 生产函数
pub type ProduceFn<T> = dyn Fn(&mut WorkerContext) -> Result<T, ProduceError> + Send + Sync;

/// 传给生产函数的 worker 局部状态
#[derive(Debug, Clone)]
pub struct WorkerContext {
    id: WorkerId,
    sequence: u64,
}

impl WorkerContext {
    pub fn new(id: WorkerId) -> Self {
        Self { id, sequence: 0 }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// 本 worker 此前已生产的数据项数量
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// worker 退出原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// 观察到流已关闭
    Closed,
    /// 生产函数返回错误或 panic
    ProduceFailed(ProduceError),
    /// Sink 在 worker 线程内 panic
    Panicked(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub id: WorkerId,
    /// 被 Sink 接收的数据项数量
    pub pushed: u64,
    pub exit: WorkerExit,
}

pub struct Worker<T> {
    id: WorkerId,
    handle: Arc<StreamHandle<T>>,
    produce: Arc<ProduceFn<T>>,
    warmup: Duration,
    pacing: Duration,
    /// 放在栈帧之外，Sink panic 后 Supervisor 仍能读到
    pushed: Arc<AtomicU64>,
}

/// 退出时递减存活计数，panic 展开时同样生效
struct ExitGuard<'a>(&'a WorkerTracker);

impl Drop for ExitGuard<'_> {
    fn drop(&mut self) {
        self.0.worker_exited();
    }
}

impl<T> Worker<T> {
    pub fn new(id: WorkerId, handle: Arc<StreamHandle<T>>, produce: Arc<ProduceFn<T>>) -> Self {
        Self {
            id,
            handle,
            produce,
            warmup: Duration::ZERO,
            pacing: Duration::ZERO,
            pushed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// 本 worker 的推送计数，run 期间持续更新
    pub fn pushed_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.pushed)
    }

    pub fn with_delays(mut self, warmup: Duration, pacing: Duration) -> Self {
        self.warmup = warmup;
        self.pacing = pacing;
        self
    }

    pub fn run(self, tracker: &WorkerTracker) -> WorkerReport {
        let _guard = ExitGuard(tracker);

        if !self.warmup.is_zero() {
            thread::sleep(self.warmup);
        }
        tracing::debug!(worker = self.id, "worker running");

        let mut ctx = WorkerContext::new(self.id);

        let exit = loop {
            if self.handle.is_closed() {
                break WorkerExit::Closed;
            }

            let produced = panic::catch_unwind(AssertUnwindSafe(|| (self.produce)(&mut ctx)));
            let item = match produced {
                Ok(Ok(item)) => item,
                Ok(Err(err)) => {
                    tracing::warn!(worker = self.id, error = %err, "produce failed, worker stopping");
                    break WorkerExit::ProduceFailed(err);
                }
                Err(payload) => {
                    let err = ProduceError::new(panic_message(payload.as_ref()));
                    tracing::warn!(worker = self.id, error = %err, "produce panicked, worker stopping");
                    break WorkerExit::ProduceFailed(err);
                }
            };
            ctx.sequence += 1;

            if self.handle.push(item).is_err() {
                break WorkerExit::Closed;
            }
            self.pushed.fetch_add(1, Ordering::AcqRel);

            if !self.pacing.is_zero() {
                thread::sleep(self.pacing);
            }
        };

        let pushed = self.pushed.load(Ordering::Acquire);
        tracing::debug!(worker = self.id, pushed, ?exit, "worker shutting down");
        WorkerReport {
            id: self.id,
            pushed,
            exit,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
