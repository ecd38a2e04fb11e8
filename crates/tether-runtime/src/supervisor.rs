//! Supervisor
//!
//! 状态机：`Idle -> Running -> Draining -> Closed`
//!
//! - `start` 启动一个 drain 线程，由它创建 N 个 worker 并 join 全部 worker
//! - `cancel` / `complete` 关闭句柄并进入 Draining
//! - 全部 worker 退出后，drain 线程唯一一次调用 `teardown`，然后通知关闭回调
//!
//! teardown 只有一个调用点，并且位于 join 之后。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;

use crate::config::SupervisorConfig;
use crate::error::{ProduceError, StreamError, StreamResult};
use crate::handle::{CloseReason, StreamHandle};
use crate::worker::{panic_message, ProduceFn, Worker, WorkerContext, WorkerExit, WorkerReport};

/// 会话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Running,
    Draining,
    Closed,
}

/// 会话结束时交给关闭回调的汇总
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub reason: Option<CloseReason>,
    pub pushed: u64,
    pub workers: Vec<WorkerReport>,
}

/// 存活 worker 计数
///
/// 只由 Supervisor 持有，worker 通过 `worker_exited` 递减。
#[derive(Debug, Default)]
pub struct WorkerTracker {
    live: AtomicUsize,
}

impl WorkerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn worker_started(&self) {
        self.live.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn worker_exited(&self) {
        let prev = self.live.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "worker exit without matching start");
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }
}

type ClosedCallback = Box<dyn FnOnce(&SessionSummary) + Send>;

struct Control {
    state: SessionState,
    listeners: Vec<ClosedCallback>,
}

struct Shared {
    control: Mutex<Control>,
    condvar: Condvar,
    tracker: WorkerTracker,
    summary: OnceCell<SessionSummary>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Supervisor<T> {
    handle: Arc<StreamHandle<T>>,
    config: SupervisorConfig,
    produce: Arc<ProduceFn<T>>,
    shared: Arc<Shared>,
    drain_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Supervisor<T> {
    pub fn new<F>(handle: Arc<StreamHandle<T>>, config: SupervisorConfig, produce: F) -> StreamResult<Self>
    where
        F: Fn(&mut WorkerContext) -> Result<T, ProduceError> + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            handle,
            config,
            produce: Arc::new(produce),
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: SessionState::Idle,
                    listeners: Vec::new(),
                }),
                condvar: Condvar::new(),
                tracker: WorkerTracker::new(),
                summary: OnceCell::new(),
            }),
            drain_thread: Mutex::new(None),
        })
    }

    /// 启动 worker 池，不阻塞
    pub fn start(&self) -> StreamResult<()> {
        {
            let mut control = self.shared.lock();
            if control.state != SessionState::Idle {
                return Err(StreamError::InvalidState {
                    expected: SessionState::Idle,
                    actual: control.state,
                });
            }
            control.state = SessionState::Running;
        }

        let shared = Arc::clone(&self.shared);
        let handle = Arc::clone(&self.handle);
        let produce = Arc::clone(&self.produce);
        let config = self.config.clone();

        let spawned = thread::Builder::new()
            .name(format!("{}-supervisor", self.config.thread_name))
            .spawn(move || drain(shared, handle, produce, config));

        match spawned {
            Ok(join) => {
                tracing::info!(workers = self.config.worker_count, "supervisor started");
                *self.drain_thread.lock().unwrap_or_else(PoisonError::into_inner) = Some(join);
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to spawn supervisor thread");
                self.handle.request_close(CloseReason::Exhausted);
                finish(&self.shared, &self.handle, Vec::new());
                Err(StreamError::Spawn(err))
            }
        }
    }

    /// ManagingRuntime 取消流（幂等）
    pub fn cancel(&self) {
        self.begin_drain(CloseReason::Cancelled);
    }

    /// Supervisor 判定会话已自然结束
    pub fn complete(&self) {
        self.begin_drain(CloseReason::Completed);
    }

    fn begin_drain(&self, reason: CloseReason) {
        let first = self.handle.request_close(reason);
        let mut control = self.shared.lock();
        match control.state {
            SessionState::Running => {
                control.state = SessionState::Draining;
                self.shared.condvar.notify_all();
                tracing::info!(?reason, first, "supervisor draining");
            }
            SessionState::Idle => {
                // 从未启动：直接在当前线程释放并通知
                control.state = SessionState::Draining;
                drop(control);
                finish(&self.shared, &self.handle, Vec::new());
            }
            SessionState::Draining | SessionState::Closed => {}
        }
    }

    /// 注册关闭回调；会话已关闭时立即调用
    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce(&SessionSummary) + Send + 'static,
    {
        let mut control = self.shared.lock();
        if control.state == SessionState::Closed {
            drop(control);
            if let Some(summary) = self.shared.summary.get() {
                callback(summary);
            }
        } else {
            control.listeners.push(Box::new(callback));
        }
    }

    /// 阻塞直到会话关闭
    pub fn wait(&self) -> SessionSummary {
        let mut control = self.shared.lock();
        while control.state != SessionState::Closed {
            control = self.shared.condvar.wait(control).unwrap_or_else(PoisonError::into_inner);
        }
        drop(control);
        self.closed_summary()
    }

    /// 带超时的等待，超时返回 None
    pub fn wait_timeout(&self, timeout: Duration) -> Option<SessionSummary> {
        let deadline = Instant::now() + timeout;
        let mut control = self.shared.lock();
        while control.state != SessionState::Closed {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            control = self
                .shared
                .condvar
                .wait_timeout(control, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        drop(control);
        Some(self.closed_summary())
    }

    fn closed_summary(&self) -> SessionSummary {
        self.shared.summary.get().cloned().unwrap_or_else(|| SessionSummary {
            reason: self.handle.close_reason(),
            pushed: self.handle.pushed(),
            workers: Vec::new(),
        })
    }
}

impl<T> Supervisor<T> {
    pub fn state(&self) -> SessionState {
        self.shared.lock().state
    }

    pub fn live_workers(&self) -> usize {
        self.shared.tracker.live()
    }

    pub fn handle(&self) -> &Arc<StreamHandle<T>> {
        &self.handle
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }
}

impl<T> Drop for Supervisor<T> {
    fn drop(&mut self) {
        let state = self.shared.lock().state;
        match state {
            SessionState::Idle => {
                self.handle.request_close(CloseReason::Cancelled);
                self.shared.lock().state = SessionState::Draining;
                finish(&self.shared, &self.handle, Vec::new());
            }
            SessionState::Running | SessionState::Draining => {
                self.handle.request_close(CloseReason::Cancelled);
            }
            SessionState::Closed => {}
        }

        let join = self.drain_thread.get_mut().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(join) = join {
            // 在关闭回调里丢弃 Supervisor 时不能 join 自己
            if join.thread().id() != thread::current().id() {
                let _ = join.join();
            }
        }
    }
}

/// drain 线程：创建 worker、join 全部 worker、释放句柄
fn drain<T: Send + 'static>(
    shared: Arc<Shared>,
    handle: Arc<StreamHandle<T>>,
    produce: Arc<ProduceFn<T>>,
    config: SupervisorConfig,
) {
    let mut joins = Vec::with_capacity(config.worker_count);

    for id in 0..config.worker_count {
        let worker = Worker::new(id, Arc::clone(&handle), Arc::clone(&produce))
            .with_delays(config.warmup, config.pacing);
        let pushed = worker.pushed_counter();
        let worker_shared = Arc::clone(&shared);

        shared.tracker.worker_started();
        let spawned = thread::Builder::new()
            .name(format!("{}-worker-{}", config.thread_name, id))
            .spawn(move || worker.run(&worker_shared.tracker));

        match spawned {
            Ok(join) => joins.push((id, pushed, join)),
            Err(err) => {
                shared.tracker.worker_exited();
                tracing::error!(worker = id, error = %err, "failed to spawn worker");
                handle.request_close(CloseReason::Exhausted);
                break;
            }
        }
    }

    let reports: Vec<WorkerReport> = joins
        .into_iter()
        .map(|(id, pushed, join)| match join.join() {
            Ok(report) => report,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(worker = id, %message, "worker panicked");
                WorkerReport {
                    id,
                    pushed: pushed.load(Ordering::Acquire),
                    exit: WorkerExit::Panicked(message),
                }
            }
        })
        .collect();

    // 所有 worker 自行退出（例如全部生产失败）时也进入 Draining
    if handle.request_close(CloseReason::Exhausted) {
        tracing::info!("all workers exited, stream exhausted");
    }
    {
        let mut control = shared.lock();
        if control.state == SessionState::Running {
            control.state = SessionState::Draining;
        }
    }

    finish(&shared, &handle, reports);
}

/// Draining -> Closed：唯一的 teardown 调用点
fn finish<T>(shared: &Shared, handle: &StreamHandle<T>, workers: Vec<WorkerReport>) {
    debug_assert_eq!(shared.tracker.live(), 0, "teardown with live workers");

    // 违约只记录日志，会话仍要进入 Closed 并通知回调
    if let Err(err) = handle.teardown() {
        tracing::error!(error = %err, "supervisor teardown contract violated");
    }

    let summary = SessionSummary {
        reason: handle.close_reason(),
        pushed: handle.pushed(),
        workers,
    };
    let summary = match shared.summary.try_insert(summary) {
        Ok(summary) => summary,
        Err((existing, _)) => existing,
    };

    // 回调在锁外执行；回调期间新注册的回调在下一轮取出
    loop {
        let pending = {
            let mut control = shared.lock();
            if control.listeners.is_empty() {
                control.state = SessionState::Closed;
                shared.condvar.notify_all();
                break;
            }
            std::mem::take(&mut control.listeners)
        };
        for callback in pending {
            callback(summary);
        }
    }

    tracing::info!(reason = ?summary.reason, pushed = summary.pushed, "stream closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ItemChannel;
    use crate::sink::sink_fn;
    use std::sync::Weak;

    struct Observed {
        releases: Arc<AtomicUsize>,
        closures: Arc<AtomicUsize>,
    }

    fn counted_handle() -> (Arc<StreamHandle<u64>>, Arc<ItemChannel<u64>>, Arc<AtomicUsize>) {
        let channel = Arc::new(ItemChannel::new());
        let releases = Arc::new(AtomicUsize::new(0));
        let releases_hook = Arc::clone(&releases);
        let handle = StreamHandle::new(Arc::clone(&channel))
            .on_release(move || {
                releases_hook.fetch_add(1, Ordering::SeqCst);
            })
            .into_shared();
        (handle, channel, releases)
    }

    fn watch<T: Send + 'static>(supervisor: &Supervisor<T>, releases: Arc<AtomicUsize>) -> Observed {
        let closures = Arc::new(AtomicUsize::new(0));
        let closures_cb = Arc::clone(&closures);
        supervisor.on_closed(move |_summary| {
            closures_cb.fetch_add(1, Ordering::SeqCst);
        });
        Observed { releases, closures }
    }

    fn sequential(ctx: &mut WorkerContext) -> Result<u64, ProduceError> {
        Ok(ctx.sequence())
    }

    #[test]
    fn test_cancel_releases_exactly_once() {
        for workers in 1..=8 {
            let (handle, _channel, releases) = counted_handle();
            let supervisor = Supervisor::new(handle, SupervisorConfig::new(workers), sequential).unwrap();
            let observed = watch(&supervisor, releases);

            supervisor.start().unwrap();
            thread::sleep(Duration::from_millis(2));
            supervisor.cancel();
            let summary = supervisor.wait();

            assert_eq!(supervisor.state(), SessionState::Closed);
            assert_eq!(summary.reason, Some(CloseReason::Cancelled));
            assert_eq!(summary.workers.len(), workers);
            assert_eq!(supervisor.live_workers(), 0);
            assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
            assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_two_workers_cancel_after_ten_items() {
        let (handle, channel, releases) = counted_handle();
        let supervisor = Arc::new(
            Supervisor::new(handle, SupervisorConfig::new(2), sequential).unwrap(),
        );
        let observed = watch(&supervisor, releases);

        supervisor.start().unwrap();

        let mut received = 0;
        while received < 10 {
            channel.recv().unwrap();
            received += 1;
        }
        supervisor.cancel();
        let summary = supervisor.wait();

        while channel.try_recv().is_some() {
            received += 1;
        }
        // sink 收到的总数 = 已读取 + 通道剩余
        let accepted = summary.pushed as usize;
        assert_eq!(accepted, received);
        assert!(accepted >= 10);
        assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
        assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_two_workers_cancel_at_ten_items() {
        // sink 收到第 10 个数据项时取消：每个 worker 最多再多推一个
        let accepted = Arc::new(AtomicUsize::new(0));
        let target: Arc<OnceCell<Weak<Supervisor<u64>>>> = Arc::new(OnceCell::new());

        let accepted_sink = Arc::clone(&accepted);
        let target_sink = Arc::clone(&target);
        let handle = StreamHandle::new(sink_fn(move |_item: u64| {
            if accepted_sink.fetch_add(1, Ordering::SeqCst) + 1 == 10 {
                if let Some(supervisor) = target_sink.get().and_then(Weak::upgrade) {
                    supervisor.cancel();
                }
            }
        }))
        .into_shared();

        let supervisor = Arc::new(Supervisor::new(handle, SupervisorConfig::new(2), sequential).unwrap());
        let _ = target.set(Arc::downgrade(&supervisor));
        let closures = Arc::new(AtomicUsize::new(0));
        let closures_cb = Arc::clone(&closures);
        supervisor.on_closed(move |_| {
            closures_cb.fetch_add(1, Ordering::SeqCst);
        });

        supervisor.start().unwrap();
        let summary = supervisor.wait();

        let total = accepted.load(Ordering::SeqCst);
        assert!((10..=12).contains(&total), "accepted {total}");
        assert_eq!(summary.pushed as usize, total);
        assert_eq!(summary.reason, Some(CloseReason::Cancelled));
        assert_eq!(closures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stream_stays_open_without_trigger() {
        let (handle, channel, releases) = counted_handle();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(2), sequential).unwrap();
        let observed = watch(&supervisor, releases);

        supervisor.start().unwrap();
        for _ in 0..100 {
            channel.recv().unwrap();
        }
        assert!(supervisor.wait_timeout(Duration::from_millis(20)).is_none());
        assert_eq!(supervisor.state(), SessionState::Running);
        assert_eq!(supervisor.live_workers(), 2);
        assert_eq!(observed.closures.load(Ordering::SeqCst), 0);

        supervisor.cancel();
        supervisor.wait();
        assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_after_external_budget() {
        let (handle, channel, releases) = counted_handle();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(3), sequential).unwrap();
        let observed = watch(&supervisor, releases);

        supervisor.start().unwrap();
        let budget = 25;
        let mut counter = 0;
        while counter < budget {
            channel.recv().unwrap();
            counter += 1;
        }
        supervisor.complete();
        let summary = supervisor.wait();

        assert_eq!(summary.reason, Some(CloseReason::Completed));
        assert!(summary.pushed >= budget);
        assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
        assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cancel_racing_complete() {
        for _ in 0..20 {
            let (handle, _channel, releases) = counted_handle();
            let supervisor = Arc::new(Supervisor::new(handle, SupervisorConfig::new(2), sequential).unwrap());
            let observed = watch(&supervisor, releases);
            supervisor.start().unwrap();

            let canceller = Arc::clone(&supervisor);
            let completer = Arc::clone(&supervisor);
            let a = thread::spawn(move || canceller.cancel());
            let b = thread::spawn(move || completer.complete());
            a.join().unwrap();
            b.join().unwrap();

            let summary = supervisor.wait();
            assert!(matches!(
                summary.reason,
                Some(CloseReason::Cancelled) | Some(CloseReason::Completed)
            ));
            assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
            assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_cancel_twice_is_cancel_once() {
        let (handle, _channel, releases) = counted_handle();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(2), sequential).unwrap();
        let observed = watch(&supervisor, releases);
        supervisor.start().unwrap();

        supervisor.cancel();
        supervisor.cancel();
        let first = supervisor.wait();
        supervisor.cancel();
        let second = supervisor.wait();

        assert_eq!(first, second);
        assert_eq!(first.reason, Some(CloseReason::Cancelled));
        assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
        assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_workers_failing_closes_once() {
        let (handle, _channel, releases) = counted_handle();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(4), |ctx: &mut WorkerContext| {
            if ctx.sequence() < 3 {
                Ok(ctx.sequence())
            } else {
                Err(ProduceError::new("exhausted"))
            }
        })
        .unwrap();
        let observed = watch(&supervisor, releases);

        supervisor.start().unwrap();
        let summary = supervisor.wait();

        assert_eq!(summary.reason, Some(CloseReason::Exhausted));
        assert_eq!(summary.pushed, 12);
        assert!(summary
            .workers
            .iter()
            .all(|report| matches!(report.exit, WorkerExit::ProduceFailed(_))));
        assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
        assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_start_twice_rejected() {
        let (handle, _channel, _releases) = counted_handle();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(1), sequential).unwrap();
        supervisor.start().unwrap();

        let err = supervisor.start().unwrap_err();
        assert!(matches!(
            err,
            StreamError::InvalidState {
                expected: SessionState::Idle,
                ..
            }
        ));
        supervisor.cancel();
        supervisor.wait();
        assert!(supervisor.start().is_err());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let (handle, _channel, _releases) = counted_handle();
        let result = Supervisor::new(handle, SupervisorConfig::new(0), sequential);
        assert!(matches!(result, Err(StreamError::Config(_))));
    }

    #[test]
    fn test_cancel_before_start_closes_without_workers() {
        let (handle, _channel, releases) = counted_handle();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(2), sequential).unwrap();
        let observed = watch(&supervisor, releases);

        supervisor.cancel();

        assert_eq!(supervisor.state(), SessionState::Closed);
        assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
        assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
        assert!(supervisor.start().is_err());
    }

    #[test]
    fn test_on_closed_after_close_runs_immediately() {
        let (handle, _channel, _releases) = counted_handle();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(1), sequential).unwrap();
        supervisor.start().unwrap();
        supervisor.cancel();
        supervisor.wait();

        let late = Arc::new(AtomicUsize::new(0));
        let late_cb = Arc::clone(&late);
        supervisor.on_closed(move |summary| {
            assert_eq!(summary.reason, Some(CloseReason::Cancelled));
            late_cb.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(late.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_running_supervisor_cancels() {
        let (handle, _channel, releases) = counted_handle();
        let supervisor = Supervisor::new(Arc::clone(&handle), SupervisorConfig::new(2), sequential).unwrap();
        supervisor.start().unwrap();
        drop(supervisor);

        assert!(handle.is_torn_down());
        assert_eq!(handle.close_reason(), Some(CloseReason::Cancelled));
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_closed_channel_consumer_cancels_stream() {
        let channel = Arc::new(ItemChannel::new());
        let handle = StreamHandle::new(Arc::clone(&channel))
            .with_cancel_query(Arc::clone(&channel))
            .into_shared();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(2), sequential).unwrap();
        supervisor.start().unwrap();

        channel.recv().unwrap();
        channel.close();
        let summary = supervisor.wait();

        assert_eq!(summary.reason, Some(CloseReason::External));
    }

    #[test]
    fn test_early_teardown_still_closes_and_notifies() {
        let (handle, _channel, releases) = counted_handle();
        let supervisor = Supervisor::new(Arc::clone(&handle), SupervisorConfig::new(2), sequential).unwrap();
        let observed = watch(&supervisor, releases);
        supervisor.start().unwrap();

        // 在 worker 仍存活时释放，supervisor 的释放会遇到 TeardownViolation
        handle.teardown().unwrap();
        supervisor.cancel();
        let summary = supervisor
            .wait_timeout(Duration::from_secs(5))
            .expect("session did not close");

        assert_eq!(supervisor.state(), SessionState::Closed);
        assert_eq!(summary.reason, Some(CloseReason::Completed));
        assert_eq!(observed.releases.load(Ordering::SeqCst), 1);
        assert_eq!(observed.closures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_sink_keeps_worker_push_count() {
        let handle = StreamHandle::new(sink_fn(|item: u64| {
            if item == 3 {
                panic!("sink rejected item 3");
            }
        }))
        .into_shared();
        let supervisor = Supervisor::new(handle, SupervisorConfig::new(1), sequential).unwrap();

        supervisor.start().unwrap();
        let summary = supervisor.wait();

        assert_eq!(summary.reason, Some(CloseReason::Exhausted));
        assert_eq!(summary.pushed, 3);
        assert_eq!(summary.workers.len(), 1);
        assert_eq!(summary.workers[0].pushed, 3);
        assert_eq!(
            summary.workers[0].exit,
            WorkerExit::Panicked("sink rejected item 3".to_string())
        );
    }
}
