//! 跨边界能力接口
//!
//! - `Sink`: 接收 worker 推送的数据项
//! - `CancelQuery`: 外部取消查询，worker 轮询
//! - `ReleaseHook`: 句柄资源释放钩子，只会被调用一次

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// 数据接收端
///
/// 由 `StreamHandle` 在持锁状态下调用，因此同一时刻只有一个调用者。
pub trait Sink<T>: Send {
    fn accept(&mut self, item: T);

    /// 返回 false 表示数据项被拒收，不计入已推送数量
    fn offer(&mut self, item: T) -> bool {
        self.accept(item);
        true
    }
}

/// 外部取消查询，可从任意 worker 线程并发调用
pub trait CancelQuery: Send + Sync {
    /// 返回 true 表示外部已请求停止
    fn check(&self) -> bool;
}

/// 资源释放钩子
pub trait ReleaseHook: Send {
    fn release(self: Box<Self>);
}

impl<F> ReleaseHook for F
where
    F: FnOnce() + Send,
{
    fn release(self: Box<Self>) {
        (*self)()
    }
}

/// 闭包形式的 Sink
pub struct FnSink<F>(F);

impl<T, F> Sink<T> for FnSink<F>
where
    F: FnMut(T) + Send,
{
    fn accept(&mut self, item: T) {
        (self.0)(item)
    }
}

/// 用闭包创建 Sink
pub fn sink_fn<T, F>(f: F) -> FnSink<F>
where
    F: FnMut(T) + Send,
{
    FnSink(f)
}

/// 闭包形式的 CancelQuery
pub struct FnCancel<F>(F);

impl<F> CancelQuery for FnCancel<F>
where
    F: Fn() -> bool + Send + Sync,
{
    fn check(&self) -> bool {
        (self.0)()
    }
}

/// 用闭包创建 CancelQuery
pub fn cancel_fn<F>(f: F) -> FnCancel<F>
where
    F: Fn() -> bool + Send + Sync,
{
    FnCancel(f)
}

impl CancelQuery for Arc<AtomicBool> {
    fn check(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// 丢弃所有数据项
pub struct NullSink;

impl<T> Sink<T> for NullSink {
    fn accept(&mut self, _item: T) {}
}
