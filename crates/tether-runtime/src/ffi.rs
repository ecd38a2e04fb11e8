//! FFI 运行时支持
//!
//! 由 C 提供生产函数与 Sink，运行时负责 worker 池、取消和唯一一次释放。
//!
//! - 所有指针参数在解引用前检查 NULL
//! - panic 不会越过 FFI 边界
//! - 最近一次错误保存在线程局部存储中，可通过 `tether_last_error` 读取

use std::cell::RefCell;
use std::ffi::CString;
use std::os::raw::{c_char, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SupervisorConfig;
use crate::error::{ProduceError, StreamError};
use crate::handle::StreamHandle;
use crate::sink::{sink_fn, NullSink};
use crate::supervisor::Supervisor;
use crate::worker::{panic_message, WorkerContext};

/// 生产回调：向 `buf` 写入最多 `cap` 字节，返回写入长度；负数表示失败
pub type ProduceCallback =
    extern "C" fn(ctx: *mut c_void, worker_id: u64, sequence: u64, buf: *mut u8, cap: usize) -> i64;
/// Sink 回调：`data` 只在调用期间有效
pub type SinkCallback = extern "C" fn(ctx: *mut c_void, data: *const u8, len: usize);
/// 释放回调：teardown 时以 `sink_ctx` 调用一次
pub type ReleaseCallback = extern "C" fn(ctx: *mut c_void);
/// 关闭通知：参数为已推送数量
pub type ClosedCallback = extern "C" fn(ctx: *mut c_void, pushed: u64);

/// 状态码
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TetherStatus {
    Ok = 0,
    InvalidArgument = -1,
    InvalidState = -2,
    SpawnFailed = -3,
    Closed = -4,
    Internal = -99,
}

impl From<&StreamError> for TetherStatus {
    fn from(err: &StreamError) -> Self {
        match err {
            StreamError::Closed => TetherStatus::Closed,
            StreamError::Config(_) => TetherStatus::InvalidArgument,
            StreamError::InvalidState { .. } => TetherStatus::InvalidState,
            StreamError::Spawn(_) => TetherStatus::SpawnFailed,
            StreamError::ProduceFailure(_) | StreamError::TeardownViolation => TetherStatus::Internal,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TetherStreamConfig {
    pub worker_count: u32,
    pub warmup_us: u64,
    pub pacing_us: u64,
    /// 单个数据项的最大字节数（0 使用默认 256）
    pub item_capacity: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TetherCallbacks {
    pub produce: Option<ProduceCallback>,
    pub produce_ctx: *mut c_void,
    pub sink: Option<SinkCallback>,
    pub sink_ctx: *mut c_void,
    pub release: Option<ReleaseCallback>,
    pub on_closed: Option<ClosedCallback>,
    pub closed_ctx: *mut c_void,
}

const DEFAULT_ITEM_CAPACITY: usize = 256;

/// 包装 C 上下文指针使其可跨线程发送
///
/// C 侧保证上下文在流关闭前有效，且回调可从任意线程调用。
#[derive(Clone, Copy)]
struct SendPtr(*mut c_void);
unsafe impl Send for SendPtr {}
unsafe impl Sync for SendPtr {}

impl SendPtr {
    fn get(self) -> *mut c_void {
        self.0
    }
}

/// C 侧持有的流对象
pub struct TetherStream {
    handle: Arc<StreamHandle<Vec<u8>>>,
    supervisor: Supervisor<Vec<u8>>,
}

// ==================== 错误存储 ====================

thread_local! {
    static LAST_ERROR: RefCell<Option<CString>> = const { RefCell::new(None) };
}

fn set_last_error(msg: &str) {
    let c = CString::new(msg).unwrap_or_else(|_| CString::new("(error contained null byte)").unwrap_or_default());
    LAST_ERROR.with(|cell| {
        *cell.borrow_mut() = Some(c);
    });
}

fn status_of(err: &StreamError) -> i32 {
    set_last_error(&err.to_string());
    TetherStatus::from(err) as i32
}

/// 最近一次错误信息，没有错误时返回 NULL
///
/// 返回的指针在同一线程下一次调用 tether 函数前有效。
#[no_mangle]
pub extern "C" fn tether_last_error() -> *const c_char {
    LAST_ERROR.with(|cell| match cell.borrow().as_ref() {
        Some(msg) => msg.as_ptr(),
        None => std::ptr::null(),
    })
}

/// 所有导出函数的入口：panic 在此截住，记录错误并返回 `fallback`
fn guarded<R>(name: &str, fallback: R, f: impl FnOnce() -> R) -> R {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        tracing::error!(function = name, %message, "panic caught at ffi boundary");
        set_last_error(&format!("panic during {name}: {message}"));
        fallback
    })
}

unsafe fn deref_stream<'a>(stream: *mut TetherStream) -> Option<&'a TetherStream> {
    if stream.is_null() {
        set_last_error("null stream");
        return None;
    }
    Some(unsafe { &*stream })
}

fn build_stream(config: &TetherStreamConfig, callbacks: &TetherCallbacks) -> Result<TetherStream, StreamError> {
    let produce = callbacks
        .produce
        .ok_or_else(|| StreamError::Config("produce callback is required".into()))?;
    let supervisor_config = SupervisorConfig::new(config.worker_count as usize)
        .with_warmup(Duration::from_micros(config.warmup_us))
        .with_pacing(Duration::from_micros(config.pacing_us))
        .with_thread_name("tether-ffi");
    // 先校验，避免为无效配置创建句柄后立即触发释放回调
    supervisor_config.validate()?;

    let produce_ctx = SendPtr(callbacks.produce_ctx);
    let sink_ctx = SendPtr(callbacks.sink_ctx);
    let item_capacity = match config.item_capacity {
        0 => DEFAULT_ITEM_CAPACITY,
        n => n as usize,
    };

    let handle = match callbacks.sink {
        Some(sink) => StreamHandle::new(sink_fn(move |item: Vec<u8>| {
            sink(sink_ctx.get(), item.as_ptr(), item.len());
        })),
        None => StreamHandle::new(NullSink),
    };
    let handle = match callbacks.release {
        Some(release) => handle.on_release(move || release(sink_ctx.get())),
        None => handle,
    }
    .into_shared();

    let supervisor = Supervisor::new(Arc::clone(&handle), supervisor_config, move |ctx: &mut WorkerContext| {
        let mut buf = vec![0u8; item_capacity];
        let written = produce(
            produce_ctx.get(),
            ctx.id() as u64,
            ctx.sequence(),
            buf.as_mut_ptr(),
            buf.len(),
        );
        if written < 0 {
            return Err(ProduceError::new(format!("produce callback returned {written}")));
        }
        buf.truncate((written as usize).min(item_capacity));
        Ok(buf)
    })?;

    if let Some(on_closed) = callbacks.on_closed {
        let closed_ctx = SendPtr(callbacks.closed_ctx);
        supervisor.on_closed(move |summary| on_closed(closed_ctx.get(), summary.pushed));
    }

    Ok(TetherStream { handle, supervisor })
}

// ==================== 流生命周期 ====================

/// 创建流（未启动），失败返回 NULL
#[no_mangle]
pub extern "C" fn tether_stream_create(
    config: *const TetherStreamConfig,
    callbacks: *const TetherCallbacks,
) -> *mut TetherStream {
    guarded("tether_stream_create", std::ptr::null_mut(), || {
        if config.is_null() || callbacks.is_null() {
            set_last_error("null config or callbacks pointer");
            return std::ptr::null_mut();
        }
        let (config, callbacks) = unsafe { (&*config, &*callbacks) };
        match build_stream(config, callbacks) {
            Ok(stream) => Box::into_raw(Box::new(stream)),
            Err(err) => {
                status_of(&err);
                std::ptr::null_mut()
            }
        }
    })
}

/// 启动 worker 池，不阻塞
#[no_mangle]
pub extern "C" fn tether_stream_start(stream: *mut TetherStream) -> i32 {
    guarded("tether_stream_start", TetherStatus::Internal as i32, || {
        let Some(stream) = (unsafe { deref_stream(stream) }) else {
            return TetherStatus::InvalidArgument as i32;
        };
        match stream.supervisor.start() {
            Ok(()) => TetherStatus::Ok as i32,
            Err(err) => status_of(&err),
        }
    })
}

/// 取消流（幂等）
#[no_mangle]
pub extern "C" fn tether_stream_cancel(stream: *mut TetherStream) {
    guarded("tether_stream_cancel", (), || {
        if let Some(stream) = unsafe { deref_stream(stream) } {
            stream.supervisor.cancel();
        }
    })
}

/// 标记流自然结束
#[no_mangle]
pub extern "C" fn tether_stream_complete(stream: *mut TetherStream) {
    guarded("tether_stream_complete", (), || {
        if let Some(stream) = unsafe { deref_stream(stream) } {
            stream.supervisor.complete();
        }
    })
}

/// 阻塞直到流关闭，返回已推送数量
///
/// 不能在 on_closed 回调里调用。
#[no_mangle]
pub extern "C" fn tether_stream_wait(stream: *mut TetherStream) -> i64 {
    guarded("tether_stream_wait", TetherStatus::Internal as i64, || {
        match unsafe { deref_stream(stream) } {
            Some(stream) => stream.supervisor.wait().pushed as i64,
            None => TetherStatus::InvalidArgument as i64,
        }
    })
}

/// 检查流是否已关闭
#[no_mangle]
pub extern "C" fn tether_stream_is_closed(stream: *mut TetherStream) -> i64 {
    guarded("tether_stream_is_closed", 1, || match unsafe { deref_stream(stream) } {
        Some(stream) => stream.handle.is_closed() as i64,
        None => 1,
    })
}

/// 已推送数量
#[no_mangle]
pub extern "C" fn tether_stream_pushed(stream: *mut TetherStream) -> i64 {
    guarded("tether_stream_pushed", 0, || match unsafe { deref_stream(stream) } {
        Some(stream) => stream.handle.pushed() as i64,
        None => 0,
    })
}

/// 释放流；仍在运行时先取消并等待全部 worker 退出
#[no_mangle]
pub extern "C" fn tether_stream_free(stream: *mut TetherStream) {
    if stream.is_null() {
        return;
    }
    guarded("tether_stream_free", (), || {
        drop(unsafe { Box::from_raw(stream) });
    })
}
