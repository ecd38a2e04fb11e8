//! 原生线程句柄
//!
//! 供自行创建线程的 C 代码使用。C 侧约定：
//!
//! ```c
//! typedef void *Context;
//! typedef struct TetherCHandle {
//!     Context context;
//!     int (*push)(Context, const char *);
//!     int (*is_done)(Context);
//!     void (*release)(struct TetherCHandle *);
//! } TetherCHandle;
//!
//! void init(TetherCHandle *handle);
//! ```
//!
//! C 侧的 supervisor 线程 join 完自己的 worker 之后调用一次 `handle->release(handle)`
//! （与导出的 `tether_drop_handle` 等价），把句柄交还给运行时释放。此后句柄指针失效。

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_void};
use std::sync::Arc;

use crate::channel::ItemChannel;
use crate::handle::{CloseReason, StreamHandle};

pub type Context = *mut c_void;

/// 原生线程推送的数据项：无法转换为 UTF-8 时为 Err
pub type NativeItem = Result<String, String>;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TetherCHandle {
    pub context: Context,
    pub push: unsafe extern "C" fn(Context, *const c_char) -> c_int,
    pub is_done: unsafe extern "C" fn(Context) -> c_int,
    pub release: unsafe extern "C" fn(*mut TetherCHandle),
}

/// 原生流：通道 + 句柄，C 侧通过 `TetherCHandle` 访问
pub struct NativeStream {
    handle: Arc<StreamHandle<NativeItem>>,
    items: Arc<ItemChannel<NativeItem>>,
}

impl NativeStream {
    pub fn new(capacity: usize) -> Self {
        let items = Arc::new(ItemChannel::with_capacity(capacity));
        let on_close = Arc::clone(&items);
        let on_release = Arc::clone(&items);
        let handle = StreamHandle::new(Arc::clone(&items))
            .with_cancel_query(Arc::clone(&items))
            .with_close_notify(move || on_close.stop_senders())
            .on_release(move || on_release.close())
            .into_shared();
        Self { handle, items }
    }

    pub fn handle(&self) -> &Arc<StreamHandle<NativeItem>> {
        &self.handle
    }

    pub fn items(&self) -> &Arc<ItemChannel<NativeItem>> {
        &self.items
    }

    /// 请求 C 侧停止，worker 会在下一次 `is_done` 时看到
    pub fn cancel(&self) -> bool {
        self.handle.request_close(CloseReason::Cancelled)
    }

    /// 创建交给 C 代码的句柄
    ///
    /// 返回的指针必须且只能通过 `tether_drop_handle` 释放一次。
    pub fn into_raw_handle(&self) -> *mut TetherCHandle {
        let context = Arc::into_raw(Arc::clone(&self.handle)) as Context;
        Box::into_raw(Box::new(TetherCHandle {
            context,
            push: native_push,
            is_done: native_is_done,
            release: tether_drop_handle,
        }))
    }
}

unsafe fn context_handle<'a>(context: Context) -> Option<&'a StreamHandle<NativeItem>> {
    if context.is_null() {
        return None;
    }
    Some(unsafe { &*(context as *const StreamHandle<NativeItem>) })
}

/// 返回 0 表示已接收，-1 表示流已关闭或参数无效
unsafe extern "C" fn native_push(context: Context, data: *const c_char) -> c_int {
    let Some(handle) = (unsafe { context_handle(context) }) else {
        tracing::error!("native push called with a NULL context");
        return -1;
    };
    if data.is_null() {
        tracing::error!("native push called with a NULL data pointer");
        return -1;
    }

    let item = unsafe { CStr::from_ptr(data) }
        .to_owned()
        .into_string()
        .map_err(|_| "Couldn't convert to a String".to_string());

    match handle.push(item) {
        Ok(()) => 0,
        Err(_) => -1,
    }
}

unsafe extern "C" fn native_is_done(context: Context) -> c_int {
    match unsafe { context_handle(context) } {
        Some(handle) => handle.is_closed() as c_int,
        None => 1,
    }
}

/// C 侧 join 完所有 worker 后交还句柄
#[no_mangle]
pub extern "C" fn tether_drop_handle(handle: *mut TetherCHandle) {
    if handle.is_null() {
        tracing::error!("tether_drop_handle was called with a NULL pointer");
        return;
    }
    let raw = unsafe { Box::from_raw(handle) };
    if raw.context.is_null() {
        tracing::error!("tether_drop_handle was called with a NULL context");
        return;
    }
    let stream = unsafe { Arc::from_raw(raw.context as *const StreamHandle<NativeItem>) };
    stream.request_close(CloseReason::Completed);
    if let Err(err) = stream.teardown() {
        tracing::error!(error = %err, "native handle released twice");
    }
}
