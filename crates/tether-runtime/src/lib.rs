//! Tether Runtime Library
//!
//! 跨语言边界的流句柄：原生线程推送数据、感知取消，运行时不会出现
//! use-after-free、重复释放或数据竞争。
//!
//! ## 模块结构
//! - `sink`: Sink / 取消查询 / 释放钩子能力接口
//! - `channel`: 消费端通道
//! - `handle`: 流句柄
//! - `worker`: worker 循环
//! - `supervisor`: worker 池与唯一一次释放
//! - `session`: ManagingRuntime 接口
//! - `native`: 供 C 线程使用的句柄
//! - `ffi`: C ABI

mod config;
mod error;
mod sink;
mod channel;
mod handle;
mod worker;
mod supervisor;
mod session;
mod native;
mod ffi;

pub use config::*;
pub use error::*;
pub use sink::*;
pub use channel::*;
pub use handle::*;
pub use worker::*;
pub use supervisor::*;
pub use session::*;
pub use native::*;
pub use ffi::*;
