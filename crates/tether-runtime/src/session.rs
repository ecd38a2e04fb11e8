//! ManagingRuntime 接口
//!
//! `create_stream` 组装通道、句柄和 Supervisor；调用方先注册 `on_closed`，再 `start`。

use std::sync::Arc;

use crate::channel::ItemChannel;
use crate::config::SupervisorConfig;
use crate::error::{ProduceError, StreamResult};
use crate::handle::StreamHandle;
use crate::sink::Sink;
use crate::supervisor::{SessionSummary, Supervisor};
use crate::worker::WorkerContext;

/// 一次流会话
pub struct StreamSession<T> {
    pub handle: Arc<StreamHandle<T>>,
    pub supervisor: Supervisor<T>,
    /// 消费端通道；teardown 时关闭，读完剩余数据后迭代结束
    pub items: Arc<ItemChannel<T>>,
}

impl<T: Send + 'static> StreamSession<T> {
    pub fn start(&self) -> StreamResult<()> {
        self.supervisor.start()
    }

    pub fn cancel(&self) {
        self.supervisor.cancel();
    }
}

/// 以默认配置创建 `worker_count` 个 worker 的流
pub fn create_stream<T, F>(worker_count: usize, produce: F) -> StreamResult<StreamSession<T>>
where
    T: Send + 'static,
    F: Fn(&mut WorkerContext) -> Result<T, ProduceError> + Send + Sync + 'static,
{
    create_channel_stream(SupervisorConfig::new(worker_count), produce)
}

/// 以通道为 Sink 创建流
///
/// 消费者关闭通道等价于外部取消；流关闭时阻塞在满通道上的 worker 会被唤醒。
pub fn create_channel_stream<T, F>(config: SupervisorConfig, produce: F) -> StreamResult<StreamSession<T>>
where
    T: Send + 'static,
    F: Fn(&mut WorkerContext) -> Result<T, ProduceError> + Send + Sync + 'static,
{
    config.validate()?;
    let items = Arc::new(ItemChannel::with_capacity(config.channel_capacity));
    let on_close = Arc::clone(&items);
    let on_release = Arc::clone(&items);

    let handle = StreamHandle::new(Arc::clone(&items))
        .with_cancel_query(Arc::clone(&items))
        .with_close_notify(move || on_close.stop_senders())
        .on_release(move || on_release.close())
        .into_shared();
    let supervisor = Supervisor::new(Arc::clone(&handle), config, produce)?;

    Ok(StreamSession {
        handle,
        supervisor,
        items,
    })
}

/// 使用自定义 Sink 创建流，返回未启动的 Supervisor
pub fn create_stream_with<T, S, F>(
    config: SupervisorConfig,
    sink: S,
    produce: F,
) -> StreamResult<(Arc<StreamHandle<T>>, Supervisor<T>)>
where
    T: Send + 'static,
    S: Sink<T> + 'static,
    F: Fn(&mut WorkerContext) -> Result<T, ProduceError> + Send + Sync + 'static,
{
    let handle = StreamHandle::new(sink).into_shared();
    let supervisor = Supervisor::new(Arc::clone(&handle), config, produce)?;
    Ok((handle, supervisor))
}

pub fn cancel<T: Send + 'static>(supervisor: &Supervisor<T>) {
    supervisor.cancel();
}

pub fn on_closed<T, F>(supervisor: &Supervisor<T>, callback: F)
where
    T: Send + 'static,
    F: FnOnce(&SessionSummary) + Send + 'static,
{
    supervisor.on_closed(callback);
}
