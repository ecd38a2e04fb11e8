//! 数据项通道
//!
//! ManagingRuntime 一侧的消费队列。作为默认 Sink 接收 worker 推送的数据，
//! 关闭后也可作为 CancelQuery，让消费者通过关闭通道来取消流。

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::sink::{CancelQuery, Sink};

/// 通道内部状态（单个 Mutex 保护，保证原子性）
struct ChannelInner<T> {
    queue: VecDeque<T>,
    closed: bool,
    /// 流已关闭：拒绝新数据，但消费者仍可读完缓冲区
    senders_stopped: bool,
}

/// 线程安全通道
pub struct ItemChannel<T> {
    /// 内部状态（队列 + 关闭标志）
    inner: Mutex<ChannelInner<T>>,
    /// 条件变量，用于阻塞等待
    condvar: Condvar,
    /// 通道容量（0 表示无限）
    capacity: usize,
}

impl<T> ItemChannel<T> {
    /// 创建无界通道
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// 创建带缓冲的通道
    ///
    /// 有界通道满时 `send` 会阻塞，消费者必须持续读取或关闭通道。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ChannelInner {
                queue: VecDeque::with_capacity(capacity),
                closed: false,
                senders_stopped: false,
            }),
            condvar: Condvar::new(),
            capacity,
        }
    }

    /// 发送消息（有界且已满时阻塞）
    ///
    /// 通道关闭或 `stop_senders` 之后返回 false，阻塞中的发送者会被唤醒。
    pub fn send(&self, value: T) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if inner.closed || inner.senders_stopped {
            return false;
        }

        if self.capacity > 0 {
            while inner.queue.len() >= self.capacity {
                inner = self.condvar.wait(inner).unwrap();
                if inner.closed || inner.senders_stopped {
                    return false;
                }
            }
        }

        inner.queue.push_back(value);
        self.condvar.notify_all();
        true
    }

    /// 接收消息（阻塞），通道关闭且为空时返回 None
    pub fn recv(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(value) = inner.queue.pop_front() {
                self.condvar.notify_all();
                return Some(value);
            }

            if inner.closed {
                return None;
            }

            inner = self.condvar.wait(inner).unwrap();
        }
    }

    /// 带超时的接收
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();

        loop {
            if let Some(value) = inner.queue.pop_front() {
                self.condvar.notify_all();
                return Some(value);
            }

            if inner.closed {
                return None;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            inner = self.condvar.wait_timeout(inner, remaining).unwrap().0;
        }
    }

    /// 尝试接收消息（非阻塞）
    pub fn try_recv(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.queue.pop_front();
        if value.is_some() {
            self.condvar.notify_all();
        }
        value
    }

    /// 关闭通道，已缓冲的数据仍可读取
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.closed = true;
        self.condvar.notify_all();
    }

    /// 拒绝之后的发送并唤醒阻塞的发送者，接收端不受影响
    pub fn stop_senders(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.senders_stopped = true;
        self.condvar.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 阻塞迭代，直到通道关闭且读空
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }
}

impl<T> Default for ItemChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T> {
    channel: &'a ItemChannel<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.recv()
    }
}

impl<T: Send> Sink<T> for Arc<ItemChannel<T>> {
    fn accept(&mut self, item: T) {
        self.offer(item);
    }

    fn offer(&mut self, item: T) -> bool {
        let sent = self.send(item);
        if !sent {
            tracing::debug!("item dropped: channel no longer accepts items");
        }
        sent
    }
}

impl<T: Send> CancelQuery for Arc<ItemChannel<T>> {
    fn check(&self) -> bool {
        self.is_closed()
    }
}
