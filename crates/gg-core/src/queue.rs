//! 有界共享队列：多生产者、单消费者，双向阻塞等待。
//!
//! 事件循环的消息队列建立在它之上：任意线程 `enqueue`（满则限时等待），
//! 循环线程 `dequeue`（空则限时等待）。FIFO 顺序由内部 `VecDeque` 保证。

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
}

/// 有界 FIFO 队列。
///
/// # 契约说明（What）
/// - `enqueue` 在队列满时最多等待 `timeout`；超时将条目原样归还调用方
///   （所有权不丢失，调用方可选择重试或释放）；
/// - `dequeue` 在队列空时最多等待 `timeout`，超时返回 `None`；
/// - `timeout = None` 表示无限等待，`Some(0)` 表示只做一次非阻塞尝试。
pub struct SharedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> SharedQueue<T> {
    /// 构造容量为 `capacity`（至少 1）的队列。
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: capacity.max(1),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// 入队；队列满时等待至多 `timeout`，仍满则以 `Err(item)` 归还。
    pub fn enqueue(&self, item: T, timeout: Option<Duration>) -> Result<(), T> {
        let mut state = self.state.lock();
        loop {
            if state.items.len() < state.capacity {
                state.items.push_back(item);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            match timeout {
                None => {
                    self.not_full.wait(&mut state);
                }
                Some(duration) => {
                    if duration.is_zero()
                        || self.not_full.wait_for(&mut state, duration).timed_out()
                    {
                        return Err(item);
                    }
                }
            }
        }
    }

    /// 出队；队列空时等待至多 `timeout`，仍空返回 `None`。
    pub fn dequeue(&self, timeout: Option<Duration>) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(item);
            }
            match timeout {
                None => {
                    self.not_empty.wait(&mut state);
                }
                Some(duration) => {
                    if duration.is_zero()
                        || self.not_empty.wait_for(&mut state, duration).timed_out()
                    {
                        return None;
                    }
                }
            }
        }
    }

    /// 当前排队条目数。
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// 是否为空。
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
