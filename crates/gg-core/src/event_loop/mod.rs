//! 事件循环：单线程协作式调度器。
//!
//! # 教案目的（Why）
//! - 栈的全部回调（source/sink、定时器、事件）都约定在一个线程上执行，
//!   锁从不跨回调持有；"调度"退化为一件事：派发定时器、处理跨线程消息、
//!   并在最近的定时器截止时间内阻塞等待新工作；
//! - 跨线程世界只有三个入口：[`EventLoop::post_message`]、
//!   [`EventLoop::invoke_sync`]、[`EventLoop::invoke_async`]。其余对象的
//!   跨线程访问是未定义行为，调试构建由线程守卫捕获。
//!
//! # 交互契约（What）
//! - [`EventLoop::run`] 直到有终止请求才返回；
//! - [`EventLoop::do_work`] 执行一个工作单元：先非阻塞排空一条消息，再
//!   触发到期定时器，最后在 `max_wait` 与最近定时器两者的较小值内等待；
//!   终止请求以 `Err(Interrupted)` 上浮（不是故障，是协议）；
//! - 调用方传 `max_wait = Some(0)` 时，返回值携带"距最近定时器的毫秒数"，
//!   供外部驱动器决定下次调用时机；
//! - 消息队列容量固定于构造时；`post_message` 等待超过时限返回 `Timeout`
//!   且不入队。
//!
//! # 实现提示（How）
//! - `invoke_sync` 通过一把串行化互斥锁排队并发的同步调用，再以
//!   条件变量等待循环线程写回结果；
//! - `invoke_async` 必须自带堆分配的消息：消息执行时调用方的栈可能早已
//!   不在。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{info, trace};

use crate::error::{GgError, GgResult};
use crate::io::DataSink;
use crate::thread_guard::ThreadGuard;
use crate::timer::TimerScheduler;

mod proxy;

pub use proxy::DataSinkProxy;

/// 默认消息队列容量。
pub const LOOP_DEFAULT_QUEUE_CAPACITY: usize = 64;

/// 投递到事件循环的消息。
///
/// `handle` 在循环线程上执行并消费消息本身；消息持有的内存由 `Drop`
/// 负责归还（对应原始契约中的 `release`）。
pub trait LoopMessage: Send {
    /// 在循环线程上处理该消息。
    fn handle(self: Box<Self>);
}

impl<F> LoopMessage for F
where
    F: FnOnce() + Send + 'static,
{
    fn handle(self: Box<Self>) {
        (*self)()
    }
}

pub(crate) struct LoopShared {
    queue: crate::queue::SharedQueue<Box<dyn LoopMessage>>,
    termination_requested: AtomicBool,
    sync_gate: Mutex<()>,
}

impl LoopShared {
    pub(crate) fn post(
        &self,
        message: Box<dyn LoopMessage>,
        timeout: Option<Duration>,
    ) -> GgResult<()> {
        self.queue
            .enqueue(message, timeout)
            .map_err(|_rejected| GgError::Timeout)
    }
}

/// 单线程协作式事件循环。
///
/// 本体可被 `Arc` 共享给其它线程用于投递消息；除三个跨线程入口外的
/// 方法只允许绑定线程调用。
pub struct EventLoop {
    shared: Arc<LoopShared>,
    scheduler: Arc<TimerScheduler>,
    origin: Instant,
    guard: ThreadGuard,
}

impl EventLoop {
    /// 以默认队列容量构造。
    #[must_use]
    pub fn new() -> Self {
        Self::with_queue_capacity(LOOP_DEFAULT_QUEUE_CAPACITY)
    }

    /// 以给定消息队列容量构造。
    #[must_use]
    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            shared: Arc::new(LoopShared {
                queue: crate::queue::SharedQueue::new(queue_capacity),
                termination_requested: AtomicBool::new(false),
                sync_gate: Mutex::new(()),
            }),
            scheduler: TimerScheduler::new(),
            origin: Instant::now(),
            guard: ThreadGuard::new(),
        }
    }

    /// 记录当前线程为循环线程；重复绑定必须是同一线程。
    pub fn bind_to_current_thread(&self) -> GgResult<()> {
        self.guard.bind_to_current_thread()
    }

    /// 运行循环直到收到终止请求。
    pub fn run(&self) -> GgResult<()> {
        info!("loop starting");
        if !self.guard.is_bound() {
            self.bind_to_current_thread()?;
        } else {
            debug_assert!(self.guard.is_current_thread_bound());
        }
        self.shared
            .termination_requested
            .store(false, Ordering::SeqCst);
        loop {
            match self.do_work(None) {
                Ok(_) => {}
                Err(GgError::Interrupted) => break,
                Err(other) => return Err(other),
            }
        }
        info!("loop terminating");
        Ok(())
    }

    /// 执行一个工作单元。
    ///
    /// # 契约
    /// - 返回 `Err(Interrupted)` 表示收到终止请求；
    /// - 其余情况返回 `Ok(距最近定时器的毫秒数)`（`None` 表示无定时器）；
    /// - `max_wait = None` 表示可无限等待，`Some(0)` 表示绝不阻塞。
    pub fn do_work(&self, max_wait: Option<Duration>) -> GgResult<Option<u64>> {
        self.guard.check_binding();
        if self.termination_requested() {
            return Err(GgError::Interrupted);
        }

        // 先看有没有一条可以不等待就处理的消息。
        if let Some(message) = self.shared.queue.dequeue(Some(Duration::ZERO)) {
            trace!("processed one message");
            message.handle();
            return if self.termination_requested() {
                Err(GgError::Interrupted)
            } else {
                Ok(Some(0))
            };
        }

        // 推进时钟，触发全部到期定时器。
        self.scheduler.set_time(self.now_ms());
        let next_timer = self.scheduler.ms_until_next_timer();

        // 定时器回调里可能已请求终止。
        if self.termination_requested() {
            return Err(GgError::Interrupted);
        }

        // 在最近定时器与调用方时限的较小值内等待新消息。
        let wait = match (max_wait, next_timer) {
            (Some(limit), Some(timer)) => Some(limit.min(Duration::from_millis(timer))),
            (Some(limit), None) => Some(limit),
            (None, Some(timer)) => Some(Duration::from_millis(timer)),
            (None, None) => None,
        };
        match wait {
            Some(duration) if duration.is_zero() => {
                // 调用方要求立刻返回：把最近定时器距离交还给外部驱动器。
            }
            other => {
                if let Some(message) = self.shared.queue.dequeue(other) {
                    trace!("processed one message");
                    message.handle();
                }
            }
        }

        if self.termination_requested() {
            Err(GgError::Interrupted)
        } else {
            Ok(next_timer)
        }
    }

    /// 线程安全：向循环投递消息；队列满且等待超时返回 `Timeout`。
    ///
    /// 超时未入队的消息随错误返回一并释放（`Drop` 即 `release`）。
    pub fn post_message(
        &self,
        message: Box<dyn LoopMessage>,
        timeout: Option<Duration>,
    ) -> GgResult<()> {
        self.shared.post(message, timeout)
    }

    /// 线程安全：在循环线程上同步执行 `function` 并取回返回值。
    ///
    /// # 契约
    /// - 并发的同步调用经内部互斥锁串行排队；
    /// - 不得在循环线程上调用（必然死锁），调试构建断言捕获。
    pub fn invoke_sync<R, F>(&self, function: F) -> GgResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        debug_assert!(
            !self.guard.is_current_thread_bound(),
            "invoke_sync 不能在循环线程上调用"
        );
        let _serial = self.shared.sync_gate.lock();
        let slot: Arc<(Mutex<Option<R>>, Condvar)> = Arc::new((Mutex::new(None), Condvar::new()));
        let message_slot = Arc::clone(&slot);
        self.post_message(
            Box::new(move || {
                let result = function();
                let (cell, condvar) = &*message_slot;
                *cell.lock() = Some(result);
                condvar.notify_one();
            }),
            None,
        )?;
        let (cell, condvar) = &*slot;
        let mut result = cell.lock();
        while result.is_none() {
            condvar.wait(&mut result);
        }
        result.take().ok_or(GgError::Internal)
    }

    /// 线程安全：在循环线程上异步执行 `function`，不取回结果。
    pub fn invoke_async<F>(&self, function: F) -> GgResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // 消息必须自带堆存储：执行时调用方的栈可能已经不在。
        self.post_message(Box::new(function), None)
    }

    /// 本循环的定时器调度器。
    #[must_use]
    pub fn timer_scheduler(&self) -> &Arc<TimerScheduler> {
        &self.scheduler
    }

    /// 请求终止；只允许循环线程调用。
    pub fn request_termination(&self) {
        self.guard.check_binding();
        self.shared
            .termination_requested
            .store(true, Ordering::SeqCst);
    }

    /// 构造一条"送达即请求终止"的消息，可从任意线程投递。
    #[must_use]
    pub fn create_termination_message(&self) -> Box<dyn LoopMessage> {
        let shared = Arc::clone(&self.shared);
        Box::new(move || {
            shared.termination_requested.store(true, Ordering::SeqCst);
        })
    }

    /// 构造跨线程数据 sink 代理（详见 [`DataSinkProxy`]）。
    ///
    /// 需要在循环线程上调用：构造过程会向真实 sink 注册监听器。
    pub fn create_data_sink_proxy(
        &self,
        queue_size: usize,
        sink: Arc<dyn DataSink>,
    ) -> GgResult<Arc<DataSinkProxy>> {
        self.guard.check_binding();
        DataSinkProxy::new(Arc::clone(&self.shared), queue_size, sink)
    }

    fn termination_requested(&self) -> bool {
        self.shared.termination_requested.load(Ordering::SeqCst)
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}
