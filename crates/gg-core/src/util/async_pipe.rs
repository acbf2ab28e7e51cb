//! 异步管道：sink 与 source 之间的"下一拍"解耦器。
//!
//! 接收侧立即收下缓冲（或队满拒收），转发推迟到定时器的下一次触发。
//! 用它可以在同一个调度器回合内打断同步调用链，模拟元素之间真实存在的
//! 异步边界；协议测试大量依赖这一点来复现乱序的调度交错。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{GgError, GgResult};
use crate::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};
use crate::timer::{Timer, TimerId, TimerListener, TimerScheduler};

struct PipeState {
    pending: VecDeque<(Buffer, Option<BufferMetadata>)>,
    capacity: usize,
    sink_blocked: bool,
    starved: bool,
}

/// sink→source 解耦器；转发发生在调度器的下一次推进。
pub struct AsyncPipe {
    timer: Timer,
    state: Mutex<PipeState>,
    sink: Mutex<Option<Arc<dyn DataSink>>>,
    listener: Mutex<Option<Weak<dyn DataSinkListener>>>,
    weak_self: Weak<Self>,
}

impl AsyncPipe {
    /// 以调度器和队列容量（至少 1）构造。
    #[must_use]
    pub fn new(scheduler: &Arc<TimerScheduler>, capacity: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            timer: scheduler.create_timer(),
            state: Mutex::new(PipeState {
                pending: VecDeque::new(),
                capacity: capacity.max(1),
                sink_blocked: false,
                starved: false,
            }),
            sink: Mutex::new(None),
            listener: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    fn arm_timer(&self) {
        let listener: Weak<dyn TimerListener> = self.weak_self.clone();
        // 调度器已销毁时泵送自然停摆，忽略即可。
        let _ = self.timer.schedule(listener, 0);
    }

    fn drain(&self) {
        loop {
            let Some(sink) = self.sink.lock().clone() else {
                return;
            };
            let item = {
                let mut state = self.state.lock();
                if state.sink_blocked {
                    return;
                }
                state.pending.pop_front()
            };
            let Some((buffer, metadata)) = item else { break };
            match sink.put_data(&buffer, metadata.as_ref()) {
                Ok(()) => {}
                Err(error) if error.is_would_block() => {
                    let mut state = self.state.lock();
                    state.pending.push_front((buffer, metadata));
                    state.sink_blocked = true;
                    return;
                }
                Err(_) => {
                    // 丢弃并继续：管道不传播下游的致命错误。
                }
            }
        }
        let notify = {
            let mut state = self.state.lock();
            if state.starved && state.pending.len() < state.capacity {
                state.starved = false;
                true
            } else {
                false
            }
        };
        if notify
            && let Some(listener) = self.listener.lock().clone().and_then(|weak| weak.upgrade())
        {
            listener.on_can_put();
        }
    }
}

impl DataSink for AsyncPipe {
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()> {
        {
            let mut state = self.state.lock();
            if state.pending.len() >= state.capacity {
                state.starved = true;
                return Err(GgError::WouldBlock);
            }
            state.pending.push_back((data.clone(), metadata.copied()));
        }
        self.arm_timer();
        Ok(())
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        *self.listener.lock() = listener;
        Ok(())
    }
}

impl DataSource for AsyncPipe {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(previous) = self.sink.lock().take() {
            let _ = previous.set_listener(None);
        }
        if let Some(sink) = sink {
            let listener: Weak<dyn DataSinkListener> = self.weak_self.clone();
            sink.set_listener(Some(listener))?;
            *self.sink.lock() = Some(sink);
        }
        Ok(())
    }
}

impl TimerListener for AsyncPipe {
    fn on_timer_fired(&self, _timer_id: TimerId, _elapsed: u64) {
        self.drain();
    }
}

impl DataSinkListener for AsyncPipe {
    fn on_can_put(&self) {
        self.state.lock().sink_blocked = false;
        self.drain();
    }
}
