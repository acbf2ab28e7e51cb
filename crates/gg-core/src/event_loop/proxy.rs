//! 跨线程数据 sink 代理。
//!
//! # 教案目的（Why）
//! - 管线对象只活在循环线程上；其它线程想给某个 sink 写数据时，必须经由
//!   一个"把 `put_data` 变成循环消息"的中转对象；
//! - 代理以有界队列承接缓冲，队满返回 `WouldBlock`，从而把背压协议原样
//!   延伸过线程边界。
//!
//! # 交互契约（What）
//! - [`DataSinkProxy`] 实现 [`DataSink`]：`put_data` 在任意线程可调，成功
//!   即表示缓冲已入代理队列（retain 完成）；
//! - 真实 sink 的 `put_data` 始终发生在循环线程上；真实 sink 拒收时代理
//!   暂停泵送，等它的 `on_can_put` 再续；
//! - 代理自身的 `on_can_put`（队列从满恢复到有空位）在**循环线程**上投递；
//!   与其它线程共享的监听器需自行保证线程安全。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::warn;

use super::LoopShared;
use crate::buffer::Buffer;
use crate::error::{GgError, GgResult};
use crate::io::{BufferMetadata, DataSink, DataSinkListener};

struct ProxyState {
    pending: VecDeque<(Buffer, Option<BufferMetadata>)>,
    capacity: usize,
    /// 排空消息已投递（或正在排空），不重复投递。
    drain_scheduled: bool,
    /// 真实 sink 上一次拒收，等待它的 `on_can_put`。
    sink_blocked: bool,
    /// 代理曾因队满拒绝过上游，恢复空位后需要回调 `on_can_put`。
    starved: bool,
}

struct ProxyShared {
    loop_shared: Arc<LoopShared>,
    sink: Arc<dyn DataSink>,
    state: Mutex<ProxyState>,
    listener: Mutex<Option<Weak<dyn DataSinkListener>>>,
    /// 保活注册在真实 sink 上的中继监听器。
    relay: Arc<ProxyRelay>,
}

impl ProxyShared {
    /// 在循环线程上泵送队列，直到排空或真实 sink 拒收。
    fn drain(shared: &Arc<Self>) {
        loop {
            let item = {
                let mut state = shared.state.lock();
                match state.pending.pop_front() {
                    Some(item) => Some(item),
                    None => {
                        state.drain_scheduled = false;
                        None
                    }
                }
            };
            let Some((buffer, metadata)) = item else { break };
            match shared.sink.put_data(&buffer, metadata.as_ref()) {
                Ok(()) => {}
                Err(error) if error.is_would_block() => {
                    let mut state = shared.state.lock();
                    state.pending.push_front((buffer, metadata));
                    state.sink_blocked = true;
                    state.drain_scheduled = false;
                    break;
                }
                Err(error) => {
                    // 致命错误按传播策略丢弃缓冲并告警，不让代理卡死。
                    warn!(code = error.raw_code(), "sink proxy dropping buffer after fatal put_data error");
                }
            }
        }
        // 队列腾出空位后补发上游的 on_can_put。
        let notify = {
            let mut state = shared.state.lock();
            if state.starved && state.pending.len() < state.capacity {
                state.starved = false;
                true
            } else {
                false
            }
        };
        if notify
            && let Some(listener) = shared
                .listener
                .lock()
                .clone()
                .and_then(|listener| listener.upgrade())
        {
            listener.on_can_put();
        }
    }

    fn post_drain(shared: &Arc<Self>) -> GgResult<()> {
        let for_message = Arc::clone(shared);
        shared.loop_shared.post(
            Box::new(move || ProxyShared::drain(&for_message)),
            Some(Duration::ZERO),
        )
    }
}

/// 真实 sink 的监听器：拒收解除时在循环线程上续泵。
struct ProxyRelay {
    shared: Mutex<Weak<ProxyShared>>,
}

impl DataSinkListener for ProxyRelay {
    fn on_can_put(&self) {
        let Some(shared) = self.shared.lock().upgrade() else {
            return;
        };
        let should_drain = {
            let mut state = shared.state.lock();
            state.sink_blocked = false;
            if !state.drain_scheduled && !state.pending.is_empty() {
                state.drain_scheduled = true;
                true
            } else {
                false
            }
        };
        if should_drain {
            // 回调本就发生在循环线程上，直接续泵。
            ProxyShared::drain(&shared);
        }
    }
}

/// 跨线程数据 sink 代理；经 [`super::EventLoop::create_data_sink_proxy`] 构造。
pub struct DataSinkProxy {
    shared: Arc<ProxyShared>,
}

impl DataSinkProxy {
    pub(super) fn new(
        loop_shared: Arc<LoopShared>,
        queue_size: usize,
        sink: Arc<dyn DataSink>,
    ) -> GgResult<Arc<Self>> {
        if queue_size == 0 {
            return Err(GgError::InvalidParameters);
        }
        let relay = Arc::new(ProxyRelay {
            shared: Mutex::new(Weak::new()),
        });
        let shared = Arc::new(ProxyShared {
            loop_shared,
            sink: Arc::clone(&sink),
            state: Mutex::new(ProxyState {
                pending: VecDeque::with_capacity(queue_size),
                capacity: queue_size,
                drain_scheduled: false,
                sink_blocked: false,
                starved: false,
            }),
            listener: Mutex::new(None),
            relay: Arc::clone(&relay),
        });
        *relay.shared.lock() = Arc::downgrade(&shared);
        let relay_dyn: Arc<dyn DataSinkListener> = shared.relay.clone();
        let relay_listener: Weak<dyn DataSinkListener> = Arc::downgrade(&relay_dyn);
        sink.set_listener(Some(relay_listener))?;
        Ok(Arc::new(Self { shared }))
    }
}

impl DataSink for DataSinkProxy {
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()> {
        let need_post = {
            let mut state = self.shared.state.lock();
            if state.pending.len() >= state.capacity {
                state.starved = true;
                return Err(GgError::WouldBlock);
            }
            state.pending.push_back((data.clone(), metadata.copied()));
            if !state.drain_scheduled && !state.sink_blocked {
                state.drain_scheduled = true;
                true
            } else {
                false
            }
        };
        if need_post && ProxyShared::post_drain(&self.shared).is_err() {
            // 循环队列没有空位：撤销入队并向上游施加背压。
            let mut state = self.shared.state.lock();
            state.pending.pop_back();
            state.drain_scheduled = false;
            state.starved = true;
            return Err(GgError::WouldBlock);
        }
        Ok(())
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        *self.shared.listener.lock() = listener;
        Ok(())
    }
}

impl Drop for DataSinkProxy {
    fn drop(&mut self) {
        let _ = self.shared.sink.set_listener(None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::EventLoop;
    use crate::util::MemoryDataSink;

    #[test]
    fn proxy_forwards_buffers_through_the_loop() {
        let event_loop = EventLoop::new();
        event_loop.bind_to_current_thread().unwrap();
        let sink = MemoryDataSink::new();
        let proxy = event_loop
            .create_data_sink_proxy(4, sink.clone() as Arc<dyn DataSink>)
            .unwrap();

        let producer = {
            let proxy = Arc::clone(&proxy);
            std::thread::spawn(move || {
                proxy
                    .put_data(&Buffer::from_slice(b"over the wall"), None)
                    .unwrap();
            })
        };
        producer.join().unwrap();

        // 泵一轮循环，消息里会调用真实 sink。
        while event_loop.do_work(Some(Duration::ZERO)).unwrap() == Some(0) {}
        let _ = event_loop.do_work(Some(Duration::from_millis(10)));
        assert_eq!(sink.received_bytes(), b"over the wall");
    }

    #[test]
    fn full_proxy_queue_would_block_and_recovers() {
        let event_loop = EventLoop::new();
        event_loop.bind_to_current_thread().unwrap();
        let sink = MemoryDataSink::new();
        sink.set_blocking(true);
        let proxy = event_loop
            .create_data_sink_proxy(1, sink.clone() as Arc<dyn DataSink>)
            .unwrap();

        let buffer = Buffer::from_slice(b"x");
        proxy.put_data(&buffer, None).unwrap();
        // 泵送后真实 sink 拒收，缓冲退回代理队列，队列保持满。
        let _ = event_loop.do_work(Some(Duration::ZERO));
        assert_eq!(proxy.put_data(&buffer, None), Err(GgError::WouldBlock));

        // 真实 sink 恢复后中继监听器续泵，代理队列腾空。
        sink.set_blocking(false);
        sink.notify_can_put();
        assert_eq!(sink.received_bytes(), b"x");
        proxy.put_data(&buffer, None).unwrap();
    }
}
