//! 打点数据源：产生带计数前缀的测试数据包。
//!
//! 每个包以 4 字节大端计数开头，其余字节为递增填充；接收侧据此校验
//! 顺序性与完整性（链路层的丢包重传测试正是这么用的）。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::Buffer;
use crate::error::{GgError, GgResult};
use crate::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};
use crate::timer::{Timer, TimerId, TimerListener, TimerScheduler};

/// 计数前缀占用的字节数。
pub const BLASTER_COUNTER_SIZE: usize = 4;

struct BlasterState {
    next_packet: u32,
    running: bool,
}

/// 产生计数数据包的 source。
///
/// # 契约说明（What）
/// - `packet_size` 至少 [`BLASTER_COUNTER_SIZE`]；
/// - `max_packets = None` 表示持续产生；
/// - `send_interval = None` 时尽力泵送（直到下游拒收），否则每隔给定毫秒
///   发送一个包；
/// - 下游拒收后等待 `on_can_put` 续发，顺序与计数单调性不受影响。
pub struct BlasterDataSource {
    packet_size: usize,
    max_packets: Option<u32>,
    send_interval: Option<u64>,
    timer: Option<Timer>,
    state: Mutex<BlasterState>,
    sink: Mutex<Option<Arc<dyn DataSink>>>,
    weak_self: Weak<Self>,
}

impl BlasterDataSource {
    /// 构造打点数据源。
    ///
    /// 指定 `send_interval` 时必须同时给出调度器，否则返回
    /// `InvalidParameters`。
    pub fn new(
        packet_size: usize,
        max_packets: Option<u32>,
        send_interval: Option<u64>,
        scheduler: Option<&Arc<TimerScheduler>>,
    ) -> GgResult<Arc<Self>> {
        if packet_size < BLASTER_COUNTER_SIZE {
            return Err(GgError::InvalidParameters);
        }
        if send_interval.is_some() && scheduler.is_none() {
            return Err(GgError::InvalidParameters);
        }
        Ok(Arc::new_cyclic(|weak_self| Self {
            packet_size,
            max_packets,
            send_interval,
            timer: scheduler.map(TimerScheduler::create_timer),
            state: Mutex::new(BlasterState {
                next_packet: 0,
                running: false,
            }),
            sink: Mutex::new(None),
            weak_self: weak_self.clone(),
        }))
    }

    /// 开始产生数据。
    pub fn start(&self) -> GgResult<()> {
        self.state.lock().running = true;
        self.pump();
        Ok(())
    }

    /// 停止产生数据（已发出的计数保留，可再次 `start` 续发）。
    pub fn stop(&self) {
        self.state.lock().running = false;
        if let Some(timer) = &self.timer {
            timer.unschedule();
        }
    }

    /// 迄今发出的包数。
    #[must_use]
    pub fn packets_sent(&self) -> u32 {
        self.state.lock().next_packet
    }

    fn make_packet(&self, counter: u32) -> Buffer {
        let mut payload = Vec::with_capacity(self.packet_size);
        payload.extend_from_slice(&counter.to_be_bytes());
        for index in BLASTER_COUNTER_SIZE..self.packet_size {
            payload.push(index as u8);
        }
        Buffer::from_vec(payload)
    }

    fn arm_interval_timer(&self) {
        if let (Some(timer), Some(interval)) = (&self.timer, self.send_interval) {
            let listener: Weak<dyn TimerListener> = self.weak_self.clone();
            let _ = timer.schedule(listener, interval);
        }
    }

    fn pump(&self) {
        loop {
            let Some(sink) = self.sink.lock().clone() else {
                return;
            };
            let counter = {
                let state = self.state.lock();
                if !state.running {
                    return;
                }
                if let Some(max) = self.max_packets
                    && state.next_packet >= max
                {
                    return;
                }
                state.next_packet
            };
            let packet = self.make_packet(counter);
            match sink.put_data(&packet, None) {
                Ok(()) => {
                    self.state.lock().next_packet = counter + 1;
                    if self.send_interval.is_some() {
                        // 节拍模式：一拍一个包。
                        self.arm_interval_timer();
                        return;
                    }
                }
                Err(error) if error.is_would_block() => return,
                Err(_) => return,
            }
        }
    }
}

impl DataSource for BlasterDataSource {
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

impl DataSinkListener for BlasterDataSource {
    fn on_can_put(&self) {
        self.pump();
    }
}

impl TimerListener for BlasterDataSource {
    fn on_timer_fired(&self, _timer_id: TimerId, _elapsed: u64) {
        self.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::MemoryDataSink;

    #[test]
    fn packets_carry_a_monotonic_counter_prefix() {
        let blaster = BlasterDataSource::new(8, Some(3), None, None).unwrap();
        let sink = MemoryDataSink::new();
        blaster
            .set_data_sink(Some(sink.clone() as Arc<dyn DataSink>))
            .unwrap();
        blaster.start().unwrap();

        let bytes = sink.received_bytes();
        assert_eq!(bytes.len(), 24);
        for (index, chunk) in bytes.chunks(8).enumerate() {
            assert_eq!(&chunk[..4], &(index as u32).to_be_bytes());
            assert_eq!(&chunk[4..], &[4, 5, 6, 7]);
        }
        assert_eq!(blaster.packets_sent(), 3);
    }

    #[test]
    fn interval_mode_paces_one_packet_per_tick() {
        let scheduler = TimerScheduler::new();
        let blaster = BlasterDataSource::new(4, None, Some(100), Some(&scheduler)).unwrap();
        let sink = MemoryDataSink::new();
        blaster
            .set_data_sink(Some(sink.clone() as Arc<dyn DataSink>))
            .unwrap();
        blaster.start().unwrap();
        assert_eq!(sink.buffer_count(), 1);
        scheduler.set_time(100);
        assert_eq!(sink.buffer_count(), 2);
        scheduler.set_time(150);
        assert_eq!(sink.buffer_count(), 2);
        blaster.stop();
        scheduler.set_time(300);
        assert_eq!(sink.buffer_count(), 2);
    }
}
