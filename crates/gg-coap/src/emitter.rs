//! CoAP 事件发射器：延迟上界内的批量可靠事件上报。
//!
//! # 教案目的（Why）
//! - 设备侧的状态事件（同步请求、告警……）要求"最终一定送达对端"，但
//!   又不值得每个事件一个请求：发射器把到期的事件合并进一个 POST，
//!   未确认前保持置位，失败后退避重试；
//! - 去抖语义：同一事件重复置位只合并截止时间；事件在发出前被撤销则
//!   不再上报。
//!
//! # 契约说明（What）
//! - 容量固定，超出返回 `OutOfResources`；
//! - 任意时刻至多一个请求在途；在途期间新到期的冲刷被推迟，除非在途
//!   请求已超过最小年龄（此时撤销重发，把新事件捎上）；
//! - 负载是 protobuf 线格式的重复字段 #1（varint），每个值为事件的
//!   32 位 4CC 码；
//! - 2.xx 清除该请求携带的事件；4.xx 同样清除但记错误日志；5.xx 与
//!   超时保留事件并在重试延迟后再冲。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};
use gg_core::fourcc::FourCc;
use gg_core::timer::{Timer, TimerId, TimerListener, TimerScheduler};

use crate::endpoint::{
    CoapClientParameters, CoapEndpoint, CoapRequestHandle, CoapResponseListener,
};
use crate::message::{CoapMessage, CoapMessageType, CoapMethod, CoapOption};

/// 5.xx/超时后的缺省重试延迟（毫秒）。
pub const COAP_EVENT_EMITTER_DEFAULT_RETRY_DELAY_MS: u64 = 30_000;
/// 在途请求可被撤销重发前的缺省最小年龄（毫秒）。
pub const COAP_EVENT_EMITTER_DEFAULT_MIN_REQUEST_AGE_MS: u64 = 1_000;

/// protobuf 字段 #1、线型 varint 的键字节。
const PROTOBUF_FIELD_1_VARINT: u8 = 0x08;

struct EmitterEvent {
    code: FourCc,
    /// 绝对截止时间（调度器时钟）。
    deadline: u64,
}

struct InFlightRequest {
    /// 发送调用返回前为 `None`（同步响应可能先一步到达）。
    handle: Option<CoapRequestHandle>,
    included: Vec<FourCc>,
    sent_at: u64,
}

struct EmitterState {
    events: Vec<EmitterEvent>,
    in_flight: Option<InFlightRequest>,
    /// 退避下限：此刻之前不发起新请求。
    retry_not_before: u64,
}

/// 事件发射器。
pub struct CoapEventEmitter {
    endpoint: Arc<CoapEndpoint>,
    path: String,
    scheduler: Arc<TimerScheduler>,
    capacity: usize,
    min_request_age: u64,
    retry_delay: u64,
    state: Mutex<EmitterState>,
    timer: Timer,
    weak_self: Weak<Self>,
}

impl CoapEventEmitter {
    /// 构造发射器。
    ///
    /// `min_request_age_ms` 与 `retry_delay_ms` 传 0 取各自缺省值。
    #[must_use]
    pub fn new(
        endpoint: &Arc<CoapEndpoint>,
        path: &str,
        scheduler: &Arc<TimerScheduler>,
        max_events: usize,
        min_request_age_ms: u64,
        retry_delay_ms: u64,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            endpoint: Arc::clone(endpoint),
            path: path.trim_matches('/').to_owned(),
            scheduler: Arc::clone(scheduler),
            capacity: max_events.max(1),
            min_request_age: if min_request_age_ms == 0 {
                COAP_EVENT_EMITTER_DEFAULT_MIN_REQUEST_AGE_MS
            } else {
                min_request_age_ms
            },
            retry_delay: if retry_delay_ms == 0 {
                COAP_EVENT_EMITTER_DEFAULT_RETRY_DELAY_MS
            } else {
                retry_delay_ms
            },
            state: Mutex::new(EmitterState {
                events: Vec::new(),
                in_flight: None,
                retry_not_before: 0,
            }),
            timer: scheduler.create_timer(),
            weak_self: weak_self.clone(),
        })
    }

    /// 置位一个事件，保证在 `max_latency_ms` 内随某次冲刷送出。
    ///
    /// 已置位的同一事件只收紧截止时间（合并）；容量满返回
    /// `OutOfResources`。
    pub fn set_event(&self, event: FourCc, max_latency_ms: u64) -> GgResult<()> {
        let now = self.scheduler.now();
        let deadline = now.saturating_add(max_latency_ms);
        {
            let mut state = self.state.lock();
            if let Some(existing) = state
                .events
                .iter_mut()
                .find(|existing| existing.code == event)
            {
                existing.deadline = existing.deadline.min(deadline);
            } else {
                if state.events.len() >= self.capacity {
                    return Err(GgError::OutOfResources);
                }
                state.events.push(EmitterEvent {
                    code: event,
                    deadline,
                });
            }
        }
        self.check_flush();
        Ok(())
    }

    /// 撤销一个尚未送出的事件。
    pub fn unset_event(&self, event: FourCc) -> GgResult<()> {
        let mut state = self.state.lock();
        let before = state.events.len();
        state.events.retain(|existing| existing.code != event);
        if state.events.len() == before {
            return Err(GgError::NoSuchItem);
        }
        Ok(())
    }

    /// 事件当前是否置位。
    #[must_use]
    pub fn event_is_set(&self, event: FourCc) -> bool {
        self.state
            .lock()
            .events
            .iter()
            .any(|existing| existing.code == event)
    }

    fn arm_timer(&self, delay: u64) {
        let relay: Weak<dyn TimerListener> = self.weak_self.clone();
        let _ = self.timer.schedule(relay, delay);
    }

    /// 冲刷判定：到期且无在途（或在途已够老）则发；否则按最近截止挂表。
    fn check_flush(&self) {
        let now = self.scheduler.now();
        enum FlushAction {
            SendNow,
            CancelThenSend(CoapRequestHandle),
            WaitUntil(u64),
            Idle,
        }
        let action = {
            let state = self.state.lock();
            let earliest = state.events.iter().map(|event| event.deadline).min();
            match earliest {
                None => FlushAction::Idle,
                Some(deadline) => {
                    let due_at = deadline.max(state.retry_not_before);
                    if due_at > now {
                        FlushAction::WaitUntil(due_at)
                    } else {
                        match &state.in_flight {
                            None => FlushAction::SendNow,
                            Some(in_flight) => {
                                // 新事件到期而请求在途：只有足够老的请求才值得撤销重发。
                                let age = now.saturating_sub(in_flight.sent_at);
                                let all_included = state
                                    .events
                                    .iter()
                                    .all(|event| in_flight.included.contains(&event.code));
                                match in_flight.handle {
                                    Some(handle) if !all_included && age >= self.min_request_age => {
                                        FlushAction::CancelThenSend(handle)
                                    }
                                    // 等响应回来再冲。
                                    _ => FlushAction::Idle,
                                }
                            }
                        }
                    }
                }
            }
        };
        match action {
            FlushAction::Idle => {}
            FlushAction::WaitUntil(due_at) => {
                self.arm_timer(due_at - now);
            }
            FlushAction::SendNow => {
                self.send_flush(now);
            }
            FlushAction::CancelThenSend(handle) => {
                debug!("superseding in-flight event request");
                let _ = self.endpoint.cancel_request(handle);
                self.state.lock().in_flight = None;
                self.send_flush(now);
            }
        }
    }

    fn send_flush(&self, now: u64) {
        let included: Vec<FourCc> = {
            let state = self.state.lock();
            state.events.iter().map(|event| event.code).collect()
        };
        if included.is_empty() {
            return;
        }
        let mut payload = Vec::with_capacity(included.len() * 6);
        for code in &included {
            payload.push(PROTOBUF_FIELD_1_VARINT);
            encode_varint(u64::from(code.as_u32()), &mut payload);
        }
        // 先登记在途状态再发送：响应可能在发送调用返回前同步到达。
        self.state.lock().in_flight = Some(InFlightRequest {
            handle: None,
            included: included.clone(),
            sent_at: now,
        });
        let listener: Weak<dyn CoapResponseListener> = self.weak_self.clone();
        let result = self.endpoint.send_request(
            CoapMethod::Post,
            CoapMessageType::Confirmable,
            CoapOption::uri_path_segments(&self.path),
            Some(Buffer::from_vec(payload)),
            None,
            Some(CoapClientParameters::default()),
            listener,
        );
        match result {
            Ok(handle) => {
                debug!(count = included.len(), "event batch posted");
                if let Some(in_flight) = self.state.lock().in_flight.as_mut() {
                    in_flight.handle = Some(handle);
                }
            }
            Err(error) => {
                // 发送失败按可重试处理：退避后再冲。
                info!(code = error.raw_code(), "event flush deferred");
                let mut state = self.state.lock();
                state.in_flight = None;
                state.retry_not_before = now + self.retry_delay;
                drop(state);
                self.arm_timer(self.retry_delay);
            }
        }
    }

    fn clear_included(&self, included: &[FourCc]) {
        let mut state = self.state.lock();
        state
            .events
            .retain(|event| !included.contains(&event.code));
    }
}

impl CoapResponseListener for CoapEventEmitter {
    fn on_response(&self, response: &CoapMessage) {
        let included = {
            let mut state = self.state.lock();
            state.in_flight.take().map(|in_flight| in_flight.included)
        };
        let Some(included) = included else { return };
        match response.code_class() {
            2 => {
                debug!("event batch acknowledged");
                self.clear_included(&included);
            }
            4 => {
                // 致命：对端拒绝，这批事件不再重试。
                warn!(code = response.code, "event batch rejected by peer");
                self.clear_included(&included);
            }
            _ => {
                let now = self.scheduler.now();
                info!(code = response.code, "event batch failed, will retry");
                self.state.lock().retry_not_before = now + self.retry_delay;
            }
        }
        self.check_flush();
    }

    fn on_error(&self, error: GgError, _message: &str) {
        info!(code = error.raw_code(), "event batch request failed, will retry");
        let now = self.scheduler.now();
        {
            let mut state = self.state.lock();
            state.in_flight = None;
            state.retry_not_before = now + self.retry_delay;
        }
        self.check_flush();
    }
}

impl TimerListener for CoapEventEmitter {
    fn on_timer_fired(&self, _timer_id: TimerId, _elapsed: u64) {
        self.check_flush();
    }
}

fn encode_varint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_matches_protobuf_wire_format() {
        let mut out = Vec::new();
        encode_varint(0x6576_7430, &mut out); // 'evt0'
        assert_eq!(out, vec![0xB0, 0xE0, 0xD2, 0xAB, 0x06]);
        out.clear();
        encode_varint(1, &mut out);
        assert_eq!(out, vec![0x01]);
    }
}
