//! Gattlink 会话引擎：滑动窗口、确认与重传、会话重置。
//!
//! # 教案目的（Why）
//! - 传输只承诺"大概率送达单个小包"；本引擎在其上建立按序、不重不漏的
//!   用户数据报交付：发送侧以 varint 长度前缀把数据报串进输出缓冲，按
//!   当前分片大小切包、编 PSN 入窗；接收侧只收"下一个期望 PSN"，其余
//!   丢弃等待重传；
//! - 会话以重置请求/重置同意的交换建立：发起方周期重发请求，应答方以
//!   "同意"宣告双方从 PSN=0 重新开始；双方都见到对方的控制包后进入
//!   就绪态。持续失活由上层通过再次 reset 重建会话兜底，引擎本身不做
//!   指数退避。
//!
//! # 并发纪律（How）
//! - 全部回调（transport/user sink 的 `put_data`、事件、定时器）都在状态
//!   锁之外发起：同步的管线重入（例如上层收到数据报后立即回写响应）
//!   不会造成自死锁；
//! - 每次临界区只做状态推导，不做 I/O；发包采用"锁内快照、锁外投递、
//!   再上锁提交"的节奏。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};
use gg_core::events::{
    EVENT_TYPE_GATTLINK_SESSION_READY, EVENT_TYPE_GATTLINK_SESSION_RESET,
    EVENT_TYPE_LINK_PROBE_REPORT, Event, EventData, EventEmitter, EventListener,
};
use gg_core::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};
use gg_core::timer::{Timer, TimerId, TimerListener, TimerScheduler};

use crate::packet;

/// 会话重置控制包的重发间隔（毫秒）。
const RESET_RESEND_INTERVAL_MS: u64 = 1000;
/// 收到数据后延迟确认的时长（毫秒）。
const ACK_DELAY_MS: u64 = 50;
/// 重传定时器间隔（毫秒）；无 RTT 估计，固定节拍。
const RETRANSMIT_DELAY_MS: u64 = 500;
/// 窗口尺寸上限（序号空间的一半）。
const MAX_WINDOW_SIZE: u8 = 16;
/// 分片大小下限：须容得下捎带确认的 2 字节头加至少 1 字节负载。
const MIN_FRAGMENT_SIZE: usize = 3;

/// 链路质量探针配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattlinkProbeConfig {
    /// 统计窗口与报告间隔（毫秒）。
    pub report_interval: u64,
}

/// Gattlink 配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattlinkConfig {
    /// 接收窗口（1..=16）。只收"下一个期望 PSN"的实现里它只参与参数
    /// 校验，保留字段是为了与对端配置对齐。
    pub rx_window: u8,
    /// 发送窗口（1..=16）。
    pub tx_window: u8,
    /// 输出缓冲容量（字节，含 varint 长度前缀）。
    pub output_buffer_size: usize,
    /// 初始分片大小（字节，含包头；运行期可调）。
    pub initial_max_fragment_size: usize,
    /// 可选的链路质量探针。
    pub probe: Option<GattlinkProbeConfig>,
}

impl Default for GattlinkConfig {
    fn default() -> Self {
        Self {
            rx_window: 8,
            tx_window: 8,
            output_buffer_size: 1024,
            initial_max_fragment_size: 20,
            probe: None,
        }
    }
}

/// 会话状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// 未启动。
    Idle,
    /// 本端已发起，等待对端的请求或同意。
    Initiating,
    /// 会话就绪，可交换数据。
    Ready,
    /// 已收到对端请求，欠一个"同意"没发出去（传输拥塞中）。
    ResetPending,
}

struct InFlight {
    psn: u8,
    len: usize,
}

struct ProtocolState {
    session: SessionState,
    /// 本会话内是否已经交换过数据（区分真重置与迟到的重复请求）。
    data_seen: bool,
    // 发送侧。
    out_buffer: Vec<u8>,
    in_flight: VecDeque<InFlight>,
    next_psn: u8,
    /// `out_buffer` 中已被在途包覆盖的字节数。
    unsent_offset: usize,
    max_fragment_size: usize,
    transport_blocked: bool,
    ack_pending: bool,
    user_starved: bool,
    // 接收侧。
    expected_psn: u8,
    reassembly: Vec<u8>,
    pending_frames: VecDeque<Buffer>,
    user_blocked: bool,
    // 探针。
    probe_bytes: u64,
    // 重入护栏：同步布线下，下游的 `put_data` 可能一路折返回本对象。
    pumping: bool,
    delivering: bool,
}

impl ProtocolState {
    fn clear_session(&mut self) {
        self.data_seen = false;
        self.out_buffer.clear();
        self.in_flight.clear();
        self.next_psn = 0;
        self.unsent_offset = 0;
        self.transport_blocked = false;
        self.ack_pending = false;
        self.expected_psn = 0;
        self.reassembly.clear();
        self.pending_frames.clear();
        self.user_blocked = false;
    }
}

struct GattlinkInner {
    config: GattlinkConfig,
    state: Mutex<ProtocolState>,
    user_sink: Mutex<Option<Arc<dyn DataSink>>>,
    transport_sink: Mutex<Option<Arc<dyn DataSink>>>,
    /// 用户侧 sink 的上游监听器（输出缓冲腾出空间时通知）。
    user_listener: Mutex<Option<Weak<dyn DataSinkListener>>>,
    event_listener: Mutex<Option<Weak<dyn EventListener>>>,
    retransmit_timer: Timer,
    ack_timer: Timer,
    reset_timer: Timer,
    probe_timer: Timer,
    timer_relay: Arc<TimerRelay>,
    user_relay: Arc<CanPutRelay>,
    transport_relay: Arc<CanPutRelay>,
}

/// 定时器分发器：按 TimerId 把触发路由回引擎。
struct TimerRelay {
    inner: Mutex<Weak<GattlinkInner>>,
}

impl TimerListener for TimerRelay {
    fn on_timer_fired(&self, timer_id: TimerId, _elapsed: u64) {
        let Some(inner) = self.inner.lock().upgrade() else {
            return;
        };
        if timer_id == inner.retransmit_timer.id() {
            inner.on_retransmit_timer();
        } else if timer_id == inner.ack_timer.id() {
            inner.flush_ack();
        } else if timer_id == inner.reset_timer.id() {
            inner.on_reset_timer();
        } else if timer_id == inner.probe_timer.id() {
            inner.on_probe_timer();
        }
    }
}

enum RelaySide {
    User,
    Transport,
}

/// 下游 sink 的 `on_can_put` 中继。
struct CanPutRelay {
    inner: Mutex<Weak<GattlinkInner>>,
    side: RelaySide,
}

impl DataSinkListener for CanPutRelay {
    fn on_can_put(&self) {
        let Some(inner) = self.inner.lock().upgrade() else {
            return;
        };
        match self.side {
            RelaySide::User => inner.on_user_can_put(),
            RelaySide::Transport => inner.on_transport_can_put(),
        }
    }
}

impl GattlinkInner {
    fn emit(&self, event: &Event) {
        if let Some(listener) = self
            .event_listener
            .lock()
            .clone()
            .and_then(|weak| weak.upgrade())
        {
            listener.on_event(event);
        }
    }

    fn emit_all(&self, events: Vec<Event>) {
        for event in &events {
            self.emit(event);
        }
    }

    // ------------------------------------------------------------------
    // 会话建立与重置
    // ------------------------------------------------------------------

    fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.session != SessionState::Idle {
                return;
            }
            state.clear_session();
            state.session = SessionState::Initiating;
        }
        info!("gattlink session starting");
        self.try_send_request();
        self.arm_reset_timer();
    }

    fn reset_session(&self) {
        let events = {
            let mut state = self.state.lock();
            let was_ready = state.session == SessionState::Ready;
            state.clear_session();
            state.session = SessionState::Idle;
            if was_ready {
                vec![Event::plain(EVENT_TYPE_GATTLINK_SESSION_RESET)]
            } else {
                Vec::new()
            }
        };
        self.retransmit_timer.unschedule();
        self.ack_timer.unschedule();
        self.reset_timer.unschedule();
        self.probe_timer.unschedule();
        self.emit_all(events);
    }

    /// 发起方：发出重置请求（仅 Initiating 状态）。
    fn try_send_request(&self) {
        let Some(transport) = self.transport_sink.lock().clone() else {
            return;
        };
        if self.state.lock().session != SessionState::Initiating {
            return;
        }
        let request = packet::encode_reset_request();
        match transport.put_data(&Buffer::from_slice(&request), None) {
            Ok(()) => {}
            Err(error) if error.is_would_block() => {
                self.state.lock().transport_blocked = true;
            }
            Err(error) => {
                warn!(code = error.raw_code(), "failed to send reset request");
            }
        }
    }

    /// 应答方：发出重置同意；成功即进入就绪态。
    fn try_send_accept(&self) {
        let Some(transport) = self.transport_sink.lock().clone() else {
            return;
        };
        if self.state.lock().session != SessionState::ResetPending {
            return;
        }
        let accept = packet::encode_reset_accept();
        match transport.put_data(&Buffer::from_slice(&accept), None) {
            Ok(()) => {
                let events = {
                    let mut state = self.state.lock();
                    self.enter_ready(&mut state)
                };
                self.after_ready(events);
            }
            Err(error) if error.is_would_block() => {
                self.state.lock().transport_blocked = true;
            }
            Err(error) => {
                warn!(code = error.raw_code(), "failed to send reset accept");
            }
        }
    }

    fn enter_ready(&self, state: &mut ProtocolState) -> Vec<Event> {
        if state.session == SessionState::Ready {
            return Vec::new();
        }
        state.session = SessionState::Ready;
        info!("gattlink session ready");
        vec![Event::plain(EVENT_TYPE_GATTLINK_SESSION_READY)]
    }

    /// 进入就绪态后的收尾：停掉请求重发，启动探针，开始泵数据。
    fn after_ready(&self, events: Vec<Event>) {
        let became_ready = !events.is_empty();
        self.emit_all(events);
        if became_ready {
            self.reset_timer.unschedule();
            if let Some(probe) = self.config.probe {
                let listener: Weak<dyn TimerListener> =
                    Arc::downgrade(&self.timer_relay) as Weak<dyn TimerListener>;
                let _ = self.probe_timer.schedule(listener, probe.report_interval);
            }
            self.pump();
        }
    }

    fn on_reset_request(&self, version: u8) {
        if version != packet::PROTOCOL_VERSION {
            warn!(version, "ignoring reset request with unsupported protocol version");
            return;
        }
        let (events, teardown) = {
            let mut state = self.state.lock();
            match state.session {
                SessionState::Idle => {
                    debug!("reset request received while idle, ignoring");
                    return;
                }
                SessionState::Initiating | SessionState::ResetPending => {
                    // 双方同时发起，或上一个"同意"还没发出去：统一转入欠答状态。
                    state.session = SessionState::ResetPending;
                    (Vec::new(), false)
                }
                SessionState::Ready if state.data_seen => {
                    // 对端丢了会话状态：废弃本端缓冲，重新开始。
                    state.clear_session();
                    state.session = SessionState::ResetPending;
                    (vec![Event::plain(EVENT_TYPE_GATTLINK_SESSION_RESET)], true)
                }
                SessionState::Ready => {
                    // 尚未交换过数据：多半是我方"同意"在路上丢了，幂等重答。
                    state.session = SessionState::ResetPending;
                    (Vec::new(), false)
                }
            }
        };
        if teardown {
            self.retransmit_timer.unschedule();
            self.ack_timer.unschedule();
        }
        self.emit_all(events);
        self.try_send_accept();
        // "同意"没发出去（传输拥塞）时等 on_can_put 重试；保险起见保留节拍。
        self.arm_reset_timer();
    }

    fn on_reset_accept(&self, version: u8) {
        if version != packet::PROTOCOL_VERSION {
            warn!(version, "ignoring reset accept with unsupported protocol version");
            return;
        }
        let events = {
            let mut state = self.state.lock();
            match state.session {
                SessionState::Initiating => self.enter_ready(&mut state),
                _ => {
                    // 迟到或重复的"同意"：会话已按其它路径建立。
                    debug!("redundant reset accept ignored");
                    Vec::new()
                }
            }
        };
        self.after_ready(events);
    }

    fn arm_reset_timer(&self) {
        let still_handshaking = matches!(
            self.state.lock().session,
            SessionState::Initiating | SessionState::ResetPending
        );
        if still_handshaking {
            let listener: Weak<dyn TimerListener> =
                Arc::downgrade(&self.timer_relay) as Weak<dyn TimerListener>;
            let _ = self.reset_timer.schedule(listener, RESET_RESEND_INTERVAL_MS);
        }
    }

    fn on_reset_timer(&self) {
        self.try_send_request();
        self.try_send_accept();
        self.arm_reset_timer();
    }

    // ------------------------------------------------------------------
    // 发送路径
    // ------------------------------------------------------------------

    fn user_put(&self, data: &Buffer) -> GgResult<()> {
        {
            let mut state = self.state.lock();
            let mut prefix = Vec::with_capacity(4);
            packet::encode_varint(data.len(), &mut prefix);
            if state.out_buffer.len() + prefix.len() + data.len() > self.config.output_buffer_size
            {
                state.user_starved = true;
                return Err(GgError::WouldBlock);
            }
            state.out_buffer.extend_from_slice(&prefix);
            state.out_buffer.extend_from_slice(data.as_slice());
        }
        self.pump();
        Ok(())
    }

    /// 发送泵：窗口与分片约束下把输出缓冲切成传输包。
    fn pump(&self) {
        {
            let mut state = self.state.lock();
            if state.pumping {
                return;
            }
            state.pumping = true;
        }
        self.pump_inner();
        self.state.lock().pumping = false;
    }

    fn pump_inner(&self) {
        loop {
            let Some(transport) = self.transport_sink.lock().clone() else {
                return;
            };
            let (buffer, psn, payload_len, with_ack) = {
                let state = self.state.lock();
                if state.session != SessionState::Ready || state.transport_blocked {
                    return;
                }
                if state.in_flight.len() >= usize::from(self.config.tx_window) {
                    return;
                }
                let unsent = state.out_buffer.len() - state.unsent_offset;
                if unsent == 0 {
                    return;
                }
                let with_ack = state.ack_pending;
                let header_size = packet::data_header_size(with_ack);
                if state.max_fragment_size <= header_size {
                    return;
                }
                let payload_len = unsent.min(state.max_fragment_size - header_size);
                let psn = state.next_psn;
                let asn = if with_ack {
                    Some(packet::sequence_decrement(state.expected_psn))
                } else {
                    None
                };
                let (header, header_len) = packet::encode_data_header(asn, psn);
                let mut bytes = Vec::with_capacity(header_len + payload_len);
                bytes.extend_from_slice(&header[..header_len]);
                bytes.extend_from_slice(
                    &state.out_buffer
                        [state.unsent_offset..state.unsent_offset + payload_len],
                );
                (Buffer::from_vec(bytes), psn, payload_len, with_ack)
            };
            match transport.put_data(&buffer, None) {
                Ok(()) => {
                    {
                        let mut state = self.state.lock();
                        state.data_seen = true;
                        state.next_psn = packet::sequence_increment(psn);
                        state.unsent_offset += payload_len;
                        state.in_flight.push_back(InFlight {
                            psn,
                            len: payload_len,
                        });
                        if with_ack {
                            state.ack_pending = false;
                        }
                    }
                    if with_ack {
                        self.ack_timer.unschedule();
                    }
                    self.arm_retransmit_timer();
                }
                Err(error) if error.is_would_block() => {
                    self.state.lock().transport_blocked = true;
                    return;
                }
                Err(error) => {
                    warn!(code = error.raw_code(), "transport rejected outbound packet");
                    return;
                }
            }
        }
    }

    fn arm_retransmit_timer(&self) {
        if !self.retransmit_timer.is_scheduled() && !self.state.lock().in_flight.is_empty() {
            let listener: Weak<dyn TimerListener> =
                Arc::downgrade(&self.timer_relay) as Weak<dyn TimerListener>;
            let _ = self.retransmit_timer.schedule(listener, RETRANSMIT_DELAY_MS);
        }
    }

    /// 重传：从第一个未确认 PSN 起重发全部在途包（不捎带确认）。
    fn on_retransmit_timer(&self) {
        let Some(transport) = self.transport_sink.lock().clone() else {
            return;
        };
        let mut index = 0usize;
        loop {
            let prepared = {
                let state = self.state.lock();
                if state.session != SessionState::Ready
                    || state.transport_blocked
                    || index >= state.in_flight.len()
                {
                    None
                } else {
                    let start: usize =
                        state.in_flight.iter().take(index).map(|entry| entry.len).sum();
                    let entry = &state.in_flight[index];
                    let (header, header_len) = packet::encode_data_header(None, entry.psn);
                    let mut bytes = Vec::with_capacity(header_len + entry.len);
                    bytes.extend_from_slice(&header[..header_len]);
                    bytes.extend_from_slice(&state.out_buffer[start..start + entry.len]);
                    Some(Buffer::from_vec(bytes))
                }
            };
            let Some(buffer) = prepared else { break };
            match transport.put_data(&buffer, None) {
                Ok(()) => index += 1,
                Err(error) if error.is_would_block() => {
                    self.state.lock().transport_blocked = true;
                    break;
                }
                Err(error) => {
                    warn!(code = error.raw_code(), "transport rejected retransmission");
                    break;
                }
            }
        }
        if index > 0 {
            debug!(count = index, "retransmitted in-flight packets");
        }
        self.arm_retransmit_timer();
    }

    fn process_ack(&self, asn: u8) {
        let (advanced, now_empty, notify_user) = {
            let mut state = self.state.lock();
            let Some(front) = state.in_flight.front() else {
                return;
            };
            let count = usize::from(packet::sequence_distance(front.psn, asn)) + 1;
            if count > state.in_flight.len() {
                // 过期或重复确认：窗口之外，忽略。
                return;
            }
            let mut drained = 0usize;
            for _ in 0..count {
                if let Some(entry) = state.in_flight.pop_front() {
                    drained += entry.len;
                }
            }
            state.out_buffer.drain(..drained);
            state.unsent_offset -= drained;
            let notify_user = if state.user_starved
                && state.out_buffer.len() < self.config.output_buffer_size
            {
                state.user_starved = false;
                true
            } else {
                false
            };
            (true, state.in_flight.is_empty(), notify_user)
        };
        if advanced {
            if now_empty {
                self.retransmit_timer.unschedule();
            } else {
                // 窗口推进：重传计时从头再来。
                let listener: Weak<dyn TimerListener> =
                    Arc::downgrade(&self.timer_relay) as Weak<dyn TimerListener>;
                let _ = self.retransmit_timer.schedule(listener, RETRANSMIT_DELAY_MS);
            }
            self.pump();
            if notify_user
                && let Some(listener) = self
                    .user_listener
                    .lock()
                    .clone()
                    .and_then(|weak| weak.upgrade())
            {
                listener.on_can_put();
            }
        }
    }

    // ------------------------------------------------------------------
    // 接收路径
    // ------------------------------------------------------------------

    fn transport_put(&self, data: &Buffer) -> GgResult<()> {
        let pdu = match packet::parse(data.as_slice()) {
            Ok(pdu) => pdu,
            Err(error) => {
                // 畸形包按传播策略丢弃。
                warn!(%error, "dropping malformed gattlink packet");
                return Ok(());
            }
        };
        match pdu {
            packet::GattlinkPdu::ResetRequest { version } => self.on_reset_request(version),
            packet::GattlinkPdu::ResetAccept { version } => self.on_reset_accept(version),
            packet::GattlinkPdu::Ack { asn } => self.process_ack(asn),
            packet::GattlinkPdu::Data { ack, psn, payload } => {
                if let Some(asn) = ack {
                    self.process_ack(asn);
                }
                self.on_data(psn, payload);
            }
        }
        Ok(())
    }

    fn on_data(&self, psn: u8, payload: &[u8]) {
        {
            let mut state = self.state.lock();
            if state.session != SessionState::Ready {
                debug!("data packet outside a ready session, discarding");
                return;
            }
            state.data_seen = true;
            state.probe_bytes += payload.len() as u64;
            // 每个数据包都要求一次短延迟确认（对端可能没收到上次的 ACK）。
            state.ack_pending = true;
            if psn == state.expected_psn {
                state.expected_psn = packet::sequence_increment(psn);
                state.reassembly.extend_from_slice(payload);
                // 抽出所有已完整的 varint 前缀数据报。
                loop {
                    match packet::decode_varint(&state.reassembly) {
                        Some((frame_len, prefix_len))
                            if state.reassembly.len() >= prefix_len + frame_len =>
                        {
                            let frame =
                                state.reassembly[prefix_len..prefix_len + frame_len].to_vec();
                            state.reassembly.drain(..prefix_len + frame_len);
                            state.pending_frames.push_back(Buffer::from_vec(frame));
                        }
                        _ => break,
                    }
                }
            } else {
                debug!(
                    psn,
                    expected = state.expected_psn,
                    "out-of-order packet discarded"
                );
            }
        }
        self.arm_ack_timer();
        self.deliver();
    }

    fn arm_ack_timer(&self) {
        if !self.ack_timer.is_scheduled() {
            let listener: Weak<dyn TimerListener> =
                Arc::downgrade(&self.timer_relay) as Weak<dyn TimerListener>;
            let _ = self.ack_timer.schedule(listener, ACK_DELAY_MS);
        }
    }

    /// 把欠下的确认以独立包发出（捎带机会已经错过）。
    fn flush_ack(&self) {
        let Some(transport) = self.transport_sink.lock().clone() else {
            return;
        };
        let ack = {
            let state = self.state.lock();
            if state.session != SessionState::Ready || !state.ack_pending {
                return;
            }
            packet::encode_ack(packet::sequence_decrement(state.expected_psn))
        };
        match transport.put_data(&Buffer::from_slice(&ack), None) {
            Ok(()) => {
                self.state.lock().ack_pending = false;
            }
            Err(error) if error.is_would_block() => {
                // 传输恢复后由 on_transport_can_put 再冲一次。
                self.state.lock().transport_blocked = true;
            }
            Err(error) => {
                warn!(code = error.raw_code(), "failed to send ack packet");
            }
        }
    }

    /// 把重组出的数据报交给用户 sink；拒收则挂起等 `on_can_put`。
    fn deliver(&self) {
        {
            let mut state = self.state.lock();
            if state.delivering {
                return;
            }
            state.delivering = true;
        }
        self.deliver_inner();
        self.state.lock().delivering = false;
    }

    fn deliver_inner(&self) {
        loop {
            let Some(sink) = self.user_sink.lock().clone() else {
                return;
            };
            let frame = {
                let state = self.state.lock();
                if state.user_blocked {
                    return;
                }
                state.pending_frames.front().cloned()
            };
            let Some(frame) = frame else { return };
            match sink.put_data(&frame, None) {
                Ok(()) => {
                    self.state.lock().pending_frames.pop_front();
                }
                Err(error) if error.is_would_block() => {
                    self.state.lock().user_blocked = true;
                    return;
                }
                Err(error) => {
                    warn!(code = error.raw_code(), "user sink rejected frame, dropping");
                    self.state.lock().pending_frames.pop_front();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // 背压与探针
    // ------------------------------------------------------------------

    fn on_user_can_put(&self) {
        self.state.lock().user_blocked = false;
        self.deliver();
    }

    fn on_transport_can_put(&self) {
        self.state.lock().transport_blocked = false;
        self.try_send_request();
        self.try_send_accept();
        self.flush_ack();
        self.pump();
    }

    fn on_probe_timer(&self) {
        let Some(probe) = self.config.probe else {
            return;
        };
        let bytes = {
            let mut state = self.state.lock();
            std::mem::take(&mut state.probe_bytes)
        };
        let bytes_per_second =
            u32::try_from(bytes.saturating_mul(1000) / probe.report_interval.max(1))
                .unwrap_or(u32::MAX);
        self.emit(&Event {
            event_type: EVENT_TYPE_LINK_PROBE_REPORT,
            data: EventData::LinkProbeReport { bytes_per_second },
        });
        let listener: Weak<dyn TimerListener> =
            Arc::downgrade(&self.timer_relay) as Weak<dyn TimerListener>;
        let _ = self.probe_timer.schedule(listener, probe.report_interval);
    }
}

/// 用户侧 sink：应用向链路写数据报。
struct UserSideSink {
    inner: Arc<GattlinkInner>,
}

impl DataSink for UserSideSink {
    fn put_data(&self, data: &Buffer, _metadata: Option<&BufferMetadata>) -> GgResult<()> {
        self.inner.user_put(data)
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        *self.inner.user_listener.lock() = listener;
        Ok(())
    }
}

/// 用户侧 source：链路向应用上交数据报。
struct UserSideSource {
    inner: Arc<GattlinkInner>,
}

impl DataSource for UserSideSource {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(previous) = self.inner.user_sink.lock().take() {
            let _ = previous.set_listener(None);
        }
        if let Some(sink) = sink {
            let listener: Weak<dyn DataSinkListener> = Arc::downgrade(&self.inner.user_relay)
                as Weak<dyn DataSinkListener>;
            sink.set_listener(Some(listener))?;
            *self.inner.user_sink.lock() = Some(sink);
        }
        Ok(())
    }
}

/// 传输侧 sink：传输向链路投递入站包。
struct TransportSideSink {
    inner: Arc<GattlinkInner>,
}

impl DataSink for TransportSideSink {
    fn put_data(&self, data: &Buffer, _metadata: Option<&BufferMetadata>) -> GgResult<()> {
        self.inner.transport_put(data)
    }
}

/// 传输侧 source：链路向传输发出站包。
struct TransportSideSource {
    inner: Arc<GattlinkInner>,
}

impl DataSource for TransportSideSource {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(previous) = self.inner.transport_sink.lock().take() {
            let _ = previous.set_listener(None);
        }
        if let Some(sink) = sink {
            let listener: Weak<dyn DataSinkListener> =
                Arc::downgrade(&self.inner.transport_relay) as Weak<dyn DataSinkListener>;
            sink.set_listener(Some(listener))?;
            *self.inner.transport_sink.lock() = Some(sink);
        }
        Ok(())
    }
}

/// Gattlink 栈元素：上下各一对 source/sink 端口。
pub struct Gattlink {
    inner: Arc<GattlinkInner>,
}

impl Gattlink {
    /// 构造 Gattlink 元素。
    ///
    /// # 契约
    /// - 窗口必须落在 1..=16；
    /// - 分片大小至少 3 字节（2 字节头加 1 字节负载）。
    pub fn new(config: GattlinkConfig, scheduler: &Arc<TimerScheduler>) -> GgResult<Arc<Self>> {
        if config.rx_window == 0
            || config.rx_window > MAX_WINDOW_SIZE
            || config.tx_window == 0
            || config.tx_window > MAX_WINDOW_SIZE
            || config.initial_max_fragment_size < MIN_FRAGMENT_SIZE
            || config.output_buffer_size == 0
        {
            return Err(GgError::InvalidParameters);
        }
        let timer_relay = Arc::new(TimerRelay {
            inner: Mutex::new(Weak::new()),
        });
        let user_relay = Arc::new(CanPutRelay {
            inner: Mutex::new(Weak::new()),
            side: RelaySide::User,
        });
        let transport_relay = Arc::new(CanPutRelay {
            inner: Mutex::new(Weak::new()),
            side: RelaySide::Transport,
        });
        let inner = Arc::new(GattlinkInner {
            config,
            state: Mutex::new(ProtocolState {
                session: SessionState::Idle,
                data_seen: false,
                out_buffer: Vec::new(),
                in_flight: VecDeque::new(),
                next_psn: 0,
                unsent_offset: 0,
                max_fragment_size: config.initial_max_fragment_size,
                transport_blocked: false,
                ack_pending: false,
                user_starved: false,
                expected_psn: 0,
                reassembly: Vec::new(),
                pending_frames: VecDeque::new(),
                user_blocked: false,
                probe_bytes: 0,
                pumping: false,
                delivering: false,
            }),
            user_sink: Mutex::new(None),
            transport_sink: Mutex::new(None),
            user_listener: Mutex::new(None),
            event_listener: Mutex::new(None),
            retransmit_timer: scheduler.create_timer(),
            ack_timer: scheduler.create_timer(),
            reset_timer: scheduler.create_timer(),
            probe_timer: scheduler.create_timer(),
            timer_relay: Arc::clone(&timer_relay),
            user_relay: Arc::clone(&user_relay),
            transport_relay: Arc::clone(&transport_relay),
        });
        *timer_relay.inner.lock() = Arc::downgrade(&inner);
        *user_relay.inner.lock() = Arc::downgrade(&inner);
        *transport_relay.inner.lock() = Arc::downgrade(&inner);
        Ok(Arc::new(Self { inner }))
    }

    /// 启动会话建立（幂等：非 Idle 状态下为空操作）。
    pub fn start(&self) {
        self.inner.start();
    }

    /// 重置回 Idle：废弃全部缓冲与会话状态。
    pub fn reset(&self) {
        self.inner.reset_session();
    }

    /// 当前会话状态。
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.inner.state.lock().session
    }

    /// 运行期调整分片大小（字节，含包头）。
    pub fn set_max_fragment_size(&self, size: usize) -> GgResult<()> {
        if size < MIN_FRAGMENT_SIZE {
            return Err(GgError::InvalidParameters);
        }
        self.inner.state.lock().max_fragment_size = size;
        self.inner.pump();
        Ok(())
    }

    /// 用户侧 sink（应用写入数据报）。
    #[must_use]
    pub fn user_side_sink(&self) -> Arc<dyn DataSink> {
        Arc::new(UserSideSink {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 用户侧 source（向应用交付数据报）。
    #[must_use]
    pub fn user_side_source(&self) -> Arc<dyn DataSource> {
        Arc::new(UserSideSource {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 传输侧 sink（传输投递入站包）。
    #[must_use]
    pub fn transport_side_sink(&self) -> Arc<dyn DataSink> {
        Arc::new(TransportSideSink {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 传输侧 source（向传输发出站包）。
    #[must_use]
    pub fn transport_side_source(&self) -> Arc<dyn DataSource> {
        Arc::new(TransportSideSource {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl EventEmitter for Gattlink {
    fn set_event_listener(&self, listener: Option<Weak<dyn EventListener>>) {
        *self.inner.event_listener.lock() = listener;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gg_core::util::MemoryDataSink;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<Event>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &Event) {
            self.events.lock().push(event.clone());
        }
    }

    fn feed(link: &Gattlink, bytes: &[u8]) {
        link.transport_side_sink()
            .put_data(&Buffer::from_slice(bytes), None)
            .unwrap();
    }

    #[test]
    fn initiator_becomes_ready_on_accept() {
        let scheduler = TimerScheduler::new();
        let link = Gattlink::new(GattlinkConfig::default(), &scheduler).unwrap();
        let transport = MemoryDataSink::new();
        link.transport_side_source()
            .set_data_sink(Some(transport.clone() as Arc<dyn DataSink>))
            .unwrap();

        link.start();
        assert_eq!(link.session_state(), SessionState::Initiating);
        // 发起方立刻发出重置请求。
        assert_eq!(transport.received_bytes(), packet::encode_reset_request());

        feed(&link, &packet::encode_reset_accept());
        assert_eq!(link.session_state(), SessionState::Ready);
    }

    #[test]
    fn responder_accepts_a_request() {
        let scheduler = TimerScheduler::new();
        let link = Gattlink::new(GattlinkConfig::default(), &scheduler).unwrap();
        let transport = MemoryDataSink::new();
        link.transport_side_source()
            .set_data_sink(Some(transport.clone() as Arc<dyn DataSink>))
            .unwrap();

        link.start();
        transport.clear();
        feed(&link, &packet::encode_reset_request());
        assert_eq!(link.session_state(), SessionState::Ready);
        // 应答包是"同意"。
        assert_eq!(transport.received_bytes(), packet::encode_reset_accept());
    }

    #[test]
    fn request_resends_until_answered() {
        let scheduler = TimerScheduler::new();
        let link = Gattlink::new(GattlinkConfig::default(), &scheduler).unwrap();
        let transport = MemoryDataSink::new();
        link.transport_side_source()
            .set_data_sink(Some(transport.clone() as Arc<dyn DataSink>))
            .unwrap();

        link.start();
        assert_eq!(transport.buffer_count(), 1);
        scheduler.set_time(RESET_RESEND_INTERVAL_MS);
        assert_eq!(transport.buffer_count(), 2);
        scheduler.set_time(RESET_RESEND_INTERVAL_MS * 2);
        assert_eq!(transport.buffer_count(), 3);

        feed(&link, &packet::encode_reset_accept());
        scheduler.set_time(RESET_RESEND_INTERVAL_MS * 5);
        // 就绪后不再重发请求。
        assert_eq!(transport.buffer_count(), 3);
    }

    #[test]
    fn probe_reports_received_throughput() {
        let scheduler = TimerScheduler::new();
        let link = Gattlink::new(
            GattlinkConfig {
                probe: Some(GattlinkProbeConfig {
                    report_interval: 1000,
                }),
                ..GattlinkConfig::default()
            },
            &scheduler,
        )
        .unwrap();
        let transport = MemoryDataSink::new();
        link.transport_side_source()
            .set_data_sink(Some(transport.clone() as Arc<dyn DataSink>))
            .unwrap();
        let recorder = Arc::new(Recorder::default());
        link.set_event_listener(Some(Arc::downgrade(&recorder) as Weak<dyn EventListener>));

        link.start();
        feed(&link, &packet::encode_reset_accept());

        // 构造一个 PSN=0、负载为 varint 框架数据报的数据包。
        let (header, header_len) = packet::encode_data_header(None, 0);
        let mut data_packet = header[..header_len].to_vec();
        let mut frame = Vec::new();
        packet::encode_varint(4, &mut frame);
        frame.extend_from_slice(b"ping");
        data_packet.extend_from_slice(&frame);
        feed(&link, &data_packet);

        scheduler.set_time(1000);
        let events = recorder.events.lock().clone();
        let report = events
            .iter()
            .find(|event| event.event_type == EVENT_TYPE_LINK_PROBE_REPORT)
            .expect("应当产生探针报告");
        assert_eq!(
            report.data,
            EventData::LinkProbeReport {
                bytes_per_second: frame.len() as u32,
            }
        );
    }
}
