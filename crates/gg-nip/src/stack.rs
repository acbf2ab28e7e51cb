//! Nip 栈本体：单网络接口的 IPv4/UDP 复用器。
//!
//! # 教案目的（Why）
//! - 原始实现以文件级单例承载栈状态；在所有权更严格的语言里，状态收进
//!   一个显式的所有者对象，公开 API 的用法不变（构造一次、处处共享）；
//! - 栈对下是一对 source/sink（与传输互联），对上是一组 UDP 端点；
//!   分发规则刻意极简：未绑定端点匹配任意目的端口，绑定端点精确匹配，
//!   先到先得。
//!
//! # 契约说明（What）
//! - 入站缓冲必须是"恰好一个完整 IP 包"；畸形或不相关的包记日志后丢弃，
//!   不构成错误；
//! - 动态端口从 `[0xC000..0xFFFF)` 区间按滚动游标线性探测；探测一圈无果
//!   返回 `OutOfResources`；
//! - 传输 sink 的 `on_can_put` 信号广播给所有注册了监听器的端点。

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};
use gg_core::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};

use crate::endpoint::UdpEndpoint;
use crate::ipv4;

/// 动态端口区间起点。
pub const UDP_DYNAMIC_PORT_RANGE_START: u16 = 0xC000;
/// 动态端口区间终点。
pub const UDP_DYNAMIC_PORT_RANGE_END: u16 = 0xFFFF;
const UDP_DYNAMIC_PORT_RANGE_SPAN: u16 = UDP_DYNAMIC_PORT_RANGE_END - UDP_DYNAMIC_PORT_RANGE_START;

struct StackState {
    address: Ipv4Addr,
    next_identification: u16,
    dynamic_port_cursor: u16,
    endpoints: Vec<Arc<UdpEndpoint>>,
    /// 端口占用表；与 `endpoints` 同步维护，让探测保持 O(1)。
    used_ports: HashSet<u16>,
}

/// 单接口 Nano-IP 栈。
pub struct NipStack {
    state: Mutex<StackState>,
    transport_sink: Mutex<Option<Arc<dyn DataSink>>>,
    weak_self: Weak<Self>,
}

impl NipStack {
    /// 以接口地址构造栈。
    #[must_use]
    pub fn new(address: Ipv4Addr) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(StackState {
                address,
                next_identification: 0,
                dynamic_port_cursor: 0,
                endpoints: Vec::new(),
                used_ports: HashSet::new(),
            }),
            transport_sink: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// 重新配置接口地址。
    pub fn configure(&self, address: Ipv4Addr) {
        self.state.lock().address = address;
    }

    /// 当前接口地址。
    #[must_use]
    pub fn address(&self) -> Ipv4Addr {
        self.state.lock().address
    }

    /// 把端点加入栈。
    ///
    /// # 契约
    /// - 同一端点只能加入一次（重复加入返回 `InvalidState`）；
    /// - 本地端口 0 时从动态区间分配；区间耗尽返回 `OutOfResources`；
    /// - 显式端口已被占用返回 `AddressInUse`。
    pub fn add_udp_endpoint(&self, endpoint: &Arc<UdpEndpoint>) -> GgResult<()> {
        if endpoint.is_attached() {
            return Err(GgError::InvalidState);
        }
        let this = self.weak_self.upgrade().ok_or(GgError::InvalidState)?;
        let mut state = self.state.lock();
        let requested_port = endpoint.local_port();
        let port = if requested_port == 0 {
            let mut chosen = None;
            for probe in 0..UDP_DYNAMIC_PORT_RANGE_SPAN {
                let offset = (state.dynamic_port_cursor + probe) % UDP_DYNAMIC_PORT_RANGE_SPAN;
                let candidate = UDP_DYNAMIC_PORT_RANGE_START + offset;
                if !state.used_ports.contains(&candidate) {
                    state.dynamic_port_cursor = (offset + 1) % UDP_DYNAMIC_PORT_RANGE_SPAN;
                    chosen = Some(candidate);
                    break;
                }
            }
            chosen.ok_or(GgError::OutOfResources)?
        } else {
            if state.used_ports.contains(&requested_port) {
                warn!(port = requested_port, "UDP port already in use");
                return Err(GgError::AddressInUse);
            }
            requested_port
        };
        let local_address = SocketAddrV4::new(state.address, port);
        state.used_ports.insert(port);
        state.endpoints.push(Arc::clone(endpoint));
        drop(state);
        endpoint.attach(&this, local_address);
        Ok(())
    }

    /// 把端点从栈中移除。
    pub fn remove_udp_endpoint(&self, endpoint: &Arc<UdpEndpoint>) -> GgResult<()> {
        let mut state = self.state.lock();
        let before = state.endpoints.len();
        state
            .endpoints
            .retain(|existing| !Arc::ptr_eq(existing, endpoint));
        if state.endpoints.len() == before {
            return Err(GgError::InvalidState);
        }
        state.used_ports.remove(&endpoint.local_port());
        drop(state);
        endpoint.detach();
        Ok(())
    }

    /// 出站：封装并发送一个 UDP 数据报（由端点调用）。
    pub(crate) fn send_udp(
        &self,
        source: SocketAddrV4,
        destination: SocketAddrV4,
        payload: &Buffer,
    ) -> GgResult<()> {
        let Some(transport) = self.transport_sink.lock().clone() else {
            return Err(GgError::NetworkUnreachable);
        };
        let identification = {
            let mut state = self.state.lock();
            let identification = state.next_identification;
            // 回绕属正常现象。
            state.next_identification = state.next_identification.wrapping_add(1);
            identification
        };
        let packet =
            ipv4::serialize_udp_packet(source, destination, identification, payload.as_slice())?;
        transport.put_data(&packet, None)
    }
}

impl DataSink for NipStack {
    /// 入站：传输投递上来的每个缓冲应恰好是一个 IP 包。
    fn put_data(&self, data: &Buffer, _metadata: Option<&BufferMetadata>) -> GgResult<()> {
        let parsed = match ipv4::parse_udp_packet(data.as_slice()) {
            Ok(parsed) => parsed,
            Err(error) => {
                // 畸形数据按传播策略丢弃，不上浮为错误。
                warn!(%error, "dropping malformed IP packet");
                return Ok(());
            }
        };
        let interface_address = self.state.lock().address;
        if *parsed.destination.ip() != interface_address {
            info!(destination = %parsed.destination, "dropping packet not addressed to the interface");
            return Ok(());
        }
        let endpoint = {
            let state = self.state.lock();
            state
                .endpoints
                .iter()
                .find(|endpoint| endpoint.matches_destination_port(parsed.destination.port()))
                .cloned()
        };
        match endpoint {
            Some(endpoint) => {
                let Ok(payload) = data
                    .sub_buffer(parsed.payload_offset..parsed.payload_offset + parsed.payload_len)
                else {
                    return Ok(());
                };
                endpoint.deliver(&payload, parsed.source);
            }
            None => {
                info!(port = parsed.destination.port(), "no matching socket found");
            }
        }
        Ok(())
    }
}

impl DataSource for NipStack {
    /// 与传输互联：设置出站 sink 并注册背压监听。
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(previous) = self.transport_sink.lock().take() {
            let _ = previous.set_listener(None);
        }
        if let Some(sink) = sink {
            let listener: Weak<dyn DataSinkListener> = self.weak_self.clone();
            sink.set_listener(Some(listener))?;
            *self.transport_sink.lock() = Some(sink);
        }
        Ok(())
    }
}

impl DataSinkListener for NipStack {
    /// 传输恢复可写：把信号广播给所有端点。
    fn on_can_put(&self) {
        let endpoints = self.state.lock().endpoints.clone();
        debug!(count = endpoints.len(), "forwarding on_can_put to endpoints");
        for endpoint in endpoints {
            endpoint.notify_can_put();
        }
    }
}
