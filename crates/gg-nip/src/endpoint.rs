//! UDP 端点：Nip 栈上可收发数据报的套接字对象。
//!
//! # 交互契约（What）
//! - 端点作为 [`DataSink`] 接收上层要发送的负载（出站），作为
//!   [`DataSource`] 把收到的负载交给上层 sink（入站）；
//! - 本地端口为 0 的端点在加入栈时获得动态端口且保持"未绑定"语义：
//!   入站匹配任意目的端口；显式端口的端点只做精确匹配；
//! - 入站投递不排队：上层 sink 拒收即丢弃（数据报语义允许丢包）。

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};
use gg_core::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};

use crate::ipv4;
use crate::stack::NipStack;

struct EndpointState {
    local_address: SocketAddrV4,
    remote_address: Option<SocketAddrV4>,
    /// 显式绑定本地端口（入站做精确匹配）。
    port_bound: bool,
    /// 已连接（忽略出站元数据中的目的地址）。
    connected: bool,
    stack: Weak<NipStack>,
}

/// Nip 栈上的 UDP 端点。
pub struct UdpEndpoint {
    state: Mutex<EndpointState>,
    user_sink: Mutex<Option<Arc<dyn DataSink>>>,
    listener: Mutex<Option<Weak<dyn DataSinkListener>>>,
}

impl UdpEndpoint {
    /// 构造端点。
    ///
    /// - `local_port = 0` 表示由栈分配动态端口（未绑定语义）；
    /// - `remote` 给定时端点处于已连接状态，出站忽略目的地址元数据。
    #[must_use]
    pub fn new(local_port: u16, remote: Option<SocketAddrV4>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EndpointState {
                local_address: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port),
                remote_address: remote,
                port_bound: local_port != 0,
                connected: remote.is_some(),
                stack: Weak::new(),
            }),
            user_sink: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }

    /// 本地地址（加入栈之前地址部分未指定）。
    #[must_use]
    pub fn local_address(&self) -> SocketAddrV4 {
        self.state.lock().local_address
    }

    /// 已配置的远端地址。
    #[must_use]
    pub fn remote_address(&self) -> Option<SocketAddrV4> {
        self.state.lock().remote_address
    }

    pub(crate) fn attach(&self, stack: &Arc<NipStack>, local_address: SocketAddrV4) {
        let mut state = self.state.lock();
        state.stack = Arc::downgrade(stack);
        state.local_address = local_address;
    }

    pub(crate) fn detach(&self) {
        self.state.lock().stack = Weak::new();
    }

    pub(crate) fn is_attached(&self) -> bool {
        self.state.lock().stack.strong_count() > 0
    }

    pub(crate) fn local_port(&self) -> u16 {
        self.state.lock().local_address.port()
    }

    pub(crate) fn matches_destination_port(&self, port: u16) -> bool {
        let state = self.state.lock();
        !state.port_bound || state.local_address.port() == port
    }

    /// 入站投递：负载与 `'srca'` 元数据交给上层 sink，拒收即丢弃。
    pub(crate) fn deliver(&self, payload: &Buffer, source: SocketAddrV4) {
        let Some(sink) = self.user_sink.lock().clone() else {
            debug!("socket has no sink, dropping");
            return;
        };
        let metadata = BufferMetadata::source_socket_address(source);
        if let Err(error) = sink.put_data(payload, Some(&metadata)) {
            debug!(code = error.raw_code(), "dropping received datagram rejected by the user sink");
        }
    }

    /// 传输恢复可写时由栈转发过来的信号。
    pub(crate) fn notify_can_put(&self) {
        if let Some(listener) = self.listener.lock().clone().and_then(|weak| weak.upgrade()) {
            listener.on_can_put();
        }
    }
}

impl DataSink for UdpEndpoint {
    /// 出站：封装 IP+UDP 头并交给栈的传输 sink。
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()> {
        if data.len() > ipv4::MAX_UDP_PAYLOAD_SIZE {
            return Err(GgError::InvalidParameters);
        }
        let (stack, source, destination) = {
            let state = self.state.lock();
            let stack = state.stack.upgrade().ok_or(GgError::NetworkUnreachable)?;
            let destination = match metadata {
                Some(BufferMetadata::DestinationSocketAddress(socket_metadata))
                    if !state.connected =>
                {
                    Some(socket_metadata.address)
                }
                _ => state.remote_address,
            };
            (stack, state.local_address, destination)
        };
        let Some(destination) = destination else {
            warn!("no destination for unconnected endpoint without metadata");
            return Err(GgError::NotConnected);
        };
        if destination.ip().is_unspecified() || destination.port() == 0 {
            warn!(%destination, "invalid destination address or port");
            return Err(GgError::InvalidState);
        }
        stack.send_udp(source, destination, data)
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        *self.listener.lock() = listener;
        Ok(())
    }
}

impl DataSource for UdpEndpoint {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        *self.user_sink.lock() = sink;
        Ok(())
    }
}
