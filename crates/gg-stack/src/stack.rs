//! 栈对象：一次对等连接的纵向管线实例。
//!
//! 栈持有按自顶向底顺序排列的元素、对外发布 IP 配置与端口查询，并把
//! 每个元素的事件用 `'stkf'` 包装转发（保留来源元素 ID）。销毁时先按
//! 反向断开布线再释放元素。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::info;

use gg_core::error::{GgError, GgResult};
use gg_core::events::{
    EVENT_TYPE_STACK_EVENT_FORWARD, Event, EventData, EventEmitter, EventListener,
};
use gg_core::fourcc::FourCc;
use gg_core::io::{DataSink, DataSource};
use gg_dtls::DtlsProtocol;
use gg_gattlink::Gattlink;
use gg_nip::{NipStack, UdpEndpoint};

use crate::builder::StackIpConfiguration;
use crate::monitor::ActivityMonitor;

/// 保留元素 ID：最顶端元素。
pub const STACK_ELEMENT_ID_TOP: FourCc = FourCc::new(*b"*top");
/// 保留元素 ID：最底端元素。
pub const STACK_ELEMENT_ID_BOTTOM: FourCc = FourCc::new(*b"*bot");

/// Gattlink 元素类型/ID。
pub const STACK_ELEMENT_TYPE_GATTLINK: FourCc = FourCc::new(*b"gatt");
/// 网络接口元素类型/ID。
pub const STACK_ELEMENT_TYPE_IP_NETWORK_INTERFACE: FourCc = FourCc::new(*b"neti");
/// 数据报套接字元素类型/ID。
pub const STACK_ELEMENT_TYPE_DATAGRAM_SOCKET: FourCc = FourCc::new(*b"sock");
/// DTLS 元素类型/ID。
pub const STACK_ELEMENT_TYPE_DTLS: FourCc = FourCc::new(*b"dtls");
/// 活动监视器元素类型/ID。
pub const STACK_ELEMENT_TYPE_ACTIVITY_MONITOR: FourCc = FourCc::new(*b"amon");

/// 端口选择：每个元素至多一个顶端口和一个底端口。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPortId {
    /// 顶端口。
    Top,
    /// 底端口。
    Bottom,
}

/// 一个端口的 source/sink 对（不存在的方向为 `None`）。
pub struct StackPort {
    /// 从该端口向外发数据的 source。
    pub source: Option<Arc<dyn DataSource>>,
    /// 向该端口写数据的 sink。
    pub sink: Option<Arc<dyn DataSink>>,
}

/// 元素概要：ID 与类型（描述串禁止重复元素，两者取同一 4CC）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackElementInfo {
    /// 元素 ID。
    pub id: FourCc,
    /// 元素类型。
    pub element_type: FourCc,
}

/// 栈内元素实体。
pub(crate) enum StackElement {
    /// Gattlink 链路层。
    Gattlink(Arc<Gattlink>),
    /// Nano-IP 网络接口。
    NetworkInterface(Arc<NipStack>),
    /// UDP 套接字（经由其下方的网络接口收发）。
    Socket(Arc<UdpEndpoint>),
    /// DTLS 协议。
    Dtls(Arc<DtlsProtocol>),
    /// 活动监视器。
    Monitor(Arc<ActivityMonitor>),
}

impl StackElement {
    pub(crate) fn type_id(&self) -> FourCc {
        match self {
            Self::Gattlink(_) => STACK_ELEMENT_TYPE_GATTLINK,
            Self::NetworkInterface(_) => STACK_ELEMENT_TYPE_IP_NETWORK_INTERFACE,
            Self::Socket(_) => STACK_ELEMENT_TYPE_DATAGRAM_SOCKET,
            Self::Dtls(_) => STACK_ELEMENT_TYPE_DTLS,
            Self::Monitor(_) => STACK_ELEMENT_TYPE_ACTIVITY_MONITOR,
        }
    }

    pub(crate) fn port(&self, port: StackPortId) -> StackPort {
        match (self, port) {
            (Self::Gattlink(gattlink), StackPortId::Top) => StackPort {
                source: Some(gattlink.user_side_source()),
                sink: Some(gattlink.user_side_sink()),
            },
            (Self::Gattlink(gattlink), StackPortId::Bottom) => StackPort {
                source: Some(gattlink.transport_side_source()),
                sink: Some(gattlink.transport_side_sink()),
            },
            (Self::Dtls(dtls), StackPortId::Top) => StackPort {
                source: Some(dtls.user_side_source()),
                sink: Some(dtls.user_side_sink()),
            },
            (Self::Dtls(dtls), StackPortId::Bottom) => StackPort {
                source: Some(dtls.transport_side_source()),
                sink: Some(dtls.transport_side_sink()),
            },
            (Self::Monitor(monitor), StackPortId::Top) => StackPort {
                source: Some(monitor.top_source()),
                sink: Some(monitor.top_sink()),
            },
            (Self::Monitor(monitor), StackPortId::Bottom) => StackPort {
                source: Some(monitor.bottom_source()),
                sink: Some(monitor.bottom_sink()),
            },
            (Self::Socket(endpoint), StackPortId::Top) => StackPort {
                source: Some(Arc::clone(endpoint) as Arc<dyn DataSource>),
                sink: Some(Arc::clone(endpoint) as Arc<dyn DataSink>),
            },
            // 套接字的"底"走网络接口内部的端点挂接，不是管线端口。
            (Self::Socket(_), StackPortId::Bottom) => StackPort {
                source: None,
                sink: None,
            },
            // 网络接口的"顶"同理。
            (Self::NetworkInterface(_), StackPortId::Top) => StackPort {
                source: None,
                sink: None,
            },
            (Self::NetworkInterface(nip), StackPortId::Bottom) => StackPort {
                source: Some(Arc::clone(nip) as Arc<dyn DataSource>),
                sink: Some(Arc::clone(nip) as Arc<dyn DataSink>),
            },
        }
    }

    fn reset(&self) {
        match self {
            Self::Gattlink(gattlink) => {
                gattlink.reset();
            }
            Self::Dtls(dtls) => dtls.reset(),
            Self::Monitor(monitor) => monitor.reset(),
            // 网络接口与套接字无会话状态可重置。
            Self::NetworkInterface(_) | Self::Socket(_) => {}
        }
    }

    fn start(&self) {
        match self {
            Self::Gattlink(gattlink) => gattlink.start(),
            Self::Dtls(dtls) => {
                let _ = dtls.start_handshake();
            }
            Self::NetworkInterface(_) | Self::Socket(_) | Self::Monitor(_) => {}
        }
    }
}

/// 把子元素事件包上来源 ID 转发给栈监听器。
pub(crate) struct StackEventRelay {
    stack: Mutex<Weak<Stack>>,
    element_id: FourCc,
}

impl StackEventRelay {
    pub(crate) fn new(element_id: FourCc) -> Arc<Self> {
        Arc::new(Self {
            stack: Mutex::new(Weak::new()),
            element_id,
        })
    }

    pub(crate) fn bind(&self, stack: &Arc<Stack>) {
        *self.stack.lock() = Arc::downgrade(stack);
    }
}

impl EventListener for StackEventRelay {
    fn on_event(&self, event: &Event) {
        let Some(stack) = self.stack.lock().upgrade() else {
            return;
        };
        let forwarded = Event {
            event_type: EVENT_TYPE_STACK_EVENT_FORWARD,
            data: EventData::Forward {
                element: self.element_id,
                event: Box::new(event.clone()),
            },
        };
        if let Some(listener) = stack
            .event_listener
            .lock()
            .clone()
            .and_then(|weak| weak.upgrade())
        {
            listener.on_event(&forwarded);
        }
    }
}

/// 一条组装完成的栈。
pub struct Stack {
    /// 自顶向底排列。
    pub(crate) elements: Vec<StackElement>,
    pub(crate) ip_configuration: Option<StackIpConfiguration>,
    pub(crate) event_listener: Mutex<Option<Weak<dyn EventListener>>>,
    /// 保活各元素上注册的事件中继。
    pub(crate) event_relays: Vec<Arc<StackEventRelay>>,
    /// 外部传输（底端）的 source，销毁时需要断开。
    pub(crate) transport_source: Mutex<Option<Arc<dyn DataSource>>>,
}

impl Stack {
    /// 元素概要列表（自顶向底）。
    #[must_use]
    pub fn elements(&self) -> Vec<StackElementInfo> {
        self.elements
            .iter()
            .map(|element| StackElementInfo {
                id: element.type_id(),
                element_type: element.type_id(),
            })
            .collect()
    }

    /// 发布的 IP 配置（无 IP 层的栈为 `None`）。
    #[must_use]
    pub fn ip_configuration(&self) -> Option<StackIpConfiguration> {
        self.ip_configuration
    }

    /// 按（元素 ID，端口 ID）查端口；`*top`/`*bot` 指代两端元素。
    pub fn port(&self, element_id: FourCc, port_id: StackPortId) -> GgResult<StackPort> {
        let element = if element_id == STACK_ELEMENT_ID_TOP {
            self.elements.first()
        } else if element_id == STACK_ELEMENT_ID_BOTTOM {
            self.elements.last()
        } else {
            self.elements
                .iter()
                .find(|element| element.type_id() == element_id)
        };
        let element = element.ok_or(GgError::NoSuchItem)?;
        let port = element.port(port_id);
        if port.source.is_none() && port.sink.is_none() {
            return Err(GgError::NoSuchItem);
        }
        Ok(port)
    }

    /// 启动栈：自底向顶启动各元素（链路先就绪，DTLS 随后握手）。
    pub fn start(&self) {
        info!("starting stack");
        for element in self.elements.iter().rev() {
            element.start();
        }
    }

    /// 重置栈：按顺序重置每个元素（拆除会话、清状态），布线保持不动，
    /// 随后重新启动。
    pub fn reset(&self) {
        info!("resetting stack");
        for element in &self.elements {
            element.reset();
        }
        self.start();
    }

    /// 链路 MTU 变化：调整 Gattlink 分片大小并发出 `'mtuc'` 事件。
    pub fn on_link_mtu_change(&self, mtu: u32) -> GgResult<()> {
        for element in &self.elements {
            if let StackElement::Gattlink(gattlink) = element {
                gattlink.set_max_fragment_size(mtu as usize)?;
            }
        }
        if let Some(listener) = self
            .event_listener
            .lock()
            .clone()
            .and_then(|weak| weak.upgrade())
        {
            listener.on_event(&Event {
                event_type: gg_core::events::EVENT_TYPE_LINK_MTU_CHANGE,
                data: EventData::LinkMtuChange(mtu),
            });
        }
        Ok(())
    }
}

impl EventEmitter for Stack {
    fn set_event_listener(&self, listener: Option<Weak<dyn EventListener>>) {
        *self.event_listener.lock() = listener;
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        // 先断开外部传输，再按反向断开元素间布线。
        if let Some(transport_source) = self.transport_source.lock().take() {
            let _ = transport_source.set_data_sink(None);
        }
        for element in self.elements.iter().rev() {
            for port_id in [StackPortId::Top, StackPortId::Bottom] {
                if let Some(source) = element.port(port_id).source {
                    let _ = source.set_data_sink(None);
                }
            }
        }
    }
}
