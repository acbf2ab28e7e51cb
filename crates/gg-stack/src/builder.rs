//! 栈组装器：描述串解析、元素实例化与布线。
//!
//! # 契约说明（What）
//! - 描述串自顶向底一字符一元素：`G`、`N`、`S`、`D`、`A`；空串、未知
//!   字符、重复元素都是 `InvalidParameters`；
//! - `D` 的角色由 `role` 决定：node 作 DTLS 客户端（需要客户端参数），
//!   hub 作服务端（需要密钥解析器）；参数缺失即失败；
//! - `S` 必须紧贴在 `N` 之上（套接字经网络接口的端点挂接通信，而非
//!   管线端口）；
//! - IP 配置缺省：hub 本端 169.254.0.2 对端 169.254.0.3，node 本端
//!   169.254.0.4 对端 169.254.0.5；掩码 255.255.255.0；MTU 1280；
//! - 组装中途失败时，已创建的元素随错误返回一并释放（部分栈不外泄）。

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use gg_core::error::{GgError, GgResult};
use gg_core::events::{EventEmitter, EventListener};
use gg_core::io::{DataSink, DataSource};
use gg_core::timer::TimerScheduler;
use gg_dtls::{
    DtlsClientOptions, DtlsEngineFactory, DtlsOptions, DtlsProtocol, DtlsServerOptions,
};
use gg_gattlink::{Gattlink, GattlinkConfig};
use gg_nip::{NipStack, UdpEndpoint};

use crate::monitor::ActivityMonitor;
use crate::stack::{Stack, StackElement, StackEventRelay, StackPortId};

/// 数据报套接字元素的缺省本地/远端端口（CoAP 端口）。
pub const STACK_DEFAULT_SOCKET_PORT: u16 = 5683;
/// 活动监视器的缺省静默阈值（毫秒）。
pub const STACK_DEFAULT_INACTIVITY_TIMEOUT_MS: u64 = 10_000;
/// 缺省 IP MTU。
pub const STACK_DEFAULT_IP_MTU: u32 = 1280;

/// 栈角色：hub 是网关侧（DTLS 服务端），node 是外设侧（DTLS 客户端）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackRole {
    /// 网关。
    Hub,
    /// 外设。
    Node,
}

/// 栈发布的 IP 配置。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackIpConfiguration {
    /// 本端地址。
    pub local_address: Ipv4Addr,
    /// 对端地址。
    pub remote_address: Ipv4Addr,
    /// 子网掩码。
    pub netmask: Ipv4Addr,
    /// 愿意转发的最大 IP 包。
    pub ip_mtu: u32,
}

impl StackIpConfiguration {
    /// 按角色取缺省地址对。
    #[must_use]
    pub fn default_for_role(role: StackRole) -> Self {
        let (local, remote) = match role {
            StackRole::Hub => (Ipv4Addr::new(169, 254, 0, 2), Ipv4Addr::new(169, 254, 0, 3)),
            StackRole::Node => (Ipv4Addr::new(169, 254, 0, 4), Ipv4Addr::new(169, 254, 0, 5)),
        };
        Self {
            local_address: local,
            remote_address: remote,
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            ip_mtu: STACK_DEFAULT_IP_MTU,
        }
    }
}

/// 按元素类型提供的参数。
pub enum StackElementParameters {
    /// Gattlink 配置。
    Gattlink(GattlinkConfig),
    /// 数据报套接字的端口对。
    DatagramSocket {
        /// 本地端口（0 表示由 Nip 分配动态端口）。
        local_port: u16,
        /// 远端端口。
        remote_port: u16,
    },
    /// DTLS 客户端参数（node 角色的 `D` 元素必需）。
    DtlsClient {
        /// PSK 凭据与套件偏好。
        options: DtlsClientOptions,
        /// 引擎工厂。
        factory: Arc<dyn DtlsEngineFactory>,
    },
    /// DTLS 服务端参数（hub 角色的 `D` 元素必需）。
    DtlsServer {
        /// 密钥解析器与套件偏好。
        options: DtlsServerOptions,
        /// 引擎工厂。
        factory: Arc<dyn DtlsEngineFactory>,
    },
    /// 活动监视器参数。
    ActivityMonitor {
        /// 静默阈值（毫秒）。
        inactivity_timeout_ms: u64,
    },
}

/// 组装一条栈。
///
/// `transport` 给定时，把外部传输接在最底端元素的底端口上。
pub fn build_stack(
    descriptor: &str,
    parameters: Vec<StackElementParameters>,
    role: StackRole,
    ip_configuration: Option<StackIpConfiguration>,
    scheduler: &Arc<TimerScheduler>,
    transport: Option<(Arc<dyn DataSource>, Arc<dyn DataSink>)>,
) -> GgResult<Arc<Stack>> {
    // ------------------------------------------------------------------
    // 校验描述串
    // ------------------------------------------------------------------
    if descriptor.is_empty() {
        return Err(GgError::InvalidParameters);
    }
    let element_types: Vec<char> = descriptor.chars().collect();
    for (index, element_type) in element_types.iter().enumerate() {
        if !matches!(element_type, 'G' | 'N' | 'S' | 'D' | 'A') {
            return Err(GgError::InvalidParameters);
        }
        if element_types[..index].contains(element_type) {
            return Err(GgError::InvalidParameters);
        }
    }
    // S 必须紧贴在 N 之上，N 不能没有 S。
    let socket_index = element_types.iter().position(|c| *c == 'S');
    let netif_index = element_types.iter().position(|c| *c == 'N');
    match (socket_index, netif_index) {
        (None, None) => {}
        (Some(socket), Some(netif)) if socket + 1 == netif => {}
        _ => return Err(GgError::InvalidParameters),
    }

    // ------------------------------------------------------------------
    // 汇集参数
    // ------------------------------------------------------------------
    let mut gattlink_config: Option<GattlinkConfig> = None;
    let mut socket_ports: Option<(u16, u16)> = None;
    let mut dtls_client: Option<(DtlsClientOptions, Arc<dyn DtlsEngineFactory>)> = None;
    let mut dtls_server: Option<(DtlsServerOptions, Arc<dyn DtlsEngineFactory>)> = None;
    let mut monitor_timeout: Option<u64> = None;
    for parameter in parameters {
        match parameter {
            StackElementParameters::Gattlink(config) => gattlink_config = Some(config),
            StackElementParameters::DatagramSocket {
                local_port,
                remote_port,
            } => socket_ports = Some((local_port, remote_port)),
            StackElementParameters::DtlsClient { options, factory } => {
                dtls_client = Some((options, factory));
            }
            StackElementParameters::DtlsServer { options, factory } => {
                dtls_server = Some((options, factory));
            }
            StackElementParameters::ActivityMonitor {
                inactivity_timeout_ms,
            } => monitor_timeout = Some(inactivity_timeout_ms),
        }
    }

    let ip_configuration_value = ip_configuration
        .unwrap_or_else(|| StackIpConfiguration::default_for_role(role));

    // ------------------------------------------------------------------
    // 实例化（自顶向底）
    // ------------------------------------------------------------------
    let mut elements: Vec<StackElement> = Vec::with_capacity(element_types.len());
    for element_type in &element_types {
        let element = match element_type {
            'G' => StackElement::Gattlink(Gattlink::new(
                gattlink_config.unwrap_or_default(),
                scheduler,
            )?),
            'N' => StackElement::NetworkInterface(NipStack::new(
                ip_configuration_value.local_address,
            )),
            'S' => {
                let (local_port, remote_port) =
                    socket_ports.unwrap_or((STACK_DEFAULT_SOCKET_PORT, STACK_DEFAULT_SOCKET_PORT));
                StackElement::Socket(UdpEndpoint::new(
                    local_port,
                    Some(SocketAddrV4::new(
                        ip_configuration_value.remote_address,
                        remote_port,
                    )),
                ))
            }
            'D' => {
                let protocol = match role {
                    StackRole::Node => {
                        let (options, factory) =
                            dtls_client.take().ok_or(GgError::InvalidParameters)?;
                        DtlsProtocol::new(DtlsOptions::Client(options), &factory)?
                    }
                    StackRole::Hub => {
                        let (options, factory) =
                            dtls_server.take().ok_or(GgError::InvalidParameters)?;
                        DtlsProtocol::new(DtlsOptions::Server(options), &factory)?
                    }
                };
                StackElement::Dtls(protocol)
            }
            'A' => StackElement::Monitor(ActivityMonitor::new(
                scheduler,
                monitor_timeout.unwrap_or(STACK_DEFAULT_INACTIVITY_TIMEOUT_MS),
            )),
            _ => return Err(GgError::InvalidParameters),
        };
        elements.push(element);
    }

    // ------------------------------------------------------------------
    // 布线（首尾相接）
    // ------------------------------------------------------------------
    for index in 0..elements.len().saturating_sub(1) {
        let (upper_slice, lower_slice) = elements.split_at(index + 1);
        let upper = &upper_slice[index];
        let lower = &lower_slice[0];
        if let (StackElement::Socket(endpoint), StackElement::NetworkInterface(nip)) =
            (upper, lower)
        {
            nip.add_udp_endpoint(endpoint)?;
            debug!("socket endpoint attached to the network interface");
            continue;
        }
        let upper_bottom = upper.port(StackPortId::Bottom);
        let lower_top = lower.port(StackPortId::Top);
        let (Some(down_source), Some(down_sink)) = (upper_bottom.source, lower_top.sink) else {
            return Err(GgError::InvalidParameters);
        };
        let (Some(up_source), Some(up_sink)) = (lower_top.source, upper_bottom.sink) else {
            return Err(GgError::InvalidParameters);
        };
        down_source.set_data_sink(Some(down_sink))?;
        up_source.set_data_sink(Some(up_sink))?;
    }

    // 外部传输接在最底端。
    let mut kept_transport_source: Option<Arc<dyn DataSource>> = None;
    if let Some((transport_source, transport_sink)) = transport {
        let bottom = elements
            .last()
            .map(|element| element.port(StackPortId::Bottom))
            .ok_or(GgError::InvalidParameters)?;
        let (Some(bottom_source), Some(bottom_sink)) = (bottom.source, bottom.sink) else {
            return Err(GgError::InvalidParameters);
        };
        transport_source.set_data_sink(Some(bottom_sink))?;
        bottom_source.set_data_sink(Some(transport_sink))?;
        kept_transport_source = Some(transport_source);
    }

    // ------------------------------------------------------------------
    // 事件汇聚
    // ------------------------------------------------------------------
    let mut relays = Vec::new();
    for element in &elements {
        let relay = StackEventRelay::new(element.type_id());
        let relay_dyn: Arc<dyn EventListener> = relay.clone();
        let weak: Weak<dyn EventListener> = Arc::downgrade(&relay_dyn);
        match element {
            StackElement::Gattlink(gattlink) => gattlink.set_event_listener(Some(weak)),
            StackElement::Dtls(dtls) => dtls.set_event_listener(Some(weak)),
            StackElement::Monitor(monitor) => monitor.set_event_listener(Some(weak)),
            StackElement::NetworkInterface(_) | StackElement::Socket(_) => continue,
        }
        relays.push(relay);
    }

    let publishes_ip = element_types.contains(&'N');
    let stack = Arc::new(Stack {
        elements,
        ip_configuration: publishes_ip.then_some(ip_configuration_value),
        event_listener: Mutex::new(None),
        event_relays: relays,
        transport_source: Mutex::new(kept_transport_source),
    });
    for relay in &stack.event_relays {
        relay.bind(&stack);
    }
    info!(descriptor, role = ?role, "stack built");
    Ok(stack)
}
