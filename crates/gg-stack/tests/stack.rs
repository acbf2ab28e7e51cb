//! 栈组装器与整栈集成测试。

use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use gg_core::buffer::Buffer;
use gg_core::error::GgError;
use gg_core::events::{
    EVENT_TYPE_GATTLINK_SESSION_READY, EVENT_TYPE_STACK_EVENT_FORWARD, EVENT_TYPE_TLS_STATE_CHANGE,
    Event, EventData, EventEmitter, EventListener,
};
use gg_core::fourcc::FourCc;
use gg_core::io::{DataSink, DataSource};
use gg_core::timer::TimerScheduler;
use gg_core::util::{AsyncPipe, MemoryDataSink};
use gg_dtls::testing::LoopbackEngineFactory;
use gg_dtls::{DtlsClientOptions, DtlsEngineFactory, DtlsKeyResolver, DtlsServerOptions, suites};
use gg_stack::stack::{
    STACK_ELEMENT_TYPE_DATAGRAM_SOCKET, STACK_ELEMENT_TYPE_GATTLINK,
    STACK_ELEMENT_TYPE_IP_NETWORK_INTERFACE,
};
use gg_stack::{
    STACK_ELEMENT_ID_BOTTOM, STACK_ELEMENT_ID_TOP, StackElementParameters, StackIpConfiguration,
    StackPortId, StackRole, build_stack,
};

struct FixedResolver {
    key: Vec<u8>,
}

impl DtlsKeyResolver for FixedResolver {
    fn resolve_key(&self, _identity: &[u8]) -> Option<Vec<u8>> {
        Some(self.key.clone())
    }
}

fn dtls_client_parameters() -> StackElementParameters {
    StackElementParameters::DtlsClient {
        options: DtlsClientOptions {
            identity: b"hello".to_vec(),
            key: vec![0u8; 16],
            ticket: None,
            cipher_suites: suites::SUPPORTED_CIPHER_SUITES.to_vec(),
        },
        factory: Arc::new(LoopbackEngineFactory) as Arc<dyn DtlsEngineFactory>,
    }
}

fn dtls_server_parameters() -> StackElementParameters {
    StackElementParameters::DtlsServer {
        options: DtlsServerOptions {
            key_resolver: Arc::new(FixedResolver {
                key: vec![0u8; 16],
            }),
            cipher_suites: suites::SUPPORTED_CIPHER_SUITES.to_vec(),
        },
        factory: Arc::new(LoopbackEngineFactory) as Arc<dyn DtlsEngineFactory>,
    }
}

#[derive(Default)]
struct EventRecorder {
    events: Mutex<Vec<Event>>,
}

impl EventListener for EventRecorder {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

#[test]
fn descriptor_validation_rejects_bad_input() {
    let scheduler = TimerScheduler::new();
    // 空描述串。
    assert!(matches!(
        build_stack("", Vec::new(), StackRole::Hub, None, &scheduler, None),
        Err(GgError::InvalidParameters)
    ));
    // 未知元素。
    assert!(matches!(
        build_stack("?", Vec::new(), StackRole::Hub, None, &scheduler, None),
        Err(GgError::InvalidParameters)
    ));
    // 重复元素。
    assert!(matches!(
        build_stack("GG", Vec::new(), StackRole::Hub, None, &scheduler, None),
        Err(GgError::InvalidParameters)
    ));
    // DTLS 缺参数：hub 与 node 都失败。
    assert!(matches!(
        build_stack("DSNG", Vec::new(), StackRole::Hub, None, &scheduler, None),
        Err(GgError::InvalidParameters)
    ));
    assert!(matches!(
        build_stack("DSNG", Vec::new(), StackRole::Node, None, &scheduler, None),
        Err(GgError::InvalidParameters)
    ));
    // S 不贴着 N。
    assert!(matches!(
        build_stack("SG", Vec::new(), StackRole::Hub, None, &scheduler, None),
        Err(GgError::InvalidParameters)
    ));
}

#[test]
fn default_ip_configuration_follows_the_role() {
    let scheduler = TimerScheduler::new();
    let hub = build_stack("SNG", Vec::new(), StackRole::Hub, None, &scheduler, None).unwrap();
    let node = build_stack("SNG", Vec::new(), StackRole::Node, None, &scheduler, None).unwrap();
    let hub_ip = hub.ip_configuration().unwrap();
    let node_ip = node.ip_configuration().unwrap();
    assert_eq!(hub_ip.local_address, Ipv4Addr::new(169, 254, 0, 2));
    assert_eq!(hub_ip.remote_address, Ipv4Addr::new(169, 254, 0, 3));
    assert_eq!(node_ip.local_address, Ipv4Addr::new(169, 254, 0, 4));
    assert_eq!(node_ip.remote_address, Ipv4Addr::new(169, 254, 0, 5));
    assert_eq!(node_ip.ip_mtu, 1280);

    // 纯链路栈没有 IP 配置可发布。
    let link_only = build_stack("G", Vec::new(), StackRole::Node, None, &scheduler, None).unwrap();
    assert!(link_only.ip_configuration().is_none());
}

#[test]
fn port_lookup_resolves_reserved_and_element_ids() {
    let scheduler = TimerScheduler::new();
    let stack = build_stack("SNG", Vec::new(), StackRole::Node, None, &scheduler, None).unwrap();

    let elements = stack.elements();
    assert_eq!(elements.len(), 3);
    assert_eq!(elements[0].element_type, STACK_ELEMENT_TYPE_DATAGRAM_SOCKET);
    assert_eq!(
        elements[1].element_type,
        STACK_ELEMENT_TYPE_IP_NETWORK_INTERFACE
    );
    assert_eq!(elements[2].element_type, STACK_ELEMENT_TYPE_GATTLINK);

    // TOP 解析到套接字的顶端口，BOTTOM 解析到 Gattlink 的底端口。
    let top = stack.port(STACK_ELEMENT_ID_TOP, StackPortId::Top).unwrap();
    assert!(top.source.is_some() && top.sink.is_some());
    let bottom = stack
        .port(STACK_ELEMENT_ID_BOTTOM, StackPortId::Bottom)
        .unwrap();
    assert!(bottom.source.is_some() && bottom.sink.is_some());

    // 按元素 ID 查询；没有数据端口的方向报 NoSuchItem。
    assert!(stack.port(STACK_ELEMENT_TYPE_GATTLINK, StackPortId::Top).is_ok());
    assert!(matches!(
        stack.port(STACK_ELEMENT_TYPE_DATAGRAM_SOCKET, StackPortId::Bottom),
        Err(GgError::NoSuchItem)
    ));
    assert!(matches!(
        stack.port(FourCc::new(*b"nope"), StackPortId::Top),
        Err(GgError::NoSuchItem)
    ));
}

/// 把两条栈的底端经异步管道互联。
fn link_stacks(
    scheduler: &Arc<TimerScheduler>,
    left: &Arc<gg_stack::Stack>,
    right: &Arc<gg_stack::Stack>,
) {
    let left_bottom = left
        .port(STACK_ELEMENT_ID_BOTTOM, StackPortId::Bottom)
        .unwrap();
    let right_bottom = right
        .port(STACK_ELEMENT_ID_BOTTOM, StackPortId::Bottom)
        .unwrap();
    let left_to_right = AsyncPipe::new(scheduler, 64);
    let right_to_left = AsyncPipe::new(scheduler, 64);
    left_to_right
        .set_data_sink(Some(right_bottom.sink.unwrap()))
        .unwrap();
    right_to_left
        .set_data_sink(Some(left_bottom.sink.unwrap()))
        .unwrap();
    left_bottom
        .source
        .unwrap()
        .set_data_sink(Some(left_to_right as Arc<dyn DataSink>))
        .unwrap();
    right_bottom
        .source
        .unwrap()
        .set_data_sink(Some(right_to_left as Arc<dyn DataSink>))
        .unwrap();
}

fn run_ticks(scheduler: &Arc<TimerScheduler>, ticks: u64, step: u64) {
    let start = scheduler.now();
    for tick in 1..=ticks {
        scheduler.set_time(start + tick * step);
    }
}

#[test]
fn two_gattlink_stacks_exchange_user_datagrams() {
    let scheduler = TimerScheduler::new();
    let left = build_stack("G", Vec::new(), StackRole::Node, None, &scheduler, None).unwrap();
    let right = build_stack("G", Vec::new(), StackRole::Hub, None, &scheduler, None).unwrap();
    link_stacks(&scheduler, &left, &right);

    let right_rx = MemoryDataSink::new();
    right
        .port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .source
        .unwrap()
        .set_data_sink(Some(right_rx.clone() as Arc<dyn DataSink>))
        .unwrap();

    let recorder = Arc::new(EventRecorder::default());
    left.set_event_listener(Some(Arc::downgrade(&recorder) as Weak<dyn EventListener>));

    left.start();
    right.start();
    run_ticks(&scheduler, 8, 25);

    left.port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .sink
        .unwrap()
        .put_data(&Buffer::from_slice(b"over the link"), None)
        .unwrap();
    run_ticks(&scheduler, 8, 25);
    assert_eq!(right_rx.received_bytes(), b"over the link");

    // 栈事件带 'stkf' 包装并保留来源元素。
    let events = recorder.events.lock();
    let forwarded = events
        .iter()
        .find(|event| event.event_type == EVENT_TYPE_STACK_EVENT_FORWARD)
        .expect("应转发子元素事件");
    match &forwarded.data {
        EventData::Forward { element, event } => {
            assert_eq!(*element, STACK_ELEMENT_TYPE_GATTLINK);
            assert_eq!(event.event_type, EVENT_TYPE_GATTLINK_SESSION_READY);
        }
        other => panic!("unexpected event payload: {other:?}"),
    }
}

/// 互通的地址配置：两端互为对端。
fn paired_ip(local: [u8; 4], remote: [u8; 4]) -> StackIpConfiguration {
    StackIpConfiguration {
        local_address: Ipv4Addr::from(local),
        remote_address: Ipv4Addr::from(remote),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        ip_mtu: 1280,
    }
}

#[test]
fn full_stack_carries_plaintext_end_to_end() {
    let scheduler = TimerScheduler::new();
    let node = build_stack(
        "DSNG",
        vec![dtls_client_parameters()],
        StackRole::Node,
        Some(paired_ip([169, 254, 0, 3], [169, 254, 0, 2])),
        &scheduler,
        None,
    )
    .unwrap();
    let hub = build_stack(
        "DSNG",
        vec![dtls_server_parameters()],
        StackRole::Hub,
        Some(paired_ip([169, 254, 0, 2], [169, 254, 0, 3])),
        &scheduler,
        None,
    )
    .unwrap();
    link_stacks(&scheduler, &node, &hub);

    let hub_rx = MemoryDataSink::new();
    hub.port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .source
        .unwrap()
        .set_data_sink(Some(hub_rx.clone() as Arc<dyn DataSink>))
        .unwrap();
    let node_rx = MemoryDataSink::new();
    node.port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .source
        .unwrap()
        .set_data_sink(Some(node_rx.clone() as Arc<dyn DataSink>))
        .unwrap();

    let node_events = Arc::new(EventRecorder::default());
    node.set_event_listener(Some(Arc::downgrade(&node_events) as Weak<dyn EventListener>));

    node.start();
    hub.start();
    // 链路握手 + DTLS 握手都在纯虚拟时间内完成。
    run_ticks(&scheduler, 80, 25);

    // node 观察到 TLS 进入会话态（state code 2）。
    let saw_session = node_events.events.lock().iter().any(|event| {
        matches!(
            &event.data,
            EventData::Forward { event, .. }
                if event.event_type == EVENT_TYPE_TLS_STATE_CHANGE
                    && event.data == EventData::TlsStateChange(2)
        )
    });
    assert!(saw_session, "DTLS 应完成握手");

    // 明文自 node 顶端口穿到 hub 顶端口。
    node.port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .sink
        .unwrap()
        .put_data(&Buffer::from_slice(b"tunnel payload"), None)
        .unwrap();
    run_ticks(&scheduler, 40, 25);
    assert_eq!(hub_rx.received_bytes(), b"tunnel payload");

    // 反向同样成立。
    hub.port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .sink
        .unwrap()
        .put_data(&Buffer::from_slice(b"downlink"), None)
        .unwrap();
    run_ticks(&scheduler, 40, 25);
    assert_eq!(node_rx.received_bytes(), b"downlink");
}

#[test]
fn stack_reset_reestablishes_the_pipeline() {
    let scheduler = TimerScheduler::new();
    let left = build_stack("G", Vec::new(), StackRole::Node, None, &scheduler, None).unwrap();
    let right = build_stack("G", Vec::new(), StackRole::Hub, None, &scheduler, None).unwrap();
    link_stacks(&scheduler, &left, &right);

    let right_rx = MemoryDataSink::new();
    right
        .port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .source
        .unwrap()
        .set_data_sink(Some(right_rx.clone() as Arc<dyn DataSink>))
        .unwrap();

    left.start();
    right.start();
    run_ticks(&scheduler, 8, 25);

    left.port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .sink
        .unwrap()
        .put_data(&Buffer::from_slice(b"first"), None)
        .unwrap();
    run_ticks(&scheduler, 8, 25);
    assert_eq!(right_rx.received_bytes(), b"first");

    // 重置保持布线：会话拆除重建后继续可用。
    left.reset();
    run_ticks(&scheduler, 80, 25);
    left.port(STACK_ELEMENT_ID_TOP, StackPortId::Top)
        .unwrap()
        .sink
        .unwrap()
        .put_data(&Buffer::from_slice(b"second"), None)
        .unwrap();
    run_ticks(&scheduler, 40, 25);
    assert!(right_rx.received_bytes().ends_with(b"second"));
}
