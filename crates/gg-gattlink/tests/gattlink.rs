//! Gattlink 端到端测试：两个端点经（可注入丢包的）异步管道互联。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use gg_core::buffer::Buffer;
use gg_core::events::{
    EVENT_TYPE_GATTLINK_SESSION_READY, EVENT_TYPE_GATTLINK_SESSION_RESET, Event, EventEmitter,
    EventListener,
};
use gg_core::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};
use gg_core::timer::TimerScheduler;
use gg_core::util::{AsyncPipe, BlasterDataSource, MemoryDataSink};
use gg_gattlink::{Gattlink, GattlinkConfig, SessionState};

/// 每第 N 个包静默丢弃的有损链路。
struct LossyLink {
    inner: Arc<dyn DataSink>,
    counter: Mutex<u32>,
    drop_every: u32,
}

impl LossyLink {
    fn new(inner: Arc<dyn DataSink>, drop_every: u32) -> Arc<Self> {
        Arc::new(Self {
            inner,
            counter: Mutex::new(0),
            drop_every,
        })
    }
}

impl DataSink for LossyLink {
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> gg_core::GgResult<()> {
        let sequence = {
            let mut counter = self.counter.lock();
            *counter += 1;
            *counter
        };
        if sequence % self.drop_every == 0 {
            // 静默丢弃：对发送方而言包已被传输"接收"。
            return Ok(());
        }
        self.inner.put_data(data, metadata)
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> gg_core::GgResult<()> {
        self.inner.set_listener(listener)
    }
}

/// 记录事件类型序列的监听器。
#[derive(Default)]
struct EventRecorder {
    events: Mutex<Vec<gg_core::FourCc>>,
}

impl EventListener for EventRecorder {
    fn on_event(&self, event: &Event) {
        self.events.lock().push(event.event_type);
    }
}

struct LinkedPair {
    scheduler: Arc<TimerScheduler>,
    a: Arc<Gattlink>,
    b: Arc<Gattlink>,
    a_rx: Arc<MemoryDataSink>,
    b_rx: Arc<MemoryDataSink>,
    a_events: Arc<EventRecorder>,
    b_events: Arc<EventRecorder>,
}

/// 组一对经异步管道互联的端点；`drop_every` 给定时两个方向都注入丢包。
fn link_pair(config: GattlinkConfig, drop_every: Option<u32>) -> LinkedPair {
    let scheduler = TimerScheduler::new();
    let a = Gattlink::new(config, &scheduler).unwrap();
    let b = Gattlink::new(config, &scheduler).unwrap();

    let pipe_ab = AsyncPipe::new(&scheduler, 64);
    let pipe_ba = AsyncPipe::new(&scheduler, 64);
    pipe_ab.set_data_sink(Some(b.transport_side_sink())).unwrap();
    pipe_ba.set_data_sink(Some(a.transport_side_sink())).unwrap();

    let a_to_b: Arc<dyn DataSink> = match drop_every {
        Some(n) => LossyLink::new(pipe_ab.clone(), n),
        None => pipe_ab.clone(),
    };
    let b_to_a: Arc<dyn DataSink> = match drop_every {
        Some(n) => LossyLink::new(pipe_ba.clone(), n),
        None => pipe_ba.clone(),
    };
    a.transport_side_source().set_data_sink(Some(a_to_b)).unwrap();
    b.transport_side_source().set_data_sink(Some(b_to_a)).unwrap();

    let a_rx = MemoryDataSink::new();
    let b_rx = MemoryDataSink::new();
    a.user_side_source()
        .set_data_sink(Some(a_rx.clone() as Arc<dyn DataSink>))
        .unwrap();
    b.user_side_source()
        .set_data_sink(Some(b_rx.clone() as Arc<dyn DataSink>))
        .unwrap();

    let a_events = Arc::new(EventRecorder::default());
    let b_events = Arc::new(EventRecorder::default());
    a.set_event_listener(Some(Arc::downgrade(&a_events) as Weak<dyn EventListener>));
    b.set_event_listener(Some(Arc::downgrade(&b_events) as Weak<dyn EventListener>));

    LinkedPair {
        scheduler,
        a,
        b,
        a_rx,
        b_rx,
        a_events,
        b_events,
    }
}

fn run_ticks(scheduler: &Arc<TimerScheduler>, ticks: u64, step: u64) {
    let start = scheduler.now();
    for tick in 1..=ticks {
        scheduler.set_time(start + tick * step);
    }
}

/// 打点数据源产生的期望字节流。
fn blaster_bytes(packet_size: usize, packets: u32) -> Vec<u8> {
    let mut expected = Vec::new();
    for counter in 0..packets {
        expected.extend_from_slice(&counter.to_be_bytes());
        for index in 4..packet_size {
            expected.push(index as u8);
        }
    }
    expected
}

#[test]
fn session_establishes_after_reset_exchange() {
    let pair = link_pair(GattlinkConfig::default(), None);
    assert_eq!(pair.a.session_state(), SessionState::Idle);
    pair.a.start();
    pair.b.start();
    run_ticks(&pair.scheduler, 8, 25);
    assert_eq!(pair.a.session_state(), SessionState::Ready);
    assert_eq!(pair.b.session_state(), SessionState::Ready);
    assert!(
        pair.a_events
            .events
            .lock()
            .contains(&EVENT_TYPE_GATTLINK_SESSION_READY)
    );
    assert!(
        pair.b_events
            .events
            .lock()
            .contains(&EVENT_TYPE_GATTLINK_SESSION_READY)
    );
}

#[test]
fn ordered_delivery_across_a_lossy_link() {
    // 窗口 4、分片 10 字节，双向各 100 字节计数数据，链路丢 1/5 的包。
    let config = GattlinkConfig {
        rx_window: 4,
        tx_window: 4,
        output_buffer_size: 256,
        initial_max_fragment_size: 10,
        probe: None,
    };
    let pair = link_pair(config, Some(5));
    pair.a.start();
    pair.b.start();
    run_ticks(&pair.scheduler, 40, 25);
    assert_eq!(pair.a.session_state(), SessionState::Ready);
    assert_eq!(pair.b.session_state(), SessionState::Ready);

    let blaster_a = BlasterDataSource::new(10, Some(10), None, None).unwrap();
    let blaster_b = BlasterDataSource::new(10, Some(10), None, None).unwrap();
    blaster_a.set_data_sink(Some(pair.a.user_side_sink())).unwrap();
    blaster_b.set_data_sink(Some(pair.b.user_side_sink())).unwrap();
    blaster_a.start().unwrap();
    blaster_b.start().unwrap();

    // 10 秒模拟时间：丢包由 500ms 重传定时器补齐。
    run_ticks(&pair.scheduler, 400, 25);

    let expected = blaster_bytes(10, 10);
    assert_eq!(pair.b_rx.received_bytes(), expected);
    assert_eq!(pair.a_rx.received_bytes(), expected);

    // 链路保持活性：没有触发会话重置。
    assert!(
        !pair
            .a_events
            .events
            .lock()
            .contains(&EVENT_TYPE_GATTLINK_SESSION_RESET)
    );
    assert!(
        !pair
            .b_events
            .events
            .lock()
            .contains(&EVENT_TYPE_GATTLINK_SESSION_RESET)
    );
}

#[test]
fn sequence_numbers_wrap_without_reordering() {
    // 50 个数据报远超 32 的序号空间，验证 mod 32 回绕后仍按序交付。
    let config = GattlinkConfig {
        rx_window: 4,
        tx_window: 4,
        output_buffer_size: 128,
        initial_max_fragment_size: 12,
        probe: None,
    };
    let pair = link_pair(config, None);
    pair.a.start();
    pair.b.start();
    run_ticks(&pair.scheduler, 8, 25);

    let blaster = BlasterDataSource::new(8, Some(50), None, None).unwrap();
    blaster.set_data_sink(Some(pair.a.user_side_sink())).unwrap();
    blaster.start().unwrap();

    run_ticks(&pair.scheduler, 600, 25);
    assert_eq!(pair.b_rx.received_bytes(), blaster_bytes(8, 50));
}

#[test]
fn peer_initiated_reset_reestablishes_the_session() {
    let pair = link_pair(GattlinkConfig::default(), None);
    pair.a.start();
    pair.b.start();
    run_ticks(&pair.scheduler, 8, 25);
    assert_eq!(pair.a.session_state(), SessionState::Ready);

    // 先交换一些数据：重复的握手"同意"与真重置由此可区分。
    pair.a
        .user_side_sink()
        .put_data(&Buffer::from_slice(b"before reset"), None)
        .unwrap();
    run_ticks(&pair.scheduler, 8, 25);
    assert_eq!(pair.b_rx.received_bytes(), b"before reset");

    // B 端丢失状态并重新发起会话。
    pair.b.reset();
    pair.b.start();
    run_ticks(&pair.scheduler, 80, 25);

    assert_eq!(pair.a.session_state(), SessionState::Ready);
    assert_eq!(pair.b.session_state(), SessionState::Ready);
    let a_events = pair.a_events.events.lock().clone();
    let reset_at = a_events
        .iter()
        .position(|tag| *tag == EVENT_TYPE_GATTLINK_SESSION_RESET);
    let ready_again = a_events
        .iter()
        .rposition(|tag| *tag == EVENT_TYPE_GATTLINK_SESSION_READY);
    assert!(reset_at.is_some(), "A 端应观察到会话重置事件");
    assert!(ready_again.unwrap() > reset_at.unwrap(), "重置之后应重新就绪");

    // 新会话可以继续交换数据。
    pair.a
        .user_side_sink()
        .put_data(&Buffer::from_slice(b"after reset"), None)
        .unwrap();
    run_ticks(&pair.scheduler, 8, 25);
    assert!(pair.b_rx.received_bytes().ends_with(b"after reset"));
}

#[test]
fn output_buffer_backpressure_resolves_as_the_window_advances() {
    // 输出缓冲远小于要发送的数据量：打点源必然被背压，但最终全部送达。
    let config = GattlinkConfig {
        rx_window: 4,
        tx_window: 4,
        output_buffer_size: 48,
        initial_max_fragment_size: 10,
        probe: None,
    };
    let pair = link_pair(config, None);
    pair.a.start();
    pair.b.start();
    run_ticks(&pair.scheduler, 8, 25);

    let blaster = BlasterDataSource::new(10, Some(20), None, None).unwrap();
    blaster.set_data_sink(Some(pair.a.user_side_sink())).unwrap();
    blaster.start().unwrap();
    assert!(blaster.packets_sent() < 20, "小缓冲应当挡住一部分包");

    run_ticks(&pair.scheduler, 400, 25);
    assert_eq!(blaster.packets_sent(), 20);
    assert_eq!(pair.b_rx.received_bytes(), blaster_bytes(10, 20));
}
