//! CoAP 端到端测试：请求响应、去重、重传、分块与事件发射。

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use gg_core::buffer::Buffer;
use gg_core::error::GgError;
use gg_core::fourcc::FourCc;
use gg_core::io::{BufferMetadata, DataSink, DataSource};
use gg_core::timer::TimerScheduler;
use gg_core::util::MemoryDataSink;
use gg_coap::blockwise::{
    CoapBlockInfo, CoapBlockSource, CoapBlockwiseResponseListener, CoapBlockwiseServerHelper,
    CoapMemoryBlockSource, send_blockwise_request,
};
use gg_coap::emitter::CoapEventEmitter;
use gg_coap::endpoint::{
    CoapClientParameters, CoapEndpoint, CoapHandlerResult, CoapRequestHandler,
    CoapRequestHandlerFlags, CoapResponder, CoapResponseListener,
};
use gg_coap::message::{
    CoapMessage, CoapMessageType, CoapMethod, CoapOption, codes, options,
};

fn client_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(169, 254, 0, 3), 49152)
}

fn server_addr() -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::new(169, 254, 0, 2), 5683)
}

/// 同步回环线：把一端发出的数据报连同 `'srca'` 元数据送进另一端。
struct Wire {
    target: Arc<CoapEndpoint>,
    sender: SocketAddrV4,
}

impl DataSink for Wire {
    fn put_data(&self, data: &Buffer, _metadata: Option<&BufferMetadata>) -> gg_core::GgResult<()> {
        let metadata = BufferMetadata::source_socket_address(self.sender);
        self.target.put_data(data, Some(&metadata))
    }
}

struct Pair {
    scheduler: Arc<TimerScheduler>,
    client: Arc<CoapEndpoint>,
    server: Arc<CoapEndpoint>,
}

fn endpoint_pair() -> Pair {
    let scheduler = TimerScheduler::new();
    let client = CoapEndpoint::new(&scheduler);
    let server = CoapEndpoint::new(&scheduler);
    client
        .set_data_sink(Some(Arc::new(Wire {
            target: Arc::clone(&server),
            sender: client_addr(),
        }) as Arc<dyn DataSink>))
        .unwrap();
    server
        .set_data_sink(Some(Arc::new(Wire {
            target: Arc::clone(&client),
            sender: server_addr(),
        }) as Arc<dyn DataSink>))
        .unwrap();
    Pair {
        scheduler,
        client,
        server,
    }
}

/// 固定响应处理器。
struct FixedHandler {
    code: u8,
    payload: &'static [u8],
}

impl CoapRequestHandler for FixedHandler {
    fn on_request(
        &self,
        _endpoint: &CoapEndpoint,
        _request: &CoapMessage,
        _metadata: Option<&BufferMetadata>,
        _responder: Option<CoapResponder>,
    ) -> CoapHandlerResult {
        let mut response = CoapMessage::new(CoapMessageType::Acknowledgement, self.code, 0);
        response.payload = Buffer::from_slice(self.payload);
        CoapHandlerResult::Response(response)
    }
}

/// 收集响应与错误的客户端监听器。
#[derive(Default)]
struct ResponseRecorder {
    responses: Mutex<Vec<CoapMessage>>,
    errors: Mutex<Vec<GgError>>,
    acks: Mutex<u32>,
}

impl CoapResponseListener for ResponseRecorder {
    fn on_ack(&self) {
        *self.acks.lock() += 1;
    }

    fn on_response(&self, response: &CoapMessage) {
        self.responses.lock().push(response.clone());
    }

    fn on_error(&self, error: GgError, _message: &str) {
        self.errors.lock().push(error);
    }
}

#[test]
fn confirmable_get_round_trips_with_piggybacked_response() {
    let pair = endpoint_pair();
    pair.server.register_request_handler(
        "hello",
        CoapRequestHandlerFlags::ALLOW_GET,
        Arc::new(FixedHandler {
            code: codes::CONTENT,
            payload: b"Hello, World",
        }),
    );

    let recorder = Arc::new(ResponseRecorder::default());
    let recorder_dyn: Arc<dyn CoapResponseListener> = recorder.clone();
    let listener: Weak<dyn CoapResponseListener> = Arc::downgrade(&recorder_dyn);
    pair.client
        .send_request(
            CoapMethod::Get,
            CoapMessageType::Confirmable,
            CoapOption::uri_path_segments("hello"),
            None,
            Some(server_addr()),
            None,
            listener,
        )
        .unwrap();

    let responses = recorder.responses.lock();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].code, codes::CONTENT);
    assert_eq!(responses[0].payload.as_slice(), b"Hello, World");
    assert_eq!(responses[0].message_type, CoapMessageType::Acknowledgement);
    // 去重缓存记录了这次应答。
    assert_eq!(pair.server.reply_cache_size(), 1);
    assert_eq!(pair.client.pending_request_count(), 0);
}

#[test]
fn method_and_path_misses_synthesize_errors() {
    let pair = endpoint_pair();
    pair.server.register_request_handler(
        "hello",
        CoapRequestHandlerFlags::ALLOW_GET,
        Arc::new(FixedHandler {
            code: codes::CONTENT,
            payload: b"",
        }),
    );

    let recorder = Arc::new(ResponseRecorder::default());
    let recorder_dyn: Arc<dyn CoapResponseListener> = recorder.clone();
    let listener: Weak<dyn CoapResponseListener> = Arc::downgrade(&recorder_dyn);
    // 未注册路径 → 4.04。
    pair.client
        .send_request(
            CoapMethod::Get,
            CoapMessageType::Confirmable,
            CoapOption::uri_path_segments("missing"),
            None,
            Some(server_addr()),
            None,
            listener.clone(),
        )
        .unwrap();
    // 方法不允许 → 4.05。
    pair.client
        .send_request(
            CoapMethod::Post,
            CoapMessageType::Confirmable,
            CoapOption::uri_path_segments("hello"),
            None,
            Some(server_addr()),
            None,
            listener,
        )
        .unwrap();

    let responses = recorder.responses.lock();
    assert_eq!(responses[0].code, codes::NOT_FOUND);
    assert_eq!(responses[1].code, codes::METHOD_NOT_ALLOWED);
}

#[test]
fn duplicate_requests_get_byte_identical_replies() {
    let scheduler = TimerScheduler::new();
    let server = CoapEndpoint::new(&scheduler);
    let sink = MemoryDataSink::new();
    server
        .set_data_sink(Some(sink.clone() as Arc<dyn DataSink>))
        .unwrap();
    server.register_request_handler(
        "hello",
        CoapRequestHandlerFlags::ALLOW_GET,
        Arc::new(FixedHandler {
            code: codes::CONTENT,
            payload: b"stable",
        }),
    );

    let mut request = CoapMessage::new(CoapMessageType::Confirmable, codes::GET, 77);
    request.token = gg_coap::message::CoapToken::new(&[9, 9]).unwrap();
    for option in CoapOption::uri_path_segments("hello") {
        request.add_option(option);
    }
    let encoded = request.encode().unwrap();
    let metadata = BufferMetadata::source_socket_address(client_addr());

    server.put_data(&encoded, Some(&metadata)).unwrap();
    let first_reply = sink.received_bytes();
    sink.clear();
    server.put_data(&encoded, Some(&metadata)).unwrap();
    let second_reply = sink.received_bytes();

    assert_eq!(first_reply, second_reply);
    assert_eq!(server.reply_cache_size(), 1);
}

#[test]
fn confirmable_requests_retransmit_then_time_out() {
    let scheduler = TimerScheduler::new();
    let client = CoapEndpoint::new(&scheduler);
    let transport = MemoryDataSink::new();
    client
        .set_data_sink(Some(transport.clone() as Arc<dyn DataSink>))
        .unwrap();

    let recorder = Arc::new(ResponseRecorder::default());
    let recorder_dyn: Arc<dyn CoapResponseListener> = recorder.clone();
    let listener: Weak<dyn CoapResponseListener> = Arc::downgrade(&recorder_dyn);
    client
        .send_request(
            CoapMethod::Get,
            CoapMessageType::Confirmable,
            CoapOption::uri_path_segments("void"),
            None,
            None,
            Some(CoapClientParameters {
                ack_timeout_ms: 1000,
                max_retransmits: Some(4),
            }),
            listener,
        )
        .unwrap();
    assert_eq!(transport.buffer_count(), 1);

    // 抖动上界 1.5 倍、每轮翻倍：按最坏情况推进时钟。
    let mut now = 0;
    for step in [1500u64, 3000, 6000, 12000] {
        now += step;
        scheduler.set_time(now);
    }
    // 初始发送 + 4 次重传。
    assert_eq!(transport.buffer_count(), 5);
    assert!(recorder.responses.lock().is_empty());

    // 最后一轮超时后宣告失败。
    now += 24000;
    scheduler.set_time(now);
    assert_eq!(*recorder.errors.lock(), vec![GgError::Timeout]);
    assert_eq!(client.pending_request_count(), 0);
}

#[test]
fn async_handlers_ack_then_respond_separately() {
    struct AsyncHandler {
        responder: Mutex<Option<CoapResponder>>,
    }
    impl CoapRequestHandler for AsyncHandler {
        fn on_request(
            &self,
            _endpoint: &CoapEndpoint,
            _request: &CoapMessage,
            _metadata: Option<&BufferMetadata>,
            responder: Option<CoapResponder>,
        ) -> CoapHandlerResult {
            *self.responder.lock() = responder;
            CoapHandlerResult::Async
        }
    }

    let pair = endpoint_pair();
    let handler = Arc::new(AsyncHandler {
        responder: Mutex::new(None),
    });
    pair.server.register_request_handler(
        "slow",
        CoapRequestHandlerFlags::ALLOW_GET | CoapRequestHandlerFlags::ENABLE_ASYNC,
        handler.clone(),
    );

    let recorder = Arc::new(ResponseRecorder::default());
    let recorder_dyn: Arc<dyn CoapResponseListener> = recorder.clone();
    let listener: Weak<dyn CoapResponseListener> = Arc::downgrade(&recorder_dyn);
    pair.client
        .send_request(
            CoapMethod::Get,
            CoapMessageType::Confirmable,
            CoapOption::uri_path_segments("slow"),
            None,
            Some(server_addr()),
            None,
            listener,
        )
        .unwrap();

    // 先收到空 ACK，请求保持挂起。
    assert_eq!(*recorder.acks.lock(), 1);
    assert!(recorder.responses.lock().is_empty());
    assert_eq!(pair.client.pending_request_count(), 1);

    // 处理器稍后经 responder 作答。
    let responder = handler.responder.lock().take().unwrap();
    let mut response = CoapMessage::new(CoapMessageType::NonConfirmable, codes::CONTENT, 0);
    response.payload = Buffer::from_slice(b"eventually");
    responder.send_response(response).unwrap();

    let responses = recorder.responses.lock();
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].payload.as_slice(), b"eventually");
    assert_eq!(pair.client.pending_request_count(), 0);
}

// ----------------------------------------------------------------------
// 分块传输
// ----------------------------------------------------------------------

/// 以服务端助手累积 PUT/POST 负载的处理器。
struct AccumulatingHandler {
    helper: CoapBlockwiseServerHelper,
    received: Mutex<Vec<u8>>,
    blocks: Mutex<Vec<CoapBlockInfo>>,
}

impl CoapRequestHandler for AccumulatingHandler {
    fn on_request(
        &self,
        _endpoint: &CoapEndpoint,
        request: &CoapMessage,
        _metadata: Option<&BufferMetadata>,
        _responder: Option<CoapResponder>,
    ) -> CoapHandlerResult {
        let resent = match self.helper.on_request(request) {
            Ok(resent) => resent,
            Err(GgError::CoapResponse(code)) => return CoapHandlerResult::Error(code),
            Err(_) => return CoapHandlerResult::Error(codes::INTERNAL_SERVER_ERROR),
        };
        let block = self.helper.block_info();
        if !resent {
            self.received
                .lock()
                .extend_from_slice(request.payload.as_slice());
            self.blocks.lock().push(block);
        }
        let code = if block.more {
            codes::CONTINUE
        } else {
            codes::CHANGED
        };
        CoapHandlerResult::Response(self.helper.create_response(code))
    }
}

#[derive(Default)]
struct BlockRecorder {
    blocks: Mutex<Vec<(CoapBlockInfo, Vec<u8>)>>,
    errors: Mutex<Vec<GgError>>,
}

impl CoapBlockwiseResponseListener for BlockRecorder {
    fn on_response_block(&self, block_info: &CoapBlockInfo, message: &CoapMessage) {
        self.blocks
            .lock()
            .push((*block_info, message.payload.as_slice().to_vec()));
    }

    fn on_error(&self, error: GgError, _message: &str) {
        self.errors.lock().push(error);
    }
}

fn repeating_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|index| b'A' + (index % 7) as u8).collect()
}

#[test]
fn blockwise_post_uploads_1500_bytes_in_256_byte_blocks() {
    let pair = endpoint_pair();
    let handler = Arc::new(AccumulatingHandler {
        helper: CoapBlockwiseServerHelper::new(),
        received: Mutex::new(Vec::new()),
        blocks: Mutex::new(Vec::new()),
    });
    pair.server.register_request_handler(
        "large-post",
        CoapRequestHandlerFlags::ALLOW_POST,
        handler.clone(),
    );

    let payload = repeating_pattern(1500);
    let source: Arc<dyn CoapBlockSource> = Arc::new(CoapMemoryBlockSource::new(
        Buffer::from_vec(payload.clone()),
    ));
    let recorder = Arc::new(BlockRecorder::default());
    let recorder_dyn: Arc<dyn CoapBlockwiseResponseListener> = recorder.clone();
    let listener: Weak<dyn CoapBlockwiseResponseListener> = Arc::downgrade(&recorder_dyn);
    let _request = send_blockwise_request(
        &pair.client,
        CoapMethod::Post,
        CoapOption::uri_path_segments("large-post"),
        Some(source),
        256,
        Some(server_addr()),
        listener,
    )
    .unwrap();

    // 服务端逐块收齐 1500 字节，模式一致。
    assert_eq!(*handler.received.lock(), payload);
    // 恰好 6 个请求块：前 5 块 more=1，末块 more=0。
    let blocks = handler.blocks.lock();
    assert_eq!(blocks.len(), 6);
    for (index, block) in blocks.iter().enumerate() {
        assert_eq!(block.offset, index * 256);
        assert_eq!(block.size, 256);
        assert_eq!(block.more, index < 5);
    }
    // 客户端只看到最终的 2.04。
    assert!(recorder.errors.lock().is_empty());
    let client_blocks = recorder.blocks.lock();
    assert_eq!(client_blocks.len(), 1);
    assert!(!client_blocks[0].0.more);
}

/// 按 Block2 切片下发大负载的 GET 处理器。
struct BlockServingHandler {
    source: CoapMemoryBlockSource,
}

impl CoapRequestHandler for BlockServingHandler {
    fn on_request(
        &self,
        _endpoint: &CoapEndpoint,
        request: &CoapMessage,
        _metadata: Option<&BufferMetadata>,
        _responder: Option<CoapResponder>,
    ) -> CoapHandlerResult {
        let requested = request
            .uint_option(options::BLOCK2)
            .and_then(|value| CoapBlockInfo::from_option_value(value).ok())
            .unwrap_or(CoapBlockInfo {
                offset: 0,
                size: 256,
                more: false,
            });
        let (size, more) = match self.source.get_data_size(requested.offset, requested.size) {
            Ok(result) => result,
            Err(_) => return CoapHandlerResult::Error(codes::BAD_REQUEST),
        };
        let mut data = vec![0u8; size];
        if self.source.get_data(requested.offset, size, &mut data).is_err() {
            return CoapHandlerResult::Error(codes::INTERNAL_SERVER_ERROR);
        }
        let block2 = CoapBlockInfo {
            offset: requested.offset,
            size: requested.size,
            more,
        };
        let Ok(value) = block2.to_option_value() else {
            return CoapHandlerResult::Error(codes::INTERNAL_SERVER_ERROR);
        };
        let mut response = CoapMessage::new(CoapMessageType::Acknowledgement, codes::CONTENT, 0);
        response.add_option(CoapOption::uint(options::BLOCK2, value));
        response.payload = Buffer::from_vec(data);
        CoapHandlerResult::Response(response)
    }
}

#[test]
fn blockwise_get_downloads_until_more_is_clear() {
    let pair = endpoint_pair();
    let payload = repeating_pattern(1000);
    pair.server.register_request_handler(
        "large",
        CoapRequestHandlerFlags::ALLOW_GET,
        Arc::new(BlockServingHandler {
            source: CoapMemoryBlockSource::new(Buffer::from_vec(payload.clone())),
        }),
    );

    let recorder = Arc::new(BlockRecorder::default());
    let recorder_dyn: Arc<dyn CoapBlockwiseResponseListener> = recorder.clone();
    let listener: Weak<dyn CoapBlockwiseResponseListener> = Arc::downgrade(&recorder_dyn);
    let _request = send_blockwise_request(
        &pair.client,
        CoapMethod::Get,
        CoapOption::uri_path_segments("large"),
        None,
        256,
        Some(server_addr()),
        listener,
    )
    .unwrap();

    let blocks = recorder.blocks.lock();
    assert_eq!(blocks.len(), 4);
    let mut aggregated = Vec::new();
    for (_, bytes) in blocks.iter() {
        aggregated.extend_from_slice(bytes);
    }
    assert_eq!(aggregated, payload);
    assert!(blocks.last().is_some_and(|(info, _)| !info.more));
}

// ----------------------------------------------------------------------
// 事件发射器
// ----------------------------------------------------------------------

/// 记录事件上报的处理器：解出 protobuf 字段 #1 的 varint 列表。
struct EventSinkHandler {
    batches: Mutex<Vec<Vec<u32>>>,
    response_code: Mutex<u8>,
}

impl CoapRequestHandler for EventSinkHandler {
    fn on_request(
        &self,
        _endpoint: &CoapEndpoint,
        request: &CoapMessage,
        _metadata: Option<&BufferMetadata>,
        _responder: Option<CoapResponder>,
    ) -> CoapHandlerResult {
        let mut events = Vec::new();
        let raw = request.payload.as_slice();
        let mut cursor = 0;
        while cursor < raw.len() && raw[cursor] == 0x08 {
            cursor += 1;
            let mut value: u64 = 0;
            let mut shift = 0;
            while cursor < raw.len() {
                let byte = raw[cursor];
                cursor += 1;
                value |= u64::from(byte & 0x7F) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            events.push(value as u32);
        }
        self.batches.lock().push(events);
        CoapHandlerResult::Error(*self.response_code.lock())
    }
}

#[test]
fn emitter_batches_events_by_latency_deadline() {
    let pair = endpoint_pair();
    let handler = Arc::new(EventSinkHandler {
        batches: Mutex::new(Vec::new()),
        response_code: Mutex::new(codes::CHANGED),
    });
    pair.server.register_request_handler(
        "events",
        CoapRequestHandlerFlags::ALLOW_POST,
        handler.clone(),
    );

    let emitter = CoapEventEmitter::new(&pair.client, "events", &pair.scheduler, 4, 0, 0);
    let evt0 = FourCc::new(*b"evt0");
    let evt1 = FourCc::new(*b"evt1");
    emitter.set_event(evt0, 1000).unwrap();
    emitter.set_event(evt1, 2000).unwrap();

    // t=500：还没到任何截止时间，不发请求。
    pair.scheduler.set_time(500);
    assert!(handler.batches.lock().is_empty());
    assert!(emitter.event_is_set(evt0));

    // t=1500：恰好一个 POST，带上两个事件；2.04 把两者都清除。
    pair.scheduler.set_time(1500);
    {
        let batches = handler.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].contains(&evt0.as_u32()));
        assert!(batches[0].contains(&evt1.as_u32()));
    }
    assert!(!emitter.event_is_set(evt0));
    assert!(!emitter.event_is_set(evt1));
}

#[test]
fn emitter_capacity_and_unset_semantics() {
    let pair = endpoint_pair();
    let emitter = CoapEventEmitter::new(&pair.client, "events", &pair.scheduler, 2, 0, 0);
    emitter.set_event(FourCc::new(*b"aaaa"), 10_000).unwrap();
    emitter.set_event(FourCc::new(*b"bbbb"), 10_000).unwrap();
    // 重复置位合并，不占新槽位。
    emitter.set_event(FourCc::new(*b"aaaa"), 5_000).unwrap();
    assert_eq!(
        emitter.set_event(FourCc::new(*b"cccc"), 10_000),
        Err(GgError::OutOfResources)
    );
    // 撤销后槽位可复用；撤销不存在的事件报 NoSuchItem。
    emitter.unset_event(FourCc::new(*b"aaaa")).unwrap();
    assert_eq!(
        emitter.unset_event(FourCc::new(*b"zzzz")),
        Err(GgError::NoSuchItem)
    );
    emitter.set_event(FourCc::new(*b"cccc"), 10_000).unwrap();
}

#[test]
fn emitter_retries_after_server_errors_and_clears_on_client_errors() {
    let pair = endpoint_pair();
    let handler = Arc::new(EventSinkHandler {
        batches: Mutex::new(Vec::new()),
        response_code: Mutex::new(codes::SERVICE_UNAVAILABLE),
    });
    pair.server.register_request_handler(
        "events",
        CoapRequestHandlerFlags::ALLOW_POST,
        handler.clone(),
    );

    let emitter = CoapEventEmitter::new(&pair.client, "events", &pair.scheduler, 4, 0, 1000);
    let evt = FourCc::new(*b"evt0");
    emitter.set_event(evt, 0).unwrap();

    // 5.03：事件保持置位，重试延迟后再冲。
    assert_eq!(handler.batches.lock().len(), 1);
    assert!(emitter.event_is_set(evt));
    pair.scheduler.set_time(1000);
    assert_eq!(handler.batches.lock().len(), 2);
    assert!(emitter.event_is_set(evt));

    // 4.xx：清除并不再重试。
    *handler.response_code.lock() = codes::BAD_REQUEST;
    pair.scheduler.set_time(2000);
    assert_eq!(handler.batches.lock().len(), 3);
    assert!(!emitter.event_is_set(evt));
    pair.scheduler.set_time(10_000);
    assert_eq!(handler.batches.lock().len(), 3);
}

#[test]
fn token_prefix_matching_compares_leading_bytes() {
    let scheduler = TimerScheduler::new();
    let endpoint = CoapEndpoint::new(&scheduler);
    endpoint.set_token_prefix(&[0xAB, 0xCD]).unwrap();
    assert!(endpoint.token_matches_prefix(&[0xAB, 0xCD, 1, 2, 3, 4]));
    assert!(endpoint.token_matches_prefix(&[0xAB, 0xCD]));
    assert!(!endpoint.token_matches_prefix(&[0xAB]));
    assert!(!endpoint.token_matches_prefix(&[0xAB, 0xCE, 1, 2]));
    assert!(endpoint.set_token_prefix(&[0u8; 5]).is_err());
}
