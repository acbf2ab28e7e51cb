//! CoAP 端点：同一对象上的客户端与服务端。
//!
//! # 教案目的（Why）
//! - 客户端侧：CON 请求带抖动的确认超时与指数翻倍的重传；token 关联
//!   响应，报文 ID 关联确认；
//! - 服务端侧：以 (来源, 报文 ID) 为键的去重缓存保证"同一请求收两次，
//!   回出去的字节逐位相同"；路径按"最长已注册前缀"路由；处理器同步
//!   返回响应（捎带 ACK），或声明异步后经 responder 单独作答。
//!
//! # 并发纪律（How）
//! - 处理器回调、监听器回调、下游 `put_data` 都在端点锁之外发起；
//!   处理器里再发请求、再写响应不会自死锁。

use std::collections::VecDeque;
use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};

use bitflags::bitflags;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};
use gg_core::io::{BufferMetadata, DataSink, DataSource};
use gg_core::timer::{Timer, TimerId, TimerListener, TimerScheduler};

use crate::message::{
    COAP_VERSION, CoapMessage, CoapMessageType, CoapMethod, CoapOption, CoapToken, codes,
};

/// 确认超时缺省值（毫秒），实际值带 [1.0, 1.5) 的随机抖动。
pub const COAP_DEFAULT_ACK_TIMEOUT_MS: u64 = 2000;
/// 最大重传次数缺省值。
pub const COAP_DEFAULT_MAX_RETRANSMITS: u32 = 4;
/// 交换生存期（毫秒）：去重缓存条目与单独响应的等待上限。
pub const COAP_EXCHANGE_LIFETIME_MS: u64 = 247_000;
/// 去重缓存容量；溢出时逐出最旧条目。
const REPLY_CACHE_CAPACITY: usize = 32;
/// token 前缀最大长度（前缀 + 4 字节计数 ≤ 8）。
const MAX_TOKEN_PREFIX_LENGTH: usize = 4;

bitflags! {
    /// 请求处理器注册旗标：允许的方法集合与异步能力。
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CoapRequestHandlerFlags: u32 {
        /// 允许 GET。
        const ALLOW_GET = 0x01;
        /// 允许 POST。
        const ALLOW_POST = 0x02;
        /// 允许 PUT。
        const ALLOW_PUT = 0x04;
        /// 允许 DELETE。
        const ALLOW_DELETE = 0x08;
        /// 允许处理器返回 `Async` 并经 responder 单独作答。
        const ENABLE_ASYNC = 0x10;
        /// 全部方法。
        const ALLOW_ALL = 0x0F;
    }
}

impl CoapRequestHandlerFlags {
    fn allows(self, method: CoapMethod) -> bool {
        let required = match method {
            CoapMethod::Get => Self::ALLOW_GET,
            CoapMethod::Post => Self::ALLOW_POST,
            CoapMethod::Put => Self::ALLOW_PUT,
            CoapMethod::Delete => Self::ALLOW_DELETE,
        };
        self.contains(required)
    }
}

/// 客户端请求参数；`None` 字段取协议缺省。
#[derive(Debug, Clone, Copy, Default)]
pub struct CoapClientParameters {
    /// 首次确认超时（毫秒）；0 取缺省值。
    pub ack_timeout_ms: u64,
    /// 最大重传次数；仅对 CON 请求有意义。
    pub max_retransmits: Option<u32>,
}

/// 挂起请求的不透明句柄（用于取消）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapRequestHandle(u64);

/// 客户端响应监听器。
pub trait CoapResponseListener: Send + Sync {
    /// 收到对请求的空 ACK（响应将单独到来）。
    fn on_ack(&self) {}

    /// 收到最终响应。
    fn on_response(&self, response: &CoapMessage);

    /// 请求失败（超时、被对端 RST 等）。
    fn on_error(&self, error: GgError, message: &str);
}

/// 处理器的三种结果。
pub enum CoapHandlerResult {
    /// 同步响应：作为捎带 ACK 发回。
    Response(CoapMessage),
    /// 以给定错误响应码（4.xx/5.xx）合成响应。
    Error(u8),
    /// 先回空 ACK，稍后经 responder 单独作答（注册需带 ENABLE_ASYNC）。
    Async,
}

/// 服务端请求处理器。
pub trait CoapRequestHandler: Send + Sync {
    /// 处理一个入站请求。
    ///
    /// `responder` 仅在注册带 ENABLE_ASYNC 时提供；返回
    /// [`CoapHandlerResult::Async`] 的处理器必须持有它以便稍后作答。
    fn on_request(
        &self,
        endpoint: &CoapEndpoint,
        request: &CoapMessage,
        metadata: Option<&BufferMetadata>,
        responder: Option<CoapResponder>,
    ) -> CoapHandlerResult;
}

/// 异步作答句柄。
#[derive(Clone)]
pub struct CoapResponder {
    endpoint: Weak<CoapEndpoint>,
    peer: Option<SocketAddrV4>,
    token: CoapToken,
}

impl CoapResponder {
    /// 发出单独响应（NON；token 沿用原请求）。
    pub fn send_response(&self, mut response: CoapMessage) -> GgResult<()> {
        let endpoint = self.endpoint.upgrade().ok_or(GgError::InvalidState)?;
        response.message_type = CoapMessageType::NonConfirmable;
        response.message_id = endpoint.allocate_message_id();
        response.token = self.token;
        endpoint.send_message(&response, self.peer)
    }
}

struct HandlerEntry {
    path: String,
    flags: CoapRequestHandlerFlags,
    handler: Arc<dyn CoapRequestHandler>,
}

struct PendingRequest {
    handle: CoapRequestHandle,
    token: CoapToken,
    message_id: u16,
    destination: Option<SocketAddrV4>,
    listener: Weak<dyn CoapResponseListener>,
    encoded: Buffer,
    retransmits_left: u32,
    timeout_ms: u64,
    acknowledged: bool,
    timer: Timer,
}

struct CachedReply {
    peer: Option<SocketAddrV4>,
    message_id: u16,
    reply: Buffer,
    cached_at: u64,
}

struct EndpointState {
    next_message_id: u16,
    token_counter: u32,
    next_handle: u64,
    pending: Vec<PendingRequest>,
    reply_cache: VecDeque<CachedReply>,
}

struct EndpointTimerRelay {
    endpoint: Mutex<Weak<CoapEndpoint>>,
}

impl TimerListener for EndpointTimerRelay {
    fn on_timer_fired(&self, timer_id: TimerId, _elapsed: u64) {
        if let Some(endpoint) = self.endpoint.lock().upgrade() {
            endpoint.on_request_timer(timer_id);
        }
    }
}

/// CoAP 端点。
///
/// 作为 [`DataSink`] 接收来自下层的数据报（响应与请求都从这里进来），
/// 作为 [`DataSource`] 连接发送数据报的下层 sink。
pub struct CoapEndpoint {
    scheduler: Arc<TimerScheduler>,
    state: Mutex<EndpointState>,
    connection_sink: Mutex<Option<Arc<dyn DataSink>>>,
    handlers: Mutex<Vec<HandlerEntry>>,
    default_handler: Mutex<Option<Arc<dyn CoapRequestHandler>>>,
    token_prefix: Mutex<Vec<u8>>,
    timer_relay: Arc<EndpointTimerRelay>,
    weak_self: Weak<CoapEndpoint>,
}

impl CoapEndpoint {
    /// 构造端点；报文 ID 与 token 计数随机初始化。
    #[must_use]
    pub fn new(scheduler: &Arc<TimerScheduler>) -> Arc<Self> {
        let timer_relay = Arc::new(EndpointTimerRelay {
            endpoint: Mutex::new(Weak::new()),
        });
        let endpoint = Arc::new_cyclic(|weak_self| Self {
            scheduler: Arc::clone(scheduler),
            state: Mutex::new(EndpointState {
                next_message_id: rand::thread_rng().r#gen(),
                token_counter: rand::thread_rng().r#gen(),
                next_handle: 1,
                pending: Vec::new(),
                reply_cache: VecDeque::new(),
            }),
            connection_sink: Mutex::new(None),
            handlers: Mutex::new(Vec::new()),
            default_handler: Mutex::new(None),
            token_prefix: Mutex::new(Vec::new()),
            timer_relay: Arc::clone(&timer_relay),
            weak_self: weak_self.clone(),
        });
        *timer_relay.endpoint.lock() = Arc::downgrade(&endpoint);
        endpoint
    }

    /// 设置 token 前缀（最多 4 字节）；用于多端点分流时的响应归属判定。
    pub fn set_token_prefix(&self, prefix: &[u8]) -> GgResult<()> {
        if prefix.len() > MAX_TOKEN_PREFIX_LENGTH {
            return Err(GgError::InvalidParameters);
        }
        *self.token_prefix.lock() = prefix.to_vec();
        Ok(())
    }

    /// 前缀归属判定：token 的前缀字节与配置前缀逐字节相等。
    ///
    /// 规则固定为"只比较前缀长度的起始字节"：本端点生成的 token 都是
    /// 前缀加计数，前缀是其中唯一稳定的部分。
    #[must_use]
    pub fn token_matches_prefix(&self, token: &[u8]) -> bool {
        let prefix = self.token_prefix.lock();
        token.len() >= prefix.len() && token[..prefix.len()] == prefix[..]
    }

    /// 注册路径处理器；同一路径重复注册时覆盖旧注册。
    pub fn register_request_handler(
        &self,
        path: &str,
        flags: CoapRequestHandlerFlags,
        handler: Arc<dyn CoapRequestHandler>,
    ) {
        let path = path.trim_matches('/').to_owned();
        let mut handlers = self.handlers.lock();
        handlers.retain(|entry| entry.path != path);
        handlers.push(HandlerEntry {
            path,
            flags,
            handler,
        });
    }

    /// 注销路径处理器。
    pub fn unregister_request_handler(&self, path: &str) -> GgResult<()> {
        let path = path.trim_matches('/');
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|entry| entry.path != path);
        if handlers.len() == before {
            return Err(GgError::NoSuchItem);
        }
        Ok(())
    }

    /// 设置兜底处理器（没有路径命中时调用）。
    pub fn set_default_handler(&self, handler: Option<Arc<dyn CoapRequestHandler>>) {
        *self.default_handler.lock() = handler;
    }

    /// 发起请求。
    ///
    /// # 契约
    /// - `message_type` 只接受 CON 或 NON；
    /// - CON 请求按（抖动的）确认超时重传，超过最大次数后以
    ///   `Timeout` 通知监听器；
    /// - 返回的句柄可用于 [`cancel_request`](Self::cancel_request)；
    ///   监听器存储归调用方所有，挂起期间必须保持存活。
    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        &self,
        method: CoapMethod,
        message_type: CoapMessageType,
        options: Vec<CoapOption>,
        payload: Option<Buffer>,
        destination: Option<SocketAddrV4>,
        parameters: Option<CoapClientParameters>,
        listener: Weak<dyn CoapResponseListener>,
    ) -> GgResult<CoapRequestHandle> {
        if !matches!(
            message_type,
            CoapMessageType::Confirmable | CoapMessageType::NonConfirmable
        ) {
            return Err(GgError::InvalidParameters);
        }
        let parameters = parameters.unwrap_or_default();
        let base_timeout = if parameters.ack_timeout_ms == 0 {
            COAP_DEFAULT_ACK_TIMEOUT_MS
        } else {
            parameters.ack_timeout_ms
        };
        let max_retransmits = parameters
            .max_retransmits
            .unwrap_or(COAP_DEFAULT_MAX_RETRANSMITS);

        let (message_id, token, handle) = {
            let mut state = self.state.lock();
            let message_id = state.next_message_id;
            state.next_message_id = state.next_message_id.wrapping_add(1);
            let counter = state.token_counter;
            state.token_counter = state.token_counter.wrapping_add(1);
            let mut token_bytes = self.token_prefix.lock().clone();
            token_bytes.extend_from_slice(&counter.to_be_bytes());
            let handle = CoapRequestHandle(state.next_handle);
            state.next_handle += 1;
            (message_id, CoapToken::new(&token_bytes)?, handle)
        };

        let mut message = CoapMessage::new(message_type, method.as_code(), message_id);
        message.token = token;
        for option in options {
            message.add_option(option);
        }
        if let Some(payload) = payload {
            message.payload = payload;
        }
        let encoded = message.encode()?;

        // 先登记挂起记录再发送：响应可能在发送调用返回之前就同步到达。
        let timeout_ms = base_timeout + rand::thread_rng().gen_range(0..=base_timeout / 2);
        let timer = self.scheduler.create_timer();
        let timer_relay_dyn: Arc<dyn TimerListener> = self.timer_relay.clone();
        let relay: Weak<dyn TimerListener> = Arc::downgrade(&timer_relay_dyn);
        let (retransmits_left, first_delay) = match message_type {
            CoapMessageType::Confirmable => (max_retransmits, timeout_ms),
            // NON 没有确认；只留一个响应等待上限。
            _ => (0, COAP_EXCHANGE_LIFETIME_MS),
        };
        timer.schedule(relay, first_delay)?;
        self.state.lock().pending.push(PendingRequest {
            handle,
            token,
            message_id,
            destination,
            listener,
            encoded: encoded.clone(),
            retransmits_left,
            timeout_ms,
            acknowledged: message_type != CoapMessageType::Confirmable,
            timer,
        });
        if let Err(error) = self.send_encoded(&encoded, destination) {
            // 发送失败：撤销登记，所有权回到调用方。
            let mut state = self.state.lock();
            state.pending.retain(|pending| pending.handle != handle);
            return Err(error);
        }
        Ok(handle)
    }

    /// 取消挂起请求；释放其监听器引用并取消定时器。
    pub fn cancel_request(&self, handle: CoapRequestHandle) -> GgResult<()> {
        let mut state = self.state.lock();
        let before = state.pending.len();
        state.pending.retain(|pending| pending.handle != handle);
        if state.pending.len() == before {
            return Err(GgError::NoSuchItem);
        }
        Ok(())
    }

    /// 当前挂起的客户端请求数。
    #[must_use]
    pub fn pending_request_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// 去重缓存中的条目数（测试观察口）。
    #[must_use]
    pub fn reply_cache_size(&self) -> usize {
        self.state.lock().reply_cache.len()
    }

    pub(crate) fn allocate_message_id(&self) -> u16 {
        let mut state = self.state.lock();
        let message_id = state.next_message_id;
        state.next_message_id = state.next_message_id.wrapping_add(1);
        message_id
    }

    pub(crate) fn send_message(
        &self,
        message: &CoapMessage,
        destination: Option<SocketAddrV4>,
    ) -> GgResult<()> {
        let encoded = message.encode()?;
        self.send_encoded(&encoded, destination)
    }

    fn send_encoded(&self, encoded: &Buffer, destination: Option<SocketAddrV4>) -> GgResult<()> {
        let Some(sink) = self.connection_sink.lock().clone() else {
            return Err(GgError::InvalidState);
        };
        let metadata = destination.map(BufferMetadata::destination_socket_address);
        sink.put_data(encoded, metadata.as_ref())
    }

    // ------------------------------------------------------------------
    // 客户端：重传与响应归队
    // ------------------------------------------------------------------

    fn on_request_timer(&self, timer_id: TimerId) {
        enum TimerAction {
            Resend {
                encoded: Buffer,
                destination: Option<SocketAddrV4>,
            },
            Fail(Weak<dyn CoapResponseListener>),
        }

        let action = {
            let mut state = self.state.lock();
            let Some(index) = state
                .pending
                .iter()
                .position(|pending| pending.timer.id() == timer_id)
            else {
                return;
            };
            let pending = &mut state.pending[index];
            if !pending.acknowledged && pending.retransmits_left > 0 {
                pending.retransmits_left -= 1;
                // 每次重传超时翻倍。
                pending.timeout_ms *= 2;
                let timer_relay_dyn: Arc<dyn TimerListener> = self.timer_relay.clone();
                let relay: Weak<dyn TimerListener> = Arc::downgrade(&timer_relay_dyn);
                let _ = pending.timer.schedule(relay, pending.timeout_ms);
                TimerAction::Resend {
                    encoded: pending.encoded.clone(),
                    destination: pending.destination,
                }
            } else {
                let pending = state.pending.remove(index);
                TimerAction::Fail(pending.listener)
            }
        };
        match action {
            TimerAction::Resend {
                encoded,
                destination,
            } => {
                debug!("retransmitting confirmable request");
                if let Err(error) = self.send_encoded(&encoded, destination) {
                    // 发不出去就等下一个超时；重传本身不产生失败。
                    debug!(code = error.raw_code(), "retransmission deferred");
                }
            }
            TimerAction::Fail(listener) => {
                info!("coap request timed out");
                if let Some(listener) = listener.upgrade() {
                    listener.on_error(GgError::Timeout, "request timed out");
                }
            }
        }
    }

    fn handle_response(&self, message: &CoapMessage, source: Option<SocketAddrV4>) {
        // 空 ACK：请求已被对端收下，最终响应将单独到来。
        if message.message_type == CoapMessageType::Acknowledgement && message.code == codes::EMPTY
        {
            let listener = {
                let mut state = self.state.lock();
                state
                    .pending
                    .iter_mut()
                    .find(|pending| pending.message_id == message.message_id)
                    .map(|pending| {
                        pending.acknowledged = true;
                        let timer_relay_dyn: Arc<dyn TimerListener> = self.timer_relay.clone();
                        let relay: Weak<dyn TimerListener> = Arc::downgrade(&timer_relay_dyn);
                        let _ = pending.timer.schedule(relay, COAP_EXCHANGE_LIFETIME_MS);
                        pending.listener.clone()
                    })
            };
            if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
                listener.on_ack();
            }
            return;
        }

        // RST：对端拒绝了请求。
        if message.message_type == CoapMessageType::Reset {
            let listener = {
                let mut state = self.state.lock();
                state
                    .pending
                    .iter()
                    .position(|pending| pending.message_id == message.message_id)
                    .map(|index| state.pending.remove(index).listener)
            };
            if let Some(listener) = listener.and_then(|weak| weak.upgrade()) {
                listener.on_error(GgError::ConnectionReset, "request rejected by peer");
            }
            return;
        }

        // 最终响应：按 token 关联。
        let listener = {
            let mut state = self.state.lock();
            state
                .pending
                .iter()
                .position(|pending| pending.token == message.token)
                .map(|index| state.pending.remove(index).listener)
        };
        match listener {
            Some(listener) => {
                // 单独的 CON 响应需要回空 ACK。
                if message.message_type == CoapMessageType::Confirmable {
                    let ack = CoapMessage::new(
                        CoapMessageType::Acknowledgement,
                        codes::EMPTY,
                        message.message_id,
                    );
                    if let Err(error) = self.send_message(&ack, source) {
                        debug!(code = error.raw_code(), "failed to ack separate response");
                    }
                }
                if let Some(listener) = listener.upgrade() {
                    listener.on_response(message);
                }
            }
            None => {
                debug!(message_id = message.message_id, "response without a pending request");
                if message.message_type == CoapMessageType::Confirmable {
                    let reset = CoapMessage::new(
                        CoapMessageType::Reset,
                        codes::EMPTY,
                        message.message_id,
                    );
                    let _ = self.send_message(&reset, source);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // 服务端：去重、路由、作答
    // ------------------------------------------------------------------

    fn handle_request(
        &self,
        request: &CoapMessage,
        source: Option<SocketAddrV4>,
        metadata: Option<&BufferMetadata>,
    ) {
        // 去重：同一 (来源, 报文 ID) 在交换生存期内重来，原样重发缓存的响应。
        let cached = {
            let now = self.scheduler.now();
            let mut state = self.state.lock();
            while let Some(front) = state.reply_cache.front() {
                if front.cached_at + COAP_EXCHANGE_LIFETIME_MS <= now {
                    state.reply_cache.pop_front();
                } else {
                    break;
                }
            }
            state
                .reply_cache
                .iter()
                .find(|entry| entry.peer == source && entry.message_id == request.message_id)
                .map(|entry| entry.reply.clone())
        };
        if let Some(reply) = cached {
            debug!(message_id = request.message_id, "duplicate request, resending cached reply");
            if let Err(error) = self.send_encoded(&reply, source) {
                debug!(code = error.raw_code(), "failed to resend cached reply");
            }
            return;
        }

        // 路由：最长已注册路径前缀命中。
        let path = request.uri_path();
        let matched = {
            let handlers = self.handlers.lock();
            handlers
                .iter()
                .filter(|entry| {
                    path == entry.path
                        || entry.path.is_empty()
                        || (path.starts_with(&entry.path)
                            && path.as_bytes().get(entry.path.len()) == Some(&b'/'))
                })
                .max_by_key(|entry| entry.path.len())
                .map(|entry| (entry.flags, Arc::clone(&entry.handler)))
        };
        let (flags, handler) = match matched {
            Some(found) => found,
            None => match self.default_handler.lock().clone() {
                Some(handler) => (
                    CoapRequestHandlerFlags::ALLOW_ALL | CoapRequestHandlerFlags::ENABLE_ASYNC,
                    handler,
                ),
                None => {
                    self.respond_with_code(request, source, codes::NOT_FOUND);
                    return;
                }
            },
        };

        // 方法检查。
        let Some(method) = CoapMethod::from_code(request.code) else {
            self.respond_with_code(request, source, codes::METHOD_NOT_ALLOWED);
            return;
        };
        if !flags.allows(method) {
            self.respond_with_code(request, source, codes::METHOD_NOT_ALLOWED);
            return;
        }

        // 调用处理器（锁外）。
        let responder = flags.contains(CoapRequestHandlerFlags::ENABLE_ASYNC).then(|| {
            CoapResponder {
                endpoint: self.weak_self.clone(),
                peer: source,
                token: request.token,
            }
        });
        match handler.on_request(self, request, metadata, responder) {
            CoapHandlerResult::Response(response) => {
                self.send_reply(request, source, response);
            }
            CoapHandlerResult::Error(code) => {
                self.respond_with_code(request, source, code);
            }
            CoapHandlerResult::Async => {
                if flags.contains(CoapRequestHandlerFlags::ENABLE_ASYNC) {
                    // 先回空 ACK；最终响应由处理器经 responder 单独发出。
                    if request.message_type == CoapMessageType::Confirmable {
                        let ack = CoapMessage::new(
                            CoapMessageType::Acknowledgement,
                            codes::EMPTY,
                            request.message_id,
                        );
                        self.cache_and_send_reply(request, source, &ack);
                    }
                } else {
                    warn!("handler returned Async without ENABLE_ASYNC, synthesizing 5.00");
                    self.respond_with_code(request, source, codes::INTERNAL_SERVER_ERROR);
                }
            }
        }
    }

    fn respond_with_code(&self, request: &CoapMessage, source: Option<SocketAddrV4>, code: u8) {
        let response = CoapMessage::new(CoapMessageType::Acknowledgement, code, 0);
        self.send_reply(request, source, response);
    }

    /// 把处理器给出的响应按请求类型定型（捎带 ACK 或 NON），缓存并发出。
    fn send_reply(
        &self,
        request: &CoapMessage,
        source: Option<SocketAddrV4>,
        mut response: CoapMessage,
    ) {
        if request.message_type == CoapMessageType::Confirmable {
            response.message_type = CoapMessageType::Acknowledgement;
            response.message_id = request.message_id;
        } else {
            response.message_type = CoapMessageType::NonConfirmable;
            response.message_id = self.allocate_message_id();
        }
        response.token = request.token;
        self.cache_and_send_reply(request, source, &response);
    }

    fn cache_and_send_reply(
        &self,
        request: &CoapMessage,
        source: Option<SocketAddrV4>,
        response: &CoapMessage,
    ) {
        let encoded = match response.encode() {
            Ok(encoded) => encoded,
            Err(error) => {
                warn!(code = error.raw_code(), "failed to encode response");
                return;
            }
        };
        {
            let now = self.scheduler.now();
            let mut state = self.state.lock();
            if state.reply_cache.len() >= REPLY_CACHE_CAPACITY {
                state.reply_cache.pop_front();
            }
            state.reply_cache.push_back(CachedReply {
                peer: source,
                message_id: request.message_id,
                reply: encoded.clone(),
                cached_at: now,
            });
        }
        if let Err(error) = self.send_encoded(&encoded, source) {
            debug!(code = error.raw_code(), "failed to send response");
        }
    }
}

impl DataSink for CoapEndpoint {
    /// 入站数据报：请求走服务端路径，响应走客户端路径。
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()> {
        let source = metadata.and_then(|metadata| match metadata {
            BufferMetadata::SourceSocketAddress(socket_metadata) => Some(socket_metadata.address),
            BufferMetadata::DestinationSocketAddress(_) => None,
        });
        let message = match CoapMessage::decode(data.as_slice()) {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "malformed CoAP datagram");
                // 头部尚可读出的 CON 报文回 4.00，其余只能丢弃。
                let raw = data.as_slice();
                if raw.len() >= 4 && raw[0] >> 6 == COAP_VERSION && (raw[0] >> 4) & 0x3 == 0 {
                    let message_id = u16::from_be_bytes([raw[2], raw[3]]);
                    let bad_request = CoapMessage::new(
                        CoapMessageType::Acknowledgement,
                        codes::BAD_REQUEST,
                        message_id,
                    );
                    let _ = self.send_message(&bad_request, source);
                }
                return Ok(());
            }
        };
        if message.is_request() {
            self.handle_request(&message, source, metadata);
        } else {
            self.handle_response(&message, source);
        }
        Ok(())
    }
}

impl DataSource for CoapEndpoint {
    /// 连接发送数据报的下层 sink。
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        *self.connection_sink.lock() = sink;
        Ok(())
    }
}

