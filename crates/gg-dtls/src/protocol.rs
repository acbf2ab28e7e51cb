//! DTLS 协议元素：四端口适配器与状态机。
//!
//! # 交互契约（What）
//! - 上侧（用户）端口走明文：sink 收应用写入并加密下发，source 把解密
//!   后的数据交给应用；下侧（传输）端口走密文记录；
//! - 状态集合 {Init, Handshake, Session, Error}；每次迁移发出 `'tlss'`
//!   事件；进入 Error 后读写快速失败，`reset` 回到 Init；
//! - 握手与告警记录在内部吸收，从不出现在用户端口上；
//! - 会话建立前的应用写入以 `WouldBlock` 拒绝，进入会话态时向上游补发
//!   `on_can_put`。
//!
//! # 并发纪律（How）
//! - 引擎锁只包住引擎调用本身；向下游/上游投递以及事件发射都在锁外，
//!   同步的管线重入不会自死锁。

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};
use gg_core::events::{
    EVENT_TYPE_TLS_STATE_CHANGE, Event, EventData, EventEmitter, EventListener,
};
use gg_core::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};

use crate::engine::{
    DtlsClientOptions, DtlsEngine, DtlsEngineFactory, DtlsEngineOutput, DtlsEngineState,
    DtlsServerOptions,
};
use crate::suites;

/// 协议角色，构造时固定。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsRole {
    /// 客户端（node 侧）。
    Client,
    /// 服务端（hub 侧）。
    Server,
}

/// 协议状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsState {
    /// 初始：尚未开始握手。
    Init,
    /// 握手进行中。
    Handshake,
    /// 会话已建立。
    Session,
    /// 故障：读写快速失败，等待 `reset`。
    Error,
}

impl DtlsState {
    /// 事件负载里使用的序号编码。
    #[must_use]
    pub const fn as_code(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::Handshake => 1,
            Self::Session => 2,
            Self::Error => 3,
        }
    }
}

/// 按角色打包的构造选项。
pub enum DtlsOptions {
    /// 客户端角色与凭据。
    Client(DtlsClientOptions),
    /// 服务端角色与密钥解析器。
    Server(DtlsServerOptions),
}

struct ProtocolFlow {
    state: DtlsState,
    last_error: i32,
    /// 等待传输侧接收的密文记录。
    out_records: VecDeque<Buffer>,
    /// 等待用户侧接收的明文。
    out_plaintext: VecDeque<Buffer>,
    transport_blocked: bool,
    user_blocked: bool,
    /// 会话态之前用户写入被拒，等待补发 `on_can_put`。
    user_starved: bool,
    /// 重入护栏：同步布线下，下游的 `put_data` 可能一路折返回本对象。
    flushing: bool,
    delivering: bool,
}

struct DtlsInner {
    role: DtlsRole,
    engine: Mutex<Box<dyn DtlsEngine>>,
    flow: Mutex<ProtocolFlow>,
    user_sink: Mutex<Option<Arc<dyn DataSink>>>,
    transport_sink: Mutex<Option<Arc<dyn DataSink>>>,
    user_listener: Mutex<Option<Weak<dyn DataSinkListener>>>,
    event_listener: Mutex<Option<Weak<dyn EventListener>>>,
    user_relay: Arc<CanPutRelay>,
    transport_relay: Arc<CanPutRelay>,
}

enum RelaySide {
    User,
    Transport,
}

struct CanPutRelay {
    inner: Mutex<Weak<DtlsInner>>,
    side: RelaySide,
}

impl DataSinkListener for CanPutRelay {
    fn on_can_put(&self) {
        let Some(inner) = self.inner.lock().upgrade() else {
            return;
        };
        match self.side {
            RelaySide::User => {
                inner.flow.lock().user_blocked = false;
                inner.deliver_plaintext();
            }
            RelaySide::Transport => {
                inner.flow.lock().transport_blocked = false;
                inner.flush_records();
            }
        }
    }
}

impl DtlsInner {
    fn emit_state_change(&self, state: DtlsState) {
        if let Some(listener) = self
            .event_listener
            .lock()
            .clone()
            .and_then(|weak| weak.upgrade())
        {
            listener.on_event(&Event {
                event_type: EVENT_TYPE_TLS_STATE_CHANGE,
                data: EventData::TlsStateChange(state.as_code()),
            });
        }
    }

    /// 把引擎产出并入待发队列与状态机，返回需要上报的状态迁移。
    fn absorb_output(&self, output: DtlsEngineOutput) -> Option<DtlsState> {
        let mut flow = self.flow.lock();
        for record in output.records {
            flow.out_records.push_back(Buffer::from_vec(record));
        }
        for plaintext in output.plaintext {
            flow.out_plaintext.push_back(Buffer::from_vec(plaintext));
        }
        let new_state = match output.state {
            Some(DtlsEngineState::Handshaking) => DtlsState::Handshake,
            Some(DtlsEngineState::Session) => DtlsState::Session,
            Some(DtlsEngineState::Failed(code)) => {
                flow.last_error = code;
                DtlsState::Error
            }
            None => return None,
        };
        if flow.state == new_state {
            return None;
        }
        flow.state = new_state;
        Some(new_state)
    }

    fn after_engine_step(&self, transition: Option<DtlsState>) {
        if let Some(state) = transition {
            match state {
                DtlsState::Session => info!(role = ?self.role, "dtls session established"),
                DtlsState::Error => {
                    warn!(code = self.flow.lock().last_error, "dtls entered error state");
                }
                _ => {}
            }
            self.emit_state_change(state);
        }
        self.flush_records();
        self.deliver_plaintext();
        // 进入会话态后，被拒过的上游可以继续写了。
        if transition == Some(DtlsState::Session) {
            let starved = {
                let mut flow = self.flow.lock();
                std::mem::take(&mut flow.user_starved)
            };
            if starved
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

    fn start(&self) -> GgResult<()> {
        {
            let flow = self.flow.lock();
            if flow.state != DtlsState::Init {
                return Err(GgError::InvalidState);
            }
        }
        {
            let mut flow = self.flow.lock();
            flow.state = DtlsState::Handshake;
        }
        self.emit_state_change(DtlsState::Handshake);
        let output = {
            let mut engine = self.engine.lock();
            engine.start()?
        };
        let transition = self.absorb_output(output);
        self.after_engine_step(transition);
        Ok(())
    }

    fn reset(&self) {
        self.engine.lock().reset();
        {
            let mut flow = self.flow.lock();
            flow.state = DtlsState::Init;
            flow.last_error = 0;
            flow.out_records.clear();
            flow.out_plaintext.clear();
            flow.transport_blocked = false;
            flow.user_blocked = false;
            flow.user_starved = false;
        }
        self.emit_state_change(DtlsState::Init);
    }

    /// 用户侧写入：加密并下发。
    fn user_put(&self, data: &Buffer) -> GgResult<()> {
        {
            let mut flow = self.flow.lock();
            match flow.state {
                DtlsState::Session => {}
                DtlsState::Error => return Err(GgError::Tls(flow.last_error)),
                // 会话未就绪：背压，进入会话态后补发 on_can_put。
                DtlsState::Init | DtlsState::Handshake => {
                    flow.user_starved = true;
                    return Err(GgError::WouldBlock);
                }
            }
        }
        let record = {
            let mut engine = self.engine.lock();
            engine.wrap(data.as_slice())?
        };
        self.flow
            .lock()
            .out_records
            .push_back(Buffer::from_vec(record));
        self.flush_records();
        Ok(())
    }

    /// 传输侧收到密文记录。
    fn transport_put(&self, data: &Buffer) -> GgResult<()> {
        {
            let flow = self.flow.lock();
            if flow.state == DtlsState::Error {
                debug!("dropping record while in error state");
                return Ok(());
            }
        }
        let result = {
            let mut engine = self.engine.lock();
            engine.consume_record(data.as_slice())
        };
        match result {
            Ok(output) => {
                let transition = self.absorb_output(output);
                self.after_engine_step(transition);
            }
            Err(error) => {
                // 畸形记录：丢弃并告警，不上浮为传输错误。
                warn!(code = error.raw_code(), "dtls engine rejected record");
            }
        }
        Ok(())
    }

    fn flush_records(&self) {
        {
            let mut flow = self.flow.lock();
            if flow.flushing {
                return;
            }
            flow.flushing = true;
        }
        self.flush_records_inner();
        self.flow.lock().flushing = false;
    }

    fn flush_records_inner(&self) {
        loop {
            let Some(sink) = self.transport_sink.lock().clone() else {
                return;
            };
            let record = {
                let mut flow = self.flow.lock();
                if flow.transport_blocked {
                    return;
                }
                flow.out_records.pop_front()
            };
            let Some(record) = record else { return };
            match sink.put_data(&record, None) {
                Ok(()) => {}
                Err(error) if error.is_would_block() => {
                    let mut flow = self.flow.lock();
                    flow.out_records.push_front(record);
                    flow.transport_blocked = true;
                    return;
                }
                Err(error) => {
                    warn!(code = error.raw_code(), "transport rejected dtls record, dropping");
                }
            }
        }
    }

    fn deliver_plaintext(&self) {
        {
            let mut flow = self.flow.lock();
            if flow.delivering {
                return;
            }
            flow.delivering = true;
        }
        self.deliver_plaintext_inner();
        self.flow.lock().delivering = false;
    }

    fn deliver_plaintext_inner(&self) {
        loop {
            let Some(sink) = self.user_sink.lock().clone() else {
                return;
            };
            let plaintext = {
                let mut flow = self.flow.lock();
                if flow.user_blocked {
                    return;
                }
                flow.out_plaintext.pop_front()
            };
            let Some(plaintext) = plaintext else { return };
            match sink.put_data(&plaintext, None) {
                Ok(()) => {}
                Err(error) if error.is_would_block() => {
                    let mut flow = self.flow.lock();
                    flow.out_plaintext.push_front(plaintext);
                    flow.user_blocked = true;
                    return;
                }
                Err(error) => {
                    warn!(code = error.raw_code(), "user sink rejected plaintext, dropping");
                }
            }
        }
    }
}

struct UserSideSink {
    inner: Arc<DtlsInner>,
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

struct UserSideSource {
    inner: Arc<DtlsInner>,
}

impl DataSource for UserSideSource {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(previous) = self.inner.user_sink.lock().take() {
            let _ = previous.set_listener(None);
        }
        if let Some(sink) = sink {
            let listener: Weak<dyn DataSinkListener> =
                Arc::downgrade(&self.inner.user_relay) as Weak<dyn DataSinkListener>;
            sink.set_listener(Some(listener))?;
            *self.inner.user_sink.lock() = Some(sink);
        }
        Ok(())
    }
}

struct TransportSideSink {
    inner: Arc<DtlsInner>,
}

impl DataSink for TransportSideSink {
    fn put_data(&self, data: &Buffer, _metadata: Option<&BufferMetadata>) -> GgResult<()> {
        self.inner.transport_put(data)
    }
}

struct TransportSideSource {
    inner: Arc<DtlsInner>,
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

/// DTLS 协议元素。
pub struct DtlsProtocol {
    inner: Arc<DtlsInner>,
}

impl DtlsProtocol {
    /// 以角色选项与引擎工厂构造协议元素。
    ///
    /// # 契约
    /// - 套件列表不能为空，且必须全部落在受支持的 PSK 集合内；
    /// - 工厂创建引擎失败的错误原样上浮。
    pub fn new(options: DtlsOptions, factory: &Arc<dyn DtlsEngineFactory>) -> GgResult<Arc<Self>> {
        let (role, engine) = match &options {
            DtlsOptions::Client(client) => {
                validate_suites(&client.cipher_suites)?;
                (DtlsRole::Client, factory.create_client(client)?)
            }
            DtlsOptions::Server(server) => {
                validate_suites(&server.cipher_suites)?;
                (DtlsRole::Server, factory.create_server(server)?)
            }
        };
        let user_relay = Arc::new(CanPutRelay {
            inner: Mutex::new(Weak::new()),
            side: RelaySide::User,
        });
        let transport_relay = Arc::new(CanPutRelay {
            inner: Mutex::new(Weak::new()),
            side: RelaySide::Transport,
        });
        let inner = Arc::new(DtlsInner {
            role,
            engine: Mutex::new(engine),
            flow: Mutex::new(ProtocolFlow {
                state: DtlsState::Init,
                last_error: 0,
                out_records: VecDeque::new(),
                out_plaintext: VecDeque::new(),
                transport_blocked: false,
                user_blocked: false,
                user_starved: false,
                flushing: false,
                delivering: false,
            }),
            user_sink: Mutex::new(None),
            transport_sink: Mutex::new(None),
            user_listener: Mutex::new(None),
            event_listener: Mutex::new(None),
            user_relay: Arc::clone(&user_relay),
            transport_relay: Arc::clone(&transport_relay),
        });
        *user_relay.inner.lock() = Arc::downgrade(&inner);
        *transport_relay.inner.lock() = Arc::downgrade(&inner);
        Ok(Arc::new(Self { inner }))
    }

    /// 启动握手（客户端发出第一束记录；服务端转入等待）。
    pub fn start_handshake(&self) -> GgResult<()> {
        self.inner.start()
    }

    /// 回到初始态：丢弃会话与全部排队数据。
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// 当前状态。
    #[must_use]
    pub fn state(&self) -> DtlsState {
        self.inner.flow.lock().state
    }

    /// 进入错误态的 cipher 层原因码（非错误态时为 0）。
    #[must_use]
    pub fn last_error(&self) -> i32 {
        self.inner.flow.lock().last_error
    }

    /// 构造时固定的角色。
    #[must_use]
    pub fn role(&self) -> DtlsRole {
        self.inner.role
    }

    /// 用户侧 sink（应用写入明文）。
    #[must_use]
    pub fn user_side_sink(&self) -> Arc<dyn DataSink> {
        Arc::new(UserSideSink {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 用户侧 source（向应用交付明文）。
    #[must_use]
    pub fn user_side_source(&self) -> Arc<dyn DataSource> {
        Arc::new(UserSideSource {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 传输侧 sink（传输投递密文记录）。
    #[must_use]
    pub fn transport_side_sink(&self) -> Arc<dyn DataSink> {
        Arc::new(TransportSideSink {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 传输侧 source（向传输发出密文记录）。
    #[must_use]
    pub fn transport_side_source(&self) -> Arc<dyn DataSource> {
        Arc::new(TransportSideSource {
            inner: Arc::clone(&self.inner),
        })
    }
}

impl EventEmitter for DtlsProtocol {
    fn set_event_listener(&self, listener: Option<Weak<dyn EventListener>>) {
        *self.inner.event_listener.lock() = listener;
    }
}

fn validate_suites(cipher_suites: &[u16]) -> GgResult<()> {
    if cipher_suites.is_empty() || !cipher_suites.iter().all(|suite| suites::is_supported(*suite))
    {
        return Err(GgError::InvalidParameters);
    }
    Ok(())
}
