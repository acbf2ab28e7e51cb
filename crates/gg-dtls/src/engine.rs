//! DTLS 引擎契约：密码学实现与管线适配层之间的接缝。
//!
//! # 教案目的（Why）
//! - 栈对 TLS 库不做绑定：mbedTLS、wolfSSL 或任何实现都可以借
//!   [`DtlsEngine`]/[`DtlsEngineFactory`] 接入；适配层只关心"喂进一条
//!   记录、吐出哪些记录与明文、状态到哪了"；
//! - 引擎是单会话、有状态的值对象：一次握手一条会话；重置即回到初始态。
//!
//! # 契约说明（What）
//! - 引擎的所有方法都在事件循环线程上调用，无需内部加锁；
//! - `records` 是要发往传输侧的密文记录（每条一个数据报）；`plaintext`
//!   是解出的应用数据；两者都可为空；
//! - 失败以 [`DtlsEngineState::Failed`] 表达，负载为 cipher 层原因码，
//!   适配层据此进入错误态并快速失败。

use std::sync::Arc;

use gg_core::error::GgResult;

/// 客户端 PSK 凭据与偏好。
#[derive(Debug, Clone)]
pub struct DtlsClientOptions {
    /// PSK 身份。
    pub identity: Vec<u8>,
    /// 预共享密钥。
    pub key: Vec<u8>,
    /// 可选的会话票据（恢复握手用）。
    pub ticket: Option<Vec<u8>>,
    /// 密码套件偏好列表（IANA 代码，按偏好排序）。
    pub cipher_suites: Vec<u16>,
}

/// 服务端选项：以回调解析身份对应的密钥。
#[derive(Clone)]
pub struct DtlsServerOptions {
    /// 身份到密钥的解析器。
    pub key_resolver: Arc<dyn DtlsKeyResolver>,
    /// 密码套件偏好列表。
    pub cipher_suites: Vec<u16>,
}

/// PSK 身份解析回调。
pub trait DtlsKeyResolver: Send + Sync {
    /// 返回身份对应的密钥；身份未知时返回 `None`（对应 NoSuchItem）。
    fn resolve_key(&self, identity: &[u8]) -> Option<Vec<u8>>;
}

/// 引擎侧的粗粒度状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DtlsEngineState {
    /// 握手进行中。
    Handshaking,
    /// 会话已建立，可收发应用数据。
    Session,
    /// 握手或记录处理失败；负载为 cipher 层原因码。
    Failed(i32),
}

/// 引擎一步运转的产出。
#[derive(Debug, Default)]
pub struct DtlsEngineOutput {
    /// 状态有变化时携带新状态。
    pub state: Option<DtlsEngineState>,
    /// 要发往传输侧的密文记录。
    pub records: Vec<Vec<u8>>,
    /// 解出的应用明文。
    pub plaintext: Vec<Vec<u8>>,
}

/// 单会话 DTLS 引擎。
pub trait DtlsEngine: Send {
    /// 启动握手（客户端产出第一束记录；服务端通常为空操作）。
    fn start(&mut self) -> GgResult<DtlsEngineOutput>;

    /// 消化一条来自传输侧的记录。
    fn consume_record(&mut self, record: &[u8]) -> GgResult<DtlsEngineOutput>;

    /// 把应用明文封成一条密文记录；仅会话态可用。
    fn wrap(&mut self, plaintext: &[u8]) -> GgResult<Vec<u8>>;

    /// 丢弃全部会话状态，回到初始态。
    fn reset(&mut self);
}

/// 引擎工厂：按角色与选项创建引擎实例。
pub trait DtlsEngineFactory: Send + Sync {
    /// 创建客户端引擎。
    fn create_client(&self, options: &DtlsClientOptions) -> GgResult<Box<dyn DtlsEngine>>;

    /// 创建服务端引擎。
    fn create_server(&self, options: &DtlsServerOptions) -> GgResult<Box<dyn DtlsEngine>>;
}
