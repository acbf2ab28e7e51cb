//! 跨层共享的稳定错误域。
//!
//! # 教案目的（Why）
//! - 管线各层（链路、IP、DTLS、CoAP）产生的故障需要合流为统一的错误词汇，
//!   日志与测试才能做精确断言；
//! - `WOULD_BLOCK` 在本栈中是背压协议的一部分而非故障：sink 以它表示
//!   "此刻收不下，收得下时回调 `on_can_put`"，上游绝不应将其当错误上报。
//!
//! # 契约说明（What）
//! - 所有可失败的公开操作返回 [`GgResult<T>`]；
//! - [`GgError::raw_code`] 保留按子系统分组的负数错误码（generic/IO/socket
//!   各占一个基区间），供日志与跨语言桥接使用；
//! - CoAP 请求处理器产生的 4.xx/5.xx 以 [`GgError::CoapResponse`] 携带原始
//!   响应码穿越本地调用边界。

use thiserror::Error;

/// 统一的结果别名。
pub type GgResult<T> = Result<T, GgError>;

/// Golden Gate 错误枚举，覆盖 generic、I/O、socket、TLS 与 CoAP 五个分组。
///
/// # 设计背景（Why）
/// - 原始分层以"负整数 + 子系统基址"表达错误码；Rust 侧改以封闭枚举承载，
///   同时通过 [`raw_code`](Self::raw_code) 保留数字分组，两种视角互不丢失。
///
/// # 使用指引（How）
/// - 背压路径判断请使用 [`is_would_block`](Self::is_would_block)，不要对
///   变体名做字符串匹配；
/// - 畸形的线上数据不应转化为错误返回：按传播策略直接丢弃并记一条 warning。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GgError {
    /// 输入参数非法。
    #[error("invalid parameters")]
    InvalidParameters,
    /// 对象状态不允许该操作。
    #[error("invalid state")]
    InvalidState,
    /// 内存分配失败。
    #[error("out of memory")]
    OutOfMemory,
    /// 固定容量资源（端口、事件槽位等）耗尽。
    #[error("out of resources")]
    OutOfResources,
    /// 功能未被支持。
    #[error("not supported")]
    NotSupported,
    /// 查询的条目不存在。
    #[error("no such item")]
    NoSuchItem,
    /// 目标空间不足以容纳数据。
    #[error("not enough space")]
    NotEnoughSpace,
    /// 等待超时。
    #[error("timeout")]
    Timeout,
    /// 背压信号：此刻无法接收，等待 `on_can_put` 后方可重试。
    #[error("would block")]
    WouldBlock,
    /// 等待被终止请求打断。
    #[error("interrupted")]
    Interrupted,
    /// 内部一致性故障。
    #[error("internal error")]
    Internal,
    /// 语法错误（描述串、配置串等）。
    #[error("invalid syntax")]
    InvalidSyntax,
    /// 数值越界。
    #[error("out of range")]
    OutOfRange,

    /// 流已结束。
    #[error("end of stream")]
    EndOfStream,

    /// 连接被对端拒绝。
    #[error("connection refused")]
    ConnectionRefused,
    /// 连接被对端重置。
    #[error("connection reset")]
    ConnectionReset,
    /// 连接被中止。
    #[error("connection aborted")]
    ConnectionAborted,
    /// 连接建立失败。
    #[error("connection failed")]
    ConnectionFailed,
    /// 主机名无法解析。
    #[error("host unknown")]
    HostUnknown,
    /// 主机不可达。
    #[error("host unreachable")]
    HostUnreachable,
    /// 网络已关闭。
    #[error("network down")]
    NetworkDown,
    /// 网络不可达。
    #[error("network unreachable")]
    NetworkUnreachable,
    /// 绑定本地地址失败。
    #[error("bind failed")]
    BindFailed,
    /// 监听失败。
    #[error("listen failed")]
    ListenFailed,
    /// 接受连接失败。
    #[error("accept failed")]
    AcceptFailed,
    /// 设置套接字选项失败。
    #[error("setsockopt failed")]
    SetSockOptFailed,
    /// 地址已被占用。
    #[error("address in use")]
    AddressInUse,
    /// 套接字尚未连接。
    #[error("not connected")]
    NotConnected,

    /// TLS 层故障；负载为 cipher 层的具体原因码。
    #[error("tls error (cipher-level code {0})")]
    Tls(i32),

    /// CoAP 请求处理器产生的错误响应码（class.detail 压缩为一个字节）。
    #[error("coap response {}.{:02}", .0 >> 5, .0 & 0x1f)]
    CoapResponse(u8),
}

/// generic 分组的错误码基址。
const ERROR_BASE_GENERAL: i32 = -10000;
/// I/O 分组的错误码基址。
const ERROR_BASE_IO: i32 = -10100;
/// socket 分组的错误码基址。
const ERROR_BASE_SOCKET: i32 = -10200;
/// TLS 分组的错误码基址。
const ERROR_BASE_TLS: i32 = -10300;

impl GgError {
    /// 背压判定：`WouldBlock` 属于流控协议，不应按失败处理。
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// 按子系统分组的稳定数字错误码。
    ///
    /// generic 占 `-10001..`，I/O 占 `-10101..`，socket 占 `-10201..`，
    /// TLS 统一折叠到 `-10300`；CoAP 响应码保持正数原值以便与报文对照。
    #[must_use]
    pub const fn raw_code(&self) -> i32 {
        match self {
            Self::InvalidParameters => ERROR_BASE_GENERAL - 1,
            Self::InvalidState => ERROR_BASE_GENERAL - 2,
            Self::OutOfMemory => ERROR_BASE_GENERAL - 3,
            Self::OutOfResources => ERROR_BASE_GENERAL - 4,
            Self::NotSupported => ERROR_BASE_GENERAL - 5,
            Self::NoSuchItem => ERROR_BASE_GENERAL - 6,
            Self::NotEnoughSpace => ERROR_BASE_GENERAL - 7,
            Self::Timeout => ERROR_BASE_GENERAL - 8,
            Self::WouldBlock => ERROR_BASE_GENERAL - 9,
            Self::Interrupted => ERROR_BASE_GENERAL - 10,
            Self::Internal => ERROR_BASE_GENERAL - 11,
            Self::InvalidSyntax => ERROR_BASE_GENERAL - 12,
            Self::OutOfRange => ERROR_BASE_GENERAL - 13,
            Self::EndOfStream => ERROR_BASE_IO - 1,
            Self::ConnectionRefused => ERROR_BASE_SOCKET - 1,
            Self::ConnectionReset => ERROR_BASE_SOCKET - 2,
            Self::ConnectionAborted => ERROR_BASE_SOCKET - 3,
            Self::ConnectionFailed => ERROR_BASE_SOCKET - 4,
            Self::HostUnknown => ERROR_BASE_SOCKET - 5,
            Self::HostUnreachable => ERROR_BASE_SOCKET - 6,
            Self::NetworkDown => ERROR_BASE_SOCKET - 7,
            Self::NetworkUnreachable => ERROR_BASE_SOCKET - 8,
            Self::BindFailed => ERROR_BASE_SOCKET - 9,
            Self::ListenFailed => ERROR_BASE_SOCKET - 10,
            Self::AcceptFailed => ERROR_BASE_SOCKET - 11,
            Self::SetSockOptFailed => ERROR_BASE_SOCKET - 12,
            Self::AddressInUse => ERROR_BASE_SOCKET - 13,
            Self::NotConnected => ERROR_BASE_SOCKET - 14,
            Self::Tls(_) => ERROR_BASE_TLS,
            Self::CoapResponse(code) => *code as i32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_is_not_a_failure_marker() {
        assert!(GgError::WouldBlock.is_would_block());
        assert!(!GgError::Timeout.is_would_block());
    }

    #[test]
    fn raw_codes_stay_grouped_by_subsystem() {
        assert_eq!(GgError::InvalidParameters.raw_code(), -10001);
        assert_eq!(GgError::EndOfStream.raw_code(), -10101);
        assert_eq!(GgError::ConnectionRefused.raw_code(), -10201);
        assert_eq!(GgError::Tls(7).raw_code(), -10300);
        // CoAP 响应码保持正值：4.04 = 0b100_00100。
        assert_eq!(GgError::CoapResponse(0x84).raw_code(), 0x84);
    }

    #[test]
    fn coap_response_renders_class_and_detail() {
        assert_eq!(GgError::CoapResponse(0x84).to_string(), "coap response 4.04");
    }
}
