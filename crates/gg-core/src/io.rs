//! 数据流契约：source / sink / sink-listener 三件套与缓冲元数据。
//!
//! # 教案目的（Why）
//! - 管线中的每个环节要么产出缓冲（source）、要么接收缓冲（sink）、要么两者
//!   兼备（element）。所有环节共用同一份契约，栈组合器才能以统一类型把任意
//!   元素首尾相接；
//! - 背压不以 async/await 重造：sink 以 [`GgError::WouldBlock`] 拒收，待有
//!   空间时回调 [`DataSinkListener::on_can_put`]。该协议与语言无关，且可借
//!   事件循环的代理跨线程存续。
//!
//! # 契约说明（What）
//! - **所有权**：`put_data` 成功时 sink 按需克隆（即 retain）缓冲；返回
//!   `WouldBlock` 或错误时调用方保留所有权；
//! - **背压**：收到 `WouldBlock` 后，上游在 `on_can_put` 之前不得重试，
//!   但可以丢弃；
//! - **环引用**：source 对 sink 持强引用（下行），sink 对 listener 仅持
//!   弱引用（上行回指）。销毁任一端之前，另一端需先将链接置空。
//!
//! # 实现提示（How）
//! - 元数据是"随缓冲一起传递的浅拷贝标签"，生命周期不超出 `put_data`
//!   调用本身；接收方要跨调用保存必须自行 `clone`。

use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};

use crate::buffer::Buffer;
use crate::error::GgResult;
use crate::fourcc::FourCc;

/// `'srca'`：入站数据报的来源套接字地址标签。
pub const BUFFER_METADATA_TYPE_SOURCE_SOCKET_ADDRESS: FourCc = FourCc::new(*b"srca");
/// `'dsta'`：出站数据报的目的套接字地址标签。
pub const BUFFER_METADATA_TYPE_DESTINATION_SOCKET_ADDRESS: FourCc = FourCc::new(*b"dsta");

/// 套接字地址元数据负载：IPv4 地址与端口。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketAddressMetadata {
    /// 地址与端口。
    pub address: SocketAddrV4,
}

/// 缓冲元数据：随 `put_data` 传递的封闭标签和。
///
/// 原始设计是"基类 + 按 4CC 区分的子类"；此处按规格落为封闭枚举
/// （`None` 由 `Option` 表达），变体均可按值浅拷贝。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMetadata {
    /// 入站数据报的发送方地址（`'srca'`）。
    SourceSocketAddress(SocketAddressMetadata),
    /// 出站数据报的期望接收方地址（`'dsta'`）。
    DestinationSocketAddress(SocketAddressMetadata),
}

impl BufferMetadata {
    /// 构造 `'srca'` 元数据。
    #[must_use]
    pub const fn source_socket_address(address: SocketAddrV4) -> Self {
        Self::SourceSocketAddress(SocketAddressMetadata { address })
    }

    /// 构造 `'dsta'` 元数据。
    #[must_use]
    pub const fn destination_socket_address(address: SocketAddrV4) -> Self {
        Self::DestinationSocketAddress(SocketAddressMetadata { address })
    }

    /// 返回变体对应的 4CC 类型标签。
    #[must_use]
    pub const fn type_tag(&self) -> FourCc {
        match self {
            Self::SourceSocketAddress(_) => BUFFER_METADATA_TYPE_SOURCE_SOCKET_ADDRESS,
            Self::DestinationSocketAddress(_) => BUFFER_METADATA_TYPE_DESTINATION_SOCKET_ADDRESS,
        }
    }

    /// 取出元数据中的套接字地址（两种变体均携带）。
    #[must_use]
    pub const fn socket_address(&self) -> SocketAddrV4 {
        match self {
            Self::SourceSocketAddress(meta) | Self::DestinationSocketAddress(meta) => meta.address,
        }
    }
}

/// 对"可以再次 `put_data`"感兴趣的回调方。
///
/// 典型用法：向 sink 写入得到 `WouldBlock` 之后注册自己，待 sink 腾出
/// 空间时收到 [`on_can_put`](Self::on_can_put) 再恢复发送。
pub trait DataSinkListener: Send + Sync {
    /// 通知监听方：现在可以（也应该）再次调用 sink 的 `put_data`。
    fn on_can_put(&self);
}

/// 可接收缓冲的对象。
pub trait DataSink: Send + Sync {
    /// 向 sink 投递一个缓冲与可选元数据。
    ///
    /// # 契约
    /// - 返回 `Ok(())`：sink 已接收，需要保留时自行克隆；
    /// - 返回 `Err(WouldBlock)`：sink 正常情况下可接收但此刻收不下，
    ///   调用方保留缓冲并等待 `on_can_put`；
    /// - 返回其它错误：投递失败，调用方保留缓冲。
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()>;

    /// 注册/注销 sink 的监听方（弱引用，存储归调用方所有）。
    ///
    /// 从不拒收的 sink 可以保留默认实现（忽略注册）。
    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        let _ = listener;
        Ok(())
    }
}

/// 可向 sink 发送数据的对象。
pub trait DataSource: Send + Sync {
    /// 设置本 source 的下游 sink；`None` 表示断开。
    ///
    /// # 契约
    /// - sink 的生命周期须不短于本对象，销毁 sink 之前必须先在此处置空；
    /// - 实现若向 sink 注册了 listener，必须在改挂其它 sink 或自身销毁前
    ///   调用 `set_listener(None)` 注销。
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()>;
}
