#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "gg-core: Golden Gate 协议栈的核心契约层。"]
#![doc = ""]
#![doc = "== 架构定位 =="]
#![doc = "Golden Gate 是一个可移植、可嵌入的网络栈：受限外设与移动端网关通过不可靠、"]
#![doc = "小 MTU 的传输通道（典型为 BLE GATT 特征值对）交换安全、分段的数据报。"]
#![doc = "本 crate 提供纵向管线（链路成帧、重传、IP 隧道、DTLS、UDP 复用、CoAP）"]
#![doc = "赖以组合的水平基座：缓冲原语、数据流契约、事件循环、定时器与日志配置。"]
#![doc = ""]
#![doc = "== 线程模型 =="]
#![doc = "核心为单线程协作式调度：所有 source/sink/定时器/事件回调均在事件循环线程上"]
#![doc = "执行。跨线程仅有三个入口（`post_message`、`invoke_sync`、`invoke_async`），"]
#![doc = "其余对象的跨线程访问由调试期的 [`thread_guard::ThreadGuard`] 捕获。"]

pub mod buffer;
pub mod error;
pub mod events;
pub mod fourcc;
pub mod io;
pub mod logging;
pub mod event_loop;
pub mod queue;
pub mod runtime;
pub mod thread_guard;
pub mod timer;
pub mod util;

pub use buffer::{Buffer, DynamicBuffer};
pub use error::{GgError, GgResult};
pub use events::{Event, EventData, EventEmitter, EventListener};
pub use fourcc::FourCc;
pub use io::{BufferMetadata, DataSink, DataSinkListener, DataSource, SocketAddressMetadata};
pub use event_loop::{EventLoop, LoopMessage};
pub use timer::{Timer, TimerListener, TimerScheduler};
