#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "gg-nip: Nano-IP，一个近乎极简的 IP 栈。"]
#![doc = ""]
#![doc = "Nip 只做一件事：经单个网络接口收发 UDP 数据报。它不是通用 IP 栈，"]
#![doc = "而是为\"隧道两端只需 UDP 复用\"的受限环境准备的专用件；需要 TCP 或"]
#![doc = "多接口路由时应改用完整协议栈。"]
#![doc = ""]
#![doc = "约束：非重入，所有调用必须发生在事件循环线程上（调试构建由上层的"]
#![doc = "线程守卫捕获）；传输 source 必须以\"每缓冲恰好一个完整 IP 包\"的粒度"]
#![doc = "投递，栈不接受半包或粘包。"]

pub mod endpoint;
pub mod ipv4;
pub mod stack;

pub use endpoint::UdpEndpoint;
pub use ipv4::{Ipv4ParseError, ParsedUdpPacket, serialize_udp_packet};
pub use stack::NipStack;
