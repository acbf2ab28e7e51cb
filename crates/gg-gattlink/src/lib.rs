#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "gg-gattlink: 链路层可靠成帧协议。"]
#![doc = ""]
#![doc = "Gattlink 位于\"逐字节不可靠、小 MTU 的传输\"（典型为一对 GATT 特征值）"]
#![doc = "与 IP 规模的用户数据报之间：对上提供按序、不重不漏的数据报交付，"]
#![doc = "对下以 5 bit 序号（mod 32）的滑动窗口做确认与重传。"]
#![doc = ""]
#![doc = "底部传输契约：每个入站缓冲必须恰好携带一个完整的 Gattlink 包，"]
#![doc = "不得拆分或合并；出站缓冲不超过当前分片大小。"]

pub mod packet;
pub mod protocol;

pub use protocol::{Gattlink, GattlinkConfig, GattlinkProbeConfig, SessionState};

/// GATT 承载时使用的服务 UUID。
pub const GATTLINK_SERVICE_UUID: &str = "ABBAFF00-E56A-484C-B832-8B17CF6CBFE8";
/// RX 特征值（对端到设备，write-no-response）。
pub const GATTLINK_RX_CHARACTERISTIC_UUID: &str = "ABBAFF01-E56A-484C-B832-8B17CF6CBFE8";
/// TX 特征值（设备到对端，notify）。
pub const GATTLINK_TX_CHARACTERISTIC_UUID: &str = "ABBAFF02-E56A-484C-B832-8B17CF6CBFE8";
