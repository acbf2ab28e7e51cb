#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "gg-stack: 把各协议元素按描述串组装成一条纵向管线。"]
#![doc = ""]
#![doc = "描述串自顶向底给出元素类型：`G` Gattlink、`N` 网络接口（Nano-IP）、"]
#![doc = "`S` 数据报套接字、`D` DTLS（角色决定客户端/服务端）、`A` 活动监视器。"]
#![doc = "组装器完成校验、实例化与首尾相接的布线，并把每个元素的事件包上"]
#![doc = "来源元素 ID 继续上抛。"]

pub mod builder;
pub mod monitor;
pub mod stack;

pub use builder::{StackElementParameters, StackIpConfiguration, StackRole, build_stack};
pub use monitor::ActivityMonitor;
pub use stack::{
    STACK_ELEMENT_ID_BOTTOM, STACK_ELEMENT_ID_TOP, Stack, StackElementInfo, StackPort, StackPortId,
};
