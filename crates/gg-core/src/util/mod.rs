//! 管线小工具：内存 source/sink、异步管道与打点数据源。
//!
//! 这些对象既是测试基座（各协议 crate 的场景测试都以它们充当管线两端），
//! 也可在真实组装中充当简单的端点。

mod async_pipe;
mod blaster;
mod memory;

pub use async_pipe::AsyncPipe;
pub use blaster::BlasterDataSource;
pub use memory::{MemoryDataSink, MemoryDataSource};
