#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "gg-dtls: DTLS 适配层。"]
#![doc = ""]
#![doc = "密码学原语不在本 crate 内：握手与记录加解密委托给实现了"]
#![doc = "[`engine::DtlsEngine`] 的外部库（构造时注入工厂）。本 crate 负责把"]
#![doc = "引擎嫁接进 source/sink 管线：上侧端口走明文，下侧端口走密文，"]
#![doc = "握手与告警记录在内部吸收，状态迁移以 `'tlss'` 事件上报。"]

pub mod engine;
pub mod protocol;
pub mod suites;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use engine::{
    DtlsClientOptions, DtlsEngine, DtlsEngineFactory, DtlsEngineOutput, DtlsEngineState,
    DtlsKeyResolver, DtlsServerOptions,
};
pub use protocol::{DtlsOptions, DtlsProtocol, DtlsRole, DtlsState};
