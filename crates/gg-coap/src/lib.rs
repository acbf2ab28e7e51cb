#![deny(unsafe_code)]
#![warn(missing_docs)]
#![doc = "gg-coap: UDP 之上（实际上是任何数据报管线之上）的 CoAP 协议族。"]
#![doc = ""]
#![doc = "同一个端点既做客户端（带重传与确认超时的请求发起方）也做服务端"]
#![doc = "（带去重缓存与路径路由的请求处理方）。分块传输覆盖 RFC 7959 的"]
#![doc = "GET/PUT/POST 子集；事件发射器在其上提供\"延迟上界内批量可靠上报\""]
#![doc = "的语义。"]

pub mod blockwise;
pub mod emitter;
pub mod endpoint;
pub mod message;

pub use blockwise::{
    CoapBlockInfo, CoapBlockSource, CoapBlockwiseResponseListener, CoapBlockwiseServerHelper,
    CoapMemoryBlockSource,
};
pub use emitter::CoapEventEmitter;
pub use endpoint::{
    CoapClientParameters, CoapEndpoint, CoapRequestHandle, CoapRequestHandler,
    CoapRequestHandlerFlags, CoapHandlerResult, CoapResponder, CoapResponseListener,
};
pub use message::{CoapMessage, CoapMessageType, CoapMethod, CoapOption, CoapOptionValue, CoapToken};
