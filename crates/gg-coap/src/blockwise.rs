//! 分块传输（RFC 7959 子集）：大负载的 GET 与 PUT/POST。
//!
//! # 契约说明（What）
//! - 块选项值打包 `(NUM, M, SZX)`：块号、more 标记、尺寸指数
//!   （尺寸 = 2^(SZX+4)，合法集合 {16..1024}）；
//! - 客户端 PUT/POST 带 Block1 逐块上传，2.31 Continue 驱动前进；
//!   GET 按响应里的 Block2 逐块下载直到 `more = false`；
//! - 服务端助手按来源跟踪"下一个期望偏移"；客户端重发上一块时幂等
//!   重答，乱序块以 4.08 拒绝并附 Start-Offset 指示续传位置。

use std::net::SocketAddrV4;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};

use crate::endpoint::{
    CoapClientParameters, CoapEndpoint, CoapRequestHandle, CoapResponseListener,
};
use crate::message::{CoapMessage, CoapMessageType, CoapMethod, CoapOption, codes, options};

/// 合法块尺寸集合。
pub const BLOCK_SIZES: [usize; 7] = [16, 32, 64, 128, 256, 512, 1024];

/// 一个块的位置信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoapBlockInfo {
    /// 字节偏移（块号 × 块尺寸）。
    pub offset: usize,
    /// 块尺寸。
    pub size: usize,
    /// 后面还有块。
    pub more: bool,
}

impl CoapBlockInfo {
    /// 从块选项的 uint 值解包。
    pub fn from_option_value(value: u32) -> GgResult<Self> {
        let szx = value & 0x7;
        if szx == 7 {
            return Err(GgError::InvalidParameters);
        }
        let size = 1usize << (szx + 4);
        let number = (value >> 4) as usize;
        Ok(Self {
            offset: number * size,
            size,
            more: value & 0x8 != 0,
        })
    }

    /// 打包为块选项的 uint 值。
    ///
    /// # 契约
    /// - 尺寸必须属于 [`BLOCK_SIZES`]，偏移必须按尺寸对齐，否则
    ///   `InvalidParameters`。
    pub fn to_option_value(&self) -> GgResult<u32> {
        let szx = BLOCK_SIZES
            .iter()
            .position(|size| *size == self.size)
            .ok_or(GgError::InvalidParameters)?;
        if self.offset % self.size != 0 {
            return Err(GgError::InvalidParameters);
        }
        let number = (self.offset / self.size) as u32;
        Ok((number << 4) | (u32::from(self.more) << 3) | szx as u32)
    }
}

/// 分块负载来源。
pub trait CoapBlockSource: Send + Sync {
    /// 把期望的块尺寸收敛到实际剩余数据；返回（实际尺寸，是否还有后续）。
    fn get_data_size(&self, offset: usize, requested: usize) -> GgResult<(usize, bool)>;

    /// 把 `[offset, offset+size)` 的数据复制进 `dst`。
    fn get_data(&self, offset: usize, size: usize, dst: &mut [u8]) -> GgResult<()>;
}

/// 基于一段固定内存的块来源。
pub struct CoapMemoryBlockSource {
    data: Buffer,
}

impl CoapMemoryBlockSource {
    /// 以预加载数据构造。
    #[must_use]
    pub const fn new(data: Buffer) -> Self {
        Self { data }
    }
}

impl CoapBlockSource for CoapMemoryBlockSource {
    fn get_data_size(&self, offset: usize, requested: usize) -> GgResult<(usize, bool)> {
        if offset > self.data.len() {
            return Err(GgError::OutOfRange);
        }
        let remaining = self.data.len() - offset;
        if remaining <= requested {
            Ok((remaining, false))
        } else {
            Ok((requested, true))
        }
    }

    fn get_data(&self, offset: usize, size: usize, dst: &mut [u8]) -> GgResult<()> {
        if offset + size > self.data.len() || dst.len() < size {
            return Err(GgError::OutOfRange);
        }
        dst[..size].copy_from_slice(&self.data.as_slice()[offset..offset + size]);
        Ok(())
    }
}

/// 分块响应监听器。
pub trait CoapBlockwiseResponseListener: Send + Sync {
    /// 每收到一个响应块调用一次；最后一块（也只有最后一块）`more = false`。
    /// 聚合由监听器自理。
    fn on_response_block(&self, block_info: &CoapBlockInfo, message: &CoapMessage);

    /// 传输失败（超时或对端错误响应码）。
    fn on_error(&self, error: GgError, message: &str);
}

struct BlockwiseState {
    offset: usize,
    block_size: usize,
    handle: Option<CoapRequestHandle>,
    done: bool,
}

/// 一次进行中的分块请求（客户端侧状态机）。
pub struct CoapBlockwiseRequest {
    endpoint: Arc<CoapEndpoint>,
    method: CoapMethod,
    options: Vec<CoapOption>,
    payload_source: Option<Arc<dyn CoapBlockSource>>,
    destination: Option<SocketAddrV4>,
    listener: Weak<dyn CoapBlockwiseResponseListener>,
    state: Mutex<BlockwiseState>,
    weak_self: Weak<Self>,
}

/// 发起分块请求。
///
/// # 契约
/// - PUT/POST 需要 `payload_source`（逐块上传）；GET 不带来源（逐块下载）；
/// - `preferred_block_size` 必须属于 [`BLOCK_SIZES`]（0 取 1024）；
/// - 返回的状态机对象须由调用方持有至完成；释放即放弃传输。
pub fn send_blockwise_request(
    endpoint: &Arc<CoapEndpoint>,
    method: CoapMethod,
    options: Vec<CoapOption>,
    payload_source: Option<Arc<dyn CoapBlockSource>>,
    preferred_block_size: usize,
    destination: Option<SocketAddrV4>,
    listener: Weak<dyn CoapBlockwiseResponseListener>,
) -> GgResult<Arc<CoapBlockwiseRequest>> {
    let block_size = if preferred_block_size == 0 {
        1024
    } else {
        preferred_block_size
    };
    if !BLOCK_SIZES.contains(&block_size) {
        return Err(GgError::InvalidParameters);
    }
    if matches!(method, CoapMethod::Put | CoapMethod::Post) && payload_source.is_none() {
        return Err(GgError::InvalidParameters);
    }
    let request = Arc::new_cyclic(|weak_self| CoapBlockwiseRequest {
        endpoint: Arc::clone(endpoint),
        method,
        options,
        payload_source,
        destination,
        listener,
        state: Mutex::new(BlockwiseState {
            offset: 0,
            block_size,
            handle: None,
            done: false,
        }),
        weak_self: weak_self.clone(),
    });
    request.send_next_block()?;
    Ok(request)
}

impl CoapBlockwiseRequest {
    /// 放弃传输：取消挂起的底层请求。
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.done = true;
        if let Some(handle) = state.handle.take() {
            let _ = self.endpoint.cancel_request(handle);
        }
    }

    /// 传输是否已结束（成功或失败）。
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    fn send_next_block(&self) -> GgResult<()> {
        let (offset, block_size) = {
            let state = self.state.lock();
            if state.done {
                return Ok(());
            }
            (state.offset, state.block_size)
        };
        let mut request_options = self.options.clone();
        let mut payload = None;

        if let Some(source) = &self.payload_source {
            let (size, more) = source.get_data_size(offset, block_size)?;
            let mut data = vec![0u8; size];
            source.get_data(offset, size, &mut data)?;
            let block1 = CoapBlockInfo {
                offset,
                size: block_size,
                more,
            };
            request_options.push(CoapOption::uint(
                options::BLOCK1,
                block1.to_option_value()?,
            ));
            payload = Some(Buffer::from_vec(data));
        } else if offset > 0 {
            // GET 的后续块：显式要求下一个 Block2。
            let block2 = CoapBlockInfo {
                offset,
                size: block_size,
                more: false,
            };
            request_options.push(CoapOption::uint(
                options::BLOCK2,
                block2.to_option_value()?,
            ));
        }

        let listener: Weak<dyn CoapResponseListener> = self.weak_self.clone();
        let handle = self.endpoint.send_request(
            self.method,
            CoapMessageType::Confirmable,
            request_options,
            payload,
            self.destination,
            Some(CoapClientParameters::default()),
            listener,
        )?;
        // 响应可能已经同步到达并推进（甚至终结）了传输。
        let mut state = self.state.lock();
        if !state.done {
            state.handle = Some(handle);
        }
        Ok(())
    }

    fn fail(&self, error: GgError, message: &str) {
        self.state.lock().done = true;
        if let Some(listener) = self.listener.upgrade() {
            listener.on_error(error, message);
        }
    }

    fn deliver(&self, block_info: &CoapBlockInfo, message: &CoapMessage) {
        if let Some(listener) = self.listener.upgrade() {
            listener.on_response_block(block_info, message);
        }
    }
}

impl CoapResponseListener for CoapBlockwiseRequest {
    fn on_response(&self, response: &CoapMessage) {
        // 错误响应码：传输失败。
        if response.code_class() >= 4 {
            self.fail(
                GgError::CoapResponse(response.code),
                "blockwise transfer rejected",
            );
            return;
        }

        // 2.31 Continue：上传路径前进一块。
        if response.code == codes::CONTINUE {
            let advanced = {
                let mut state = self.state.lock();
                state.offset += state.block_size;
                !state.done
            };
            if advanced && let Err(error) = self.send_next_block() {
                self.fail(error, "failed to send next block");
            }
            return;
        }

        // 下载路径：响应携带 Block2。
        if let Some(value) = response.uint_option(options::BLOCK2) {
            let block2 = match CoapBlockInfo::from_option_value(value) {
                Ok(block2) => block2,
                Err(error) => {
                    self.fail(error, "invalid Block2 option in response");
                    return;
                }
            };
            self.deliver(&block2, response);
            if block2.more {
                {
                    let mut state = self.state.lock();
                    state.offset = block2.offset + block2.size;
                    state.block_size = block2.size;
                }
                if let Err(error) = self.send_next_block() {
                    self.fail(error, "failed to request next block");
                }
            } else {
                self.state.lock().done = true;
            }
            return;
        }

        // 无块选项的最终响应（上传完成的 2.04/2.01，或小负载一次到齐）。
        let block_info = {
            let mut state = self.state.lock();
            state.done = true;
            CoapBlockInfo {
                offset: state.offset,
                size: state.block_size,
                more: false,
            }
        };
        self.deliver(&block_info, response);
    }

    fn on_error(&self, error: GgError, message: &str) {
        self.fail(error, message);
    }
}

/// 服务端分块助手：跟踪一个资源的按序接收状态。
///
/// 处理器把每个请求先交给助手：乱序块被以 4.08 拒绝（附 Start-Offset
/// 指示期望偏移），客户端重发的上一块被识别为重发以便幂等作答。
pub struct CoapBlockwiseServerHelper {
    state: Mutex<HelperState>,
}

struct HelperState {
    next_offset: usize,
    etag: Option<Vec<u8>>,
    /// 最近一次接受的块（识别重发用）。
    last_block: Option<CoapBlockInfo>,
    block_info: CoapBlockInfo,
}

impl Default for CoapBlockwiseServerHelper {
    fn default() -> Self {
        Self::new()
    }
}

impl CoapBlockwiseServerHelper {
    /// 构造空状态助手。
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HelperState {
                next_offset: 0,
                etag: None,
                last_block: None,
                block_info: CoapBlockInfo {
                    offset: 0,
                    size: 0,
                    more: false,
                },
            }),
        }
    }

    /// 设置响应附带的 ETag（通常在第一块时生成会话标识）。
    pub fn set_etag(&self, etag: &[u8]) {
        self.state.lock().etag = Some(etag.to_vec());
    }

    /// 最近一次 `on_request` 解出的块信息。
    #[must_use]
    pub fn block_info(&self) -> CoapBlockInfo {
        self.state.lock().block_info
    }

    /// 校验请求的 Block1 顺序。
    ///
    /// # 返回
    /// - `Ok(false)`：按序的新块，处理器应消费负载；
    /// - `Ok(true)`：客户端重发的上一块，处理器应跳过消费、幂等作答；
    /// - `Err(CoapResponse(4.08))`：乱序，调用方把错误码原样作为响应。
    pub fn on_request(&self, request: &CoapMessage) -> GgResult<bool> {
        let block1 = match request.uint_option(options::BLOCK1) {
            Some(value) => CoapBlockInfo::from_option_value(value)?,
            // 无 Block1：整体即一块。
            None => CoapBlockInfo {
                offset: 0,
                size: request.payload.len().max(16),
                more: false,
            },
        };
        let mut state = self.state.lock();
        if block1.offset == 0 {
            // 新一轮传输从头开始。
            state.next_offset = 0;
            state.last_block = None;
        }
        if block1.offset == state.next_offset {
            state.block_info = block1;
            state.last_block = Some(block1);
            state.next_offset = block1.offset + request.payload.len();
            Ok(false)
        } else if state
            .last_block
            .is_some_and(|last| last.offset == block1.offset)
        {
            debug!(offset = block1.offset, "repeated block, idempotent reply");
            state.block_info = block1;
            Ok(true)
        } else {
            Err(GgError::CoapResponse(codes::REQUEST_ENTITY_INCOMPLETE))
        }
    }

    /// 按当前块状态构造响应：回显 Block1、附 ETag。
    #[must_use]
    pub fn create_response(&self, code: u8) -> CoapMessage {
        let state = self.state.lock();
        let mut response = CoapMessage::new(CoapMessageType::Acknowledgement, code, 0);
        if state.block_info.size != 0
            && let Ok(value) = state.block_info.to_option_value()
        {
            response.add_option(CoapOption::uint(options::BLOCK1, value));
        }
        if let Some(etag) = &state.etag {
            response.add_option(CoapOption {
                number: options::ETAG,
                value: crate::message::CoapOptionValue::Opaque(etag.clone()),
            });
        }
        // 乱序拒绝时带上期望偏移，支持断点续传。
        if code == codes::REQUEST_ENTITY_INCOMPLETE {
            response.add_option(CoapOption::uint(
                options::START_OFFSET,
                state.next_offset as u32,
            ));
        }
        response
    }

    /// 当前期望的下一个偏移。
    #[must_use]
    pub fn next_offset(&self) -> usize {
        self.state.lock().next_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_option_value_round_trips() {
        let info = CoapBlockInfo {
            offset: 5 * 256,
            size: 256,
            more: true,
        };
        let value = info.to_option_value().unwrap();
        assert_eq!(value, (5 << 4) | 0x8 | 4);
        assert_eq!(CoapBlockInfo::from_option_value(value).unwrap(), info);
    }

    #[test]
    fn only_the_seven_legal_sizes_are_accepted() {
        for (szx, size) in BLOCK_SIZES.iter().enumerate() {
            let info = CoapBlockInfo {
                offset: 0,
                size: *size,
                more: false,
            };
            assert_eq!(info.to_option_value().unwrap(), szx as u32);
        }
        let bad = CoapBlockInfo {
            offset: 0,
            size: 48,
            more: false,
        };
        assert_eq!(bad.to_option_value(), Err(GgError::InvalidParameters));
        // SZX=7 保留。
        assert_eq!(
            CoapBlockInfo::from_option_value(7),
            Err(GgError::InvalidParameters)
        );
    }

    #[test]
    fn memory_block_source_clamps_the_last_block() {
        let source = CoapMemoryBlockSource::new(Buffer::from_vec(vec![7u8; 100]));
        assert_eq!(source.get_data_size(0, 64).unwrap(), (64, true));
        assert_eq!(source.get_data_size(64, 64).unwrap(), (36, false));
        let mut dst = [0u8; 64];
        source.get_data(64, 36, &mut dst).unwrap();
        assert_eq!(&dst[..36], &[7u8; 36]);
        assert_eq!(source.get_data_size(101, 64), Err(GgError::OutOfRange));
    }

    #[test]
    fn server_helper_tracks_order_and_resends() {
        let helper = CoapBlockwiseServerHelper::new();
        let mut first = CoapMessage::new(CoapMessageType::Confirmable, codes::PUT, 1);
        first.add_option(CoapOption::uint(
            options::BLOCK1,
            CoapBlockInfo {
                offset: 0,
                size: 64,
                more: true,
            }
            .to_option_value()
            .unwrap(),
        ));
        first.payload = Buffer::from_vec(vec![0u8; 64]);
        assert_eq!(helper.on_request(&first).unwrap(), false);
        assert_eq!(helper.next_offset(), 64);

        // 同一块重来：识别为重发。
        assert_eq!(helper.on_request(&first).unwrap(), true);

        // 跳块：4.08。
        let mut out_of_order = CoapMessage::new(CoapMessageType::Confirmable, codes::PUT, 2);
        out_of_order.add_option(CoapOption::uint(
            options::BLOCK1,
            CoapBlockInfo {
                offset: 128,
                size: 64,
                more: true,
            }
            .to_option_value()
            .unwrap(),
        ));
        out_of_order.payload = Buffer::from_vec(vec![0u8; 64]);
        assert_eq!(
            helper.on_request(&out_of_order),
            Err(GgError::CoapResponse(codes::REQUEST_ENTITY_INCOMPLETE))
        );
        let rejection = helper.create_response(codes::REQUEST_ENTITY_INCOMPLETE);
        assert_eq!(rejection.uint_option(options::START_OFFSET), Some(64));
    }
}
