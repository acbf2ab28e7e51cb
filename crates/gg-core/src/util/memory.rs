//! 内存数据端点：吸收缓冲的 sink 与按块泵出的 source。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::buffer::{Buffer, DynamicBuffer};
use crate::error::{GgError, GgResult};
use crate::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};

struct MemorySinkState {
    received: DynamicBuffer,
    buffer_count: usize,
    last_metadata: Option<BufferMetadata>,
    blocking: bool,
}

/// 把收到的全部字节累积在内存里的 sink。
///
/// 测试里常用两种姿势：收集对端产出做断言；或用
/// [`set_blocking`](Self::set_blocking) 注入背压，再以
/// [`notify_can_put`](Self::notify_can_put) 验证 `on_can_put` 的补发路径。
pub struct MemoryDataSink {
    state: Mutex<MemorySinkState>,
    listener: Mutex<Option<Weak<dyn DataSinkListener>>>,
}

impl MemoryDataSink {
    /// 构造空 sink。
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemorySinkState {
                received: DynamicBuffer::default(),
                buffer_count: 0,
                last_metadata: None,
                blocking: false,
            }),
            listener: Mutex::new(None),
        })
    }

    /// 迄今累积的全部字节。
    #[must_use]
    pub fn received_bytes(&self) -> Vec<u8> {
        self.state.lock().received.as_slice().to_vec()
    }

    /// 迄今接收的缓冲个数。
    #[must_use]
    pub fn buffer_count(&self) -> usize {
        self.state.lock().buffer_count
    }

    /// 最近一次 `put_data` 附带的元数据。
    #[must_use]
    pub fn last_metadata(&self) -> Option<BufferMetadata> {
        self.state.lock().last_metadata
    }

    /// 开关背压注入：`true` 时 `put_data` 一律返回 `WouldBlock`。
    pub fn set_blocking(&self, blocking: bool) {
        self.state.lock().blocking = blocking;
    }

    /// 手动向注册的监听器补发 `on_can_put`。
    pub fn notify_can_put(&self) {
        if let Some(listener) = self.listener.lock().clone().and_then(|weak| weak.upgrade()) {
            listener.on_can_put();
        }
    }

    /// 清空累积状态。
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.received.clear();
        state.buffer_count = 0;
        state.last_metadata = None;
    }
}

impl DataSink for MemoryDataSink {
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()> {
        let mut state = self.state.lock();
        if state.blocking {
            return Err(GgError::WouldBlock);
        }
        state.received.append(data.as_slice());
        state.buffer_count += 1;
        state.last_metadata = metadata.copied();
        Ok(())
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        *self.listener.lock() = listener;
        Ok(())
    }
}

struct MemorySourceState {
    data: Buffer,
    offset: usize,
    chunk_size: usize,
}

/// 把一段预置数据按固定块大小泵给下游的 source。
///
/// 下游拒收时自动挂起，等它的 `on_can_put` 续泵。
pub struct MemoryDataSource {
    state: Mutex<MemorySourceState>,
    sink: Mutex<Option<Arc<dyn DataSink>>>,
    weak_self: Weak<Self>,
}

impl MemoryDataSource {
    /// 以数据与块大小（至少 1）构造。
    #[must_use]
    pub fn new(data: Buffer, chunk_size: usize) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            state: Mutex::new(MemorySourceState {
                data,
                offset: 0,
                chunk_size: chunk_size.max(1),
            }),
            sink: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    /// 开始（或继续）向下游泵送。
    pub fn start(&self) -> GgResult<()> {
        self.pump();
        Ok(())
    }

    /// 是否已全部送出。
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        let state = self.state.lock();
        state.offset >= state.data.len()
    }

    fn pump(&self) {
        loop {
            let Some(sink) = self.sink.lock().clone() else {
                return;
            };
            let chunk = {
                let state = self.state.lock();
                if state.offset >= state.data.len() {
                    return;
                }
                let end = (state.offset + state.chunk_size).min(state.data.len());
                match state.data.sub_buffer(state.offset..end) {
                    Ok(chunk) => chunk,
                    Err(_) => return,
                }
            };
            match sink.put_data(&chunk, None) {
                Ok(()) => {
                    let mut state = self.state.lock();
                    state.offset = (state.offset + state.chunk_size).min(state.data.len());
                }
                Err(error) if error.is_would_block() => return,
                Err(_) => return,
            }
        }
    }
}

impl DataSource for MemoryDataSource {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(previous) = self.sink.lock().take() {
            let _ = previous.set_listener(None);
        }
        if let Some(sink) = sink {
            let listener: Weak<dyn DataSinkListener> = self.weak_self.clone();
            sink.set_listener(Some(listener))?;
            *self.sink.lock() = Some(sink);
        }
        Ok(())
    }
}

impl DataSinkListener for MemoryDataSource {
    fn on_can_put(&self) {
        self.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_pumps_in_chunks_and_resumes_after_backpressure() {
        let source = MemoryDataSource::new(Buffer::from_slice(b"abcdefgh"), 3);
        let sink = MemoryDataSink::new();
        sink.set_blocking(true);
        source
            .set_data_sink(Some(sink.clone() as Arc<dyn DataSink>))
            .unwrap();
        source.start().unwrap();
        assert_eq!(sink.buffer_count(), 0);

        sink.set_blocking(false);
        sink.notify_can_put();
        assert_eq!(sink.received_bytes(), b"abcdefgh");
        assert_eq!(sink.buffer_count(), 3);
        assert!(source.is_exhausted());
    }
}
