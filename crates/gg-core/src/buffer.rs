//! 缓冲原语：引用计数的只读字节段与发布前可变的动态缓冲。
//!
//! # 教案目的（Why）
//! - 管线各层以离散缓冲交换数据，同一份字节常被多个环节（重传队列、去重
//!   缓存、零拷贝视图）同时持有，引用计数是唯一不复制又不悬垂的所有权形态；
//! - 原始设计区分"static buffer"（包装调用方内存，retain/release 为空操作）
//!   与"dynamic buffer"（堆上可增长，发布后冻结）。Rust 侧以
//!   [`bytes::Bytes`]/[`bytes::BytesMut`] 一一对应：`Bytes` 的切片视图天然
//!   满足"子缓冲 retain 父缓冲"的不变量。
//!
//! # 契约说明（What）
//! - [`Buffer`] 对外只读；克隆只是引用计数递增；
//! - [`Buffer::sub_buffer`] 返回保留父缓冲的零拷贝视图；
//! - [`DynamicBuffer`] 在 `freeze` 之前可追加、可改写，`freeze` 之后进入
//!   共享只读世界，不再存在独占可变别名。

use core::ops::Range;

use bytes::{Bytes, BytesMut};

use crate::error::{GgError, GgResult};

/// 引用计数的只读字节段。
///
/// 释放最后一个克隆即释放底层存储；`data_size <= capacity` 的不变量由
/// `Bytes` 自身维护。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Bytes,
}

impl Buffer {
    /// 包装一段调用方拥有的静态内存，不发生分配。
    #[must_use]
    pub const fn from_static(data: &'static [u8]) -> Self {
        Self {
            data: Bytes::from_static(data),
        }
    }

    /// 获取数据所有权并构造缓冲。
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Bytes::from(data),
        }
    }

    /// 复制一份切片内容构造缓冲。
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            data: Bytes::copy_from_slice(data),
        }
    }

    /// 只读访问全部字节。
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 数据长度（字节）。
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否为空缓冲。
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 派生零拷贝子缓冲视图，保留对父缓冲存储的引用。
    ///
    /// # 契约
    /// - `range` 必须落在 `0..=len()` 内，否则返回 `InvalidParameters`；
    /// - 返回的视图与父缓冲共享存储，二者的生命周期互相独立。
    pub fn sub_buffer(&self, range: Range<usize>) -> GgResult<Self> {
        if range.start > range.end || range.end > self.data.len() {
            return Err(GgError::InvalidParameters);
        }
        Ok(Self {
            data: self.data.slice(range),
        })
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Self { data }
    }
}

impl From<Vec<u8>> for Buffer {
    fn from(data: Vec<u8>) -> Self {
        Self::from_vec(data)
    }
}

/// 发布前可变的堆缓冲；`freeze` 之后转为共享只读的 [`Buffer`]。
#[derive(Debug, Default)]
pub struct DynamicBuffer {
    data: BytesMut,
}

impl DynamicBuffer {
    /// 以给定初始容量构造。
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// 覆盖写入数据（替换现有内容）。
    pub fn set_data(&mut self, data: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(data);
    }

    /// 追加数据。
    pub fn append(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
    }

    /// 清空内容（容量保留）。
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// 当前数据长度。
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 是否为空。
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 只读访问当前内容。
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 冻结并发布为只读缓冲；此后不再存在可变别名。
    #[must_use]
    pub fn freeze(self) -> Buffer {
        Buffer {
            data: self.data.freeze(),
        }
    }
}
