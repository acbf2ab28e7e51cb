//! 四字符码（FourCC）原语。
//!
//! 栈内所有"类型标签"均以 4 个 ASCII 字符压缩为 `u32`：缓冲元数据类型
//! （`'srca'`/`'dsta'`）、事件类型（`'gls+'`、`'tlss'`……）与栈元素 ID
//! （`'gatt'`、`'neti'`……）。统一用 [`FourCc`] 承载，避免裸 `u32` 在日志
//! 与匹配逻辑中失去可读性。

use core::fmt;

/// 四字符码：大端序压缩的 4 字节 ASCII 标签。
///
/// # 契约说明（What）
/// - `new(*b"gls+")` 等价于 C 惯用的 `GG_4CC('g','l','s','+')`；
/// - 相同字符序列必然产生相同的 `u32`，可直接用于 `match` 与哈希键；
/// - `Display` 按原字符渲染，不可见字符以 `.` 代替，便于日志排障。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FourCc(u32);

impl FourCc {
    /// 由 4 个 ASCII 字符构造标签。
    #[must_use]
    pub const fn new(tag: [u8; 4]) -> Self {
        Self(
            ((tag[0] as u32) << 24) | ((tag[1] as u32) << 16) | ((tag[2] as u32) << 8)
                | (tag[3] as u32),
        )
    }

    /// 以原始 `u32` 构造（用于解码来自线缆或 FFI 的值）。
    #[must_use]
    pub const fn from_u32(value: u32) -> Self {
        Self(value)
    }

    /// 返回压缩后的 `u32` 值。
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// 还原为 4 字节序列。
    #[must_use]
    pub const fn to_bytes(self) -> [u8; 4] {
        [
            (self.0 >> 24) as u8,
            (self.0 >> 16) as u8,
            (self.0 >> 8) as u8,
            self.0 as u8,
        ]
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.to_bytes() {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn four_cc_round_trips_bytes() {
        let tag = FourCc::new(*b"gls+");
        assert_eq!(tag.to_bytes(), *b"gls+");
        assert_eq!(FourCc::from_u32(tag.as_u32()), tag);
    }

    #[test]
    fn four_cc_display_masks_non_printable() {
        assert_eq!(FourCc::new(*b"srca").to_string(), "srca");
        assert_eq!(FourCc::new([0x01, b'a', b'b', b'c']).to_string(), ".abc");
    }
}
