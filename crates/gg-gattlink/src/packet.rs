//! Gattlink 包的线格式。
//!
//! # 线格式（What）
//! 首字节按位划分：
//!
//! ```text
//! bit 7     ACK 在场
//! bit 6     数据在场
//! bit 5     控制包标记
//! bit 4..0  序号字段：ACK 在场时为 ASN，否则为 PSN
//! ```
//!
//! - 仅数据：`[0b010_psn, payload...]`；
//! - 仅确认：`[0b100_asn]`；
//! - 确认捎带数据：`[0b110_asn, psn, payload...]`（次字节低 5 bit 为 PSN）；
//! - 控制包：`[0b001_00000, 控制类型, 协议版本]`。控制类型只有会话重置
//!   一族：重置请求（发起方周期重发）与重置同意（应答方宣告"以 PSN=0
//!   重新开始"的合意）。
//!
//! 序号空间为 mod 32；ASN 的含义是"已按序收到的最后一个 PSN"，即
//! 下一个期望 PSN 减一。

use thiserror::Error;

/// 序号模数（5 bit 序号空间）。
pub const SEQUENCE_MODULO: u8 = 32;
/// 当前协议版本。
pub const PROTOCOL_VERSION: u8 = 1;

const FLAG_ACK: u8 = 0b1000_0000;
const FLAG_DATA: u8 = 0b0100_0000;
const FLAG_CONTROL: u8 = 0b0010_0000;
const SEQUENCE_MASK: u8 = 0b0001_1111;

const CONTROL_TYPE_RESET_REQUEST: u8 = 1;
const CONTROL_TYPE_RESET_ACCEPT: u8 = 2;

/// 序号加一（mod 32）。
#[must_use]
pub const fn sequence_increment(sequence: u8) -> u8 {
    (sequence + 1) & SEQUENCE_MASK
}

/// 序号减一（mod 32）。
#[must_use]
pub const fn sequence_decrement(sequence: u8) -> u8 {
    sequence.wrapping_sub(1) & SEQUENCE_MASK
}

/// 环形距离：从 `from` 数到 `to` 需要前进多少步（mod 32）。
#[must_use]
pub const fn sequence_distance(from: u8, to: u8) -> u8 {
    to.wrapping_sub(from) & SEQUENCE_MASK
}

/// 入站包的解析失败分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GattlinkParseError {
    /// 空缓冲。
    #[error("empty packet")]
    Empty,
    /// 头部标志组合非法。
    #[error("invalid header flags")]
    InvalidFlags,
    /// 控制包长度或类型非法。
    #[error("malformed control packet")]
    MalformedControl,
    /// 捎带数据包缺少 PSN 字节。
    #[error("truncated packet header")]
    Truncated,
}

/// 解析后的包视图（负载借用原缓冲）。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattlinkPdu<'a> {
    /// 会话重置请求。
    ResetRequest {
        /// 对端宣告的协议版本。
        version: u8,
    },
    /// 会话重置同意（双方以 PSN=0 重新开始）。
    ResetAccept {
        /// 对端宣告的协议版本。
        version: u8,
    },
    /// 仅确认。
    Ack {
        /// 已按序收到的最后一个 PSN。
        asn: u8,
    },
    /// 数据（可捎带确认）。
    Data {
        /// 捎带的 ASN。
        ack: Option<u8>,
        /// 本包的序号。
        psn: u8,
        /// 用户字节流片段。
        payload: &'a [u8],
    },
}

/// 编码会话重置请求。
#[must_use]
pub const fn encode_reset_request() -> [u8; 3] {
    [FLAG_CONTROL, CONTROL_TYPE_RESET_REQUEST, PROTOCOL_VERSION]
}

/// 编码会话重置同意。
#[must_use]
pub const fn encode_reset_accept() -> [u8; 3] {
    [FLAG_CONTROL, CONTROL_TYPE_RESET_ACCEPT, PROTOCOL_VERSION]
}

/// 编码仅确认包。
#[must_use]
pub const fn encode_ack(asn: u8) -> [u8; 1] {
    [FLAG_ACK | (asn & SEQUENCE_MASK)]
}

/// 编码数据包头；返回（头字节，头长度）。
///
/// 负载紧随头部，调用方自行拼接。
#[must_use]
pub fn encode_data_header(ack: Option<u8>, psn: u8) -> ([u8; 2], usize) {
    match ack {
        Some(asn) => (
            [
                FLAG_ACK | FLAG_DATA | (asn & SEQUENCE_MASK),
                psn & SEQUENCE_MASK,
            ],
            2,
        ),
        None => ([FLAG_DATA | (psn & SEQUENCE_MASK), 0], 1),
    }
}

/// 数据包头占用的字节数。
#[must_use]
pub const fn data_header_size(with_ack: bool) -> usize {
    if with_ack { 2 } else { 1 }
}

/// 解析一个完整的 Gattlink 包。
pub fn parse(packet: &[u8]) -> Result<GattlinkPdu<'_>, GattlinkParseError> {
    let Some(&header) = packet.first() else {
        return Err(GattlinkParseError::Empty);
    };
    if header & FLAG_CONTROL != 0 {
        if header & (FLAG_ACK | FLAG_DATA) != 0 {
            return Err(GattlinkParseError::InvalidFlags);
        }
        if packet.len() < 3 {
            return Err(GattlinkParseError::MalformedControl);
        }
        return match packet[1] {
            CONTROL_TYPE_RESET_REQUEST => Ok(GattlinkPdu::ResetRequest { version: packet[2] }),
            CONTROL_TYPE_RESET_ACCEPT => Ok(GattlinkPdu::ResetAccept { version: packet[2] }),
            _ => Err(GattlinkParseError::MalformedControl),
        };
    }
    match (header & FLAG_ACK != 0, header & FLAG_DATA != 0) {
        (true, false) => Ok(GattlinkPdu::Ack {
            asn: header & SEQUENCE_MASK,
        }),
        (false, true) => Ok(GattlinkPdu::Data {
            ack: None,
            psn: header & SEQUENCE_MASK,
            payload: &packet[1..],
        }),
        (true, true) => {
            let Some(&psn_byte) = packet.get(1) else {
                return Err(GattlinkParseError::Truncated);
            };
            Ok(GattlinkPdu::Data {
                ack: Some(header & SEQUENCE_MASK),
                psn: psn_byte & SEQUENCE_MASK,
                payload: &packet[2..],
            })
        }
        (false, false) => Err(GattlinkParseError::InvalidFlags),
    }
}

/// 向缓冲追加一个 LEB128 变长整数（7 bit 一组，0x80 为续位）。
pub fn encode_varint(mut value: usize, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// 解码变长整数；返回（值，消耗的字节数），数据不完整时返回 `None`。
#[must_use]
pub fn decode_varint(data: &[u8]) -> Option<(usize, usize)> {
    let mut value: usize = 0;
    for (index, &byte) in data.iter().enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * index);
        if byte & 0x80 == 0 {
            return Some((value, index + 1));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn data_packet_round_trips() {
        let (header, header_len) = encode_data_header(None, 5);
        let mut packet = header[..header_len].to_vec();
        packet.extend_from_slice(b"abc");
        assert_eq!(
            parse(&packet),
            Ok(GattlinkPdu::Data {
                ack: None,
                psn: 5,
                payload: b"abc",
            })
        );
    }

    #[test]
    fn piggybacked_ack_round_trips() {
        let (header, header_len) = encode_data_header(Some(31), 0);
        let mut packet = header[..header_len].to_vec();
        packet.extend_from_slice(b"xy");
        assert_eq!(
            parse(&packet),
            Ok(GattlinkPdu::Data {
                ack: Some(31),
                psn: 0,
                payload: b"xy",
            })
        );
    }

    #[test]
    fn ack_and_reset_round_trip() {
        assert_eq!(parse(&encode_ack(17)), Ok(GattlinkPdu::Ack { asn: 17 }));
        assert_eq!(
            parse(&encode_reset_request()),
            Ok(GattlinkPdu::ResetRequest {
                version: PROTOCOL_VERSION,
            })
        );
        assert_eq!(
            parse(&encode_reset_accept()),
            Ok(GattlinkPdu::ResetAccept {
                version: PROTOCOL_VERSION,
            })
        );
    }

    #[test]
    fn malformed_packets_are_rejected() {
        assert_eq!(parse(&[]), Err(GattlinkParseError::Empty));
        assert_eq!(parse(&[0x00]), Err(GattlinkParseError::InvalidFlags));
        assert_eq!(parse(&[0b0010_0000]), Err(GattlinkParseError::MalformedControl));
        assert_eq!(parse(&[0b1100_0001]), Err(GattlinkParseError::Truncated));
    }

    #[test]
    fn sequence_arithmetic_wraps_at_32() {
        assert_eq!(sequence_increment(31), 0);
        assert_eq!(sequence_decrement(0), 31);
        assert_eq!(sequence_distance(30, 2), 4);
        assert_eq!(sequence_distance(2, 2), 0);
    }

    proptest! {
        #[test]
        fn varint_round_trips(value in 0usize..=usize::from(u16::MAX) * 64) {
            let mut encoded = Vec::new();
            encode_varint(value, &mut encoded);
            prop_assert_eq!(decode_varint(&encoded), Some((value, encoded.len())));
        }

        #[test]
        fn truncated_varint_is_incomplete(value in 128usize..1_000_000) {
            let mut encoded = Vec::new();
            encode_varint(value, &mut encoded);
            prop_assert!(decode_varint(&encoded[..encoded.len() - 1]).is_none());
        }
    }
}
