//! IPv4 + UDP 帧的序列化与装配。
//!
//! # 教案目的（Why）
//! - 穿越链路的每个数据报都是"20 字节 IP 头 + 8 字节 UDP 头 + 负载"的
//!   固定形态；序列化与解析配成一对，满足往返律：序列化再装配必须
//!   逐位还原负载、端口与地址；
//! - 解析端对畸形输入只分类、不恢复：调用方按传播策略丢弃并告警。
//!
//! # 契约说明（What）
//! - 出站：版本 4、IHL 5、TTL 255、协议 17；校验和只覆盖 IP 头
//!   （UDP 校验和恒为零）；identification 由调用方递增提供，回绕合法；
//! - 入站：校验版本、IHL ≥ 5、总长与缓冲一致、协议为 UDP、UDP 长度
//!   自洽；不验证头校验和（链路层已保证完整性，保持与出站端的最小
//!   实现对等）。

use std::net::{Ipv4Addr, SocketAddrV4};

use thiserror::Error;

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};

/// IP 头长度（无选项）。
pub const IP_HEADER_SIZE: usize = 20;
/// UDP 头长度。
pub const UDP_HEADER_SIZE: usize = 8;
/// 单个 IP 包的最大字节数。
pub const MAX_PACKET_SIZE: usize = 0xFFFF;
/// 单个数据报可携带的最大 UDP 负载。
pub const MAX_UDP_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - IP_HEADER_SIZE - UDP_HEADER_SIZE;

const IP_VERSION_4: u8 = 4;
const IP_PROTOCOL_UDP: u8 = 17;
const IP_DEFAULT_TTL: u8 = 255;

const TOTAL_LENGTH_OFFSET: usize = 2;
const IDENTIFICATION_OFFSET: usize = 4;
const TTL_OFFSET: usize = 8;
const PROTOCOL_OFFSET: usize = 9;
const CHECKSUM_OFFSET: usize = 10;
const SRC_ADDR_OFFSET: usize = 12;
const DST_ADDR_OFFSET: usize = 16;

const UDP_SRC_PORT_OFFSET: usize = 0;
const UDP_DST_PORT_OFFSET: usize = 2;
const UDP_LENGTH_OFFSET: usize = 4;

/// 入站 IP 包的解析失败分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Ipv4ParseError {
    /// 缓冲不足以容纳 IP 头。
    #[error("packet shorter than the IPv4 header")]
    TooShort,
    /// 版本号不是 4。
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    /// IHL 小于 5。
    #[error("IPv4 header length field below minimum")]
    HeaderTooShort,
    /// 总长字段与缓冲长度不一致。
    #[error("IPv4 total length does not match the buffer")]
    LengthMismatch,
    /// 协议不是 UDP。
    #[error("unsupported IP protocol {0}")]
    NotUdp(u8),
    /// UDP 头放不下。
    #[error("packet shorter than the UDP header")]
    TruncatedUdp,
    /// UDP 长度字段与 IP 总长不一致。
    #[error("UDP length does not match the IP payload")]
    UdpLengthMismatch,
}

/// 解析出的 UDP 数据报视图：地址对与负载在原缓冲内的区间。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedUdpPacket {
    /// 发送方地址与端口。
    pub source: SocketAddrV4,
    /// 接收方地址与端口。
    pub destination: SocketAddrV4,
    /// 负载起始偏移。
    pub payload_offset: usize,
    /// 负载长度。
    pub payload_len: usize,
}

/// IP 头校验和：对 16 位大端字求一补和后取反。
#[must_use]
fn header_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = header.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// 序列化一个 IP+UDP 数据报。
///
/// # 契约
/// - `payload` 超过 [`MAX_UDP_PAYLOAD_SIZE`] 返回 `InvalidParameters`；
/// - `identification` 由调用方维护递增，回绕属正常现象；
/// - UDP 校验和留零（IPv4 下可选）。
pub fn serialize_udp_packet(
    source: SocketAddrV4,
    destination: SocketAddrV4,
    identification: u16,
    payload: &[u8],
) -> GgResult<Buffer> {
    if payload.len() > MAX_UDP_PAYLOAD_SIZE {
        return Err(GgError::InvalidParameters);
    }
    let packet_size = IP_HEADER_SIZE + UDP_HEADER_SIZE + payload.len();
    let mut packet = vec![0u8; packet_size];

    // IP 头。
    packet[0] = (IP_VERSION_4 << 4) | ((IP_HEADER_SIZE / 4) as u8);
    packet[TOTAL_LENGTH_OFFSET..TOTAL_LENGTH_OFFSET + 2]
        .copy_from_slice(&(packet_size as u16).to_be_bytes());
    packet[IDENTIFICATION_OFFSET..IDENTIFICATION_OFFSET + 2]
        .copy_from_slice(&identification.to_be_bytes());
    packet[TTL_OFFSET] = IP_DEFAULT_TTL;
    packet[PROTOCOL_OFFSET] = IP_PROTOCOL_UDP;
    packet[SRC_ADDR_OFFSET..SRC_ADDR_OFFSET + 4].copy_from_slice(&source.ip().octets());
    packet[DST_ADDR_OFFSET..DST_ADDR_OFFSET + 4].copy_from_slice(&destination.ip().octets());
    let checksum = header_checksum(&packet[..IP_HEADER_SIZE]);
    packet[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 2].copy_from_slice(&checksum.to_be_bytes());

    // UDP 头与负载。
    let udp = &mut packet[IP_HEADER_SIZE..];
    udp[UDP_SRC_PORT_OFFSET..UDP_SRC_PORT_OFFSET + 2]
        .copy_from_slice(&source.port().to_be_bytes());
    udp[UDP_DST_PORT_OFFSET..UDP_DST_PORT_OFFSET + 2]
        .copy_from_slice(&destination.port().to_be_bytes());
    udp[UDP_LENGTH_OFFSET..UDP_LENGTH_OFFSET + 2]
        .copy_from_slice(&((UDP_HEADER_SIZE + payload.len()) as u16).to_be_bytes());
    udp[UDP_HEADER_SIZE..].copy_from_slice(payload);

    Ok(Buffer::from_vec(packet))
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_addr(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

/// 解析并校验一个 IP+UDP 数据报。
pub fn parse_udp_packet(packet: &[u8]) -> Result<ParsedUdpPacket, Ipv4ParseError> {
    if packet.len() < IP_HEADER_SIZE {
        return Err(Ipv4ParseError::TooShort);
    }
    let version = packet[0] >> 4;
    if version != IP_VERSION_4 {
        return Err(Ipv4ParseError::UnsupportedVersion(version));
    }
    let header_size = 4 * usize::from(packet[0] & 0x0F);
    if header_size < IP_HEADER_SIZE {
        return Err(Ipv4ParseError::HeaderTooShort);
    }
    let total_length = usize::from(read_u16(packet, TOTAL_LENGTH_OFFSET));
    if total_length != packet.len() || total_length < header_size {
        return Err(Ipv4ParseError::LengthMismatch);
    }
    let protocol = packet[PROTOCOL_OFFSET];
    if protocol != IP_PROTOCOL_UDP {
        return Err(Ipv4ParseError::NotUdp(protocol));
    }
    let udp_size = total_length - header_size;
    if udp_size < UDP_HEADER_SIZE {
        return Err(Ipv4ParseError::TruncatedUdp);
    }
    let udp = &packet[header_size..];
    let udp_length = usize::from(read_u16(udp, UDP_LENGTH_OFFSET));
    if udp_length != udp_size {
        return Err(Ipv4ParseError::UdpLengthMismatch);
    }

    Ok(ParsedUdpPacket {
        source: SocketAddrV4::new(
            read_addr(packet, SRC_ADDR_OFFSET),
            read_u16(udp, UDP_SRC_PORT_OFFSET),
        ),
        destination: SocketAddrV4::new(
            read_addr(packet, DST_ADDR_OFFSET),
            read_u16(udp, UDP_DST_PORT_OFFSET),
        ),
        payload_offset: header_size + UDP_HEADER_SIZE,
        payload_len: udp_size - UDP_HEADER_SIZE,
    })
}
