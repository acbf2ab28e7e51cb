//! CoAP 报文编解码（RFC 7252 二进制格式）。
//!
//! # 契约说明（What）
//! - 版本恒为 1；token 0..=8 字节；选项按编号升序做差分编码，编号相同的
//!   选项保持插入顺序（Uri-Path、Uri-Query 的语义依赖这一点）；
//! - 往返律：编码后解码必须复原同序的选项列表与逐位一致的负载；
//! - 解码端对畸形输入只分类报错，不尝试恢复。

use thiserror::Error;

use gg_core::buffer::Buffer;
use gg_core::error::{GgError, GgResult};

/// CoAP 默认 UDP 端口。
pub const COAP_DEFAULT_PORT: u16 = 5683;
/// 协议版本。
pub const COAP_VERSION: u8 = 1;
/// token 最大长度。
pub const COAP_MAX_TOKEN_LENGTH: usize = 8;

const PAYLOAD_MARKER: u8 = 0xFF;

/// 把 class.detail 压缩为单字节响应码。
#[must_use]
pub const fn code(class: u8, detail: u8) -> u8 {
    (class << 5) | (detail & 0x1F)
}

/// 常用报文码。
pub mod codes {
    use super::code;

    /// 空报文（纯 ACK / RST）。
    pub const EMPTY: u8 = 0;
    /// GET。
    pub const GET: u8 = code(0, 1);
    /// POST。
    pub const POST: u8 = code(0, 2);
    /// PUT。
    pub const PUT: u8 = code(0, 3);
    /// DELETE。
    pub const DELETE: u8 = code(0, 4);
    /// 2.01 Created。
    pub const CREATED: u8 = code(2, 1);
    /// 2.02 Deleted。
    pub const DELETED: u8 = code(2, 2);
    /// 2.03 Valid。
    pub const VALID: u8 = code(2, 3);
    /// 2.04 Changed。
    pub const CHANGED: u8 = code(2, 4);
    /// 2.05 Content。
    pub const CONTENT: u8 = code(2, 5);
    /// 2.31 Continue。
    pub const CONTINUE: u8 = code(2, 31);
    /// 4.00 Bad Request。
    pub const BAD_REQUEST: u8 = code(4, 0);
    /// 4.04 Not Found。
    pub const NOT_FOUND: u8 = code(4, 4);
    /// 4.05 Method Not Allowed。
    pub const METHOD_NOT_ALLOWED: u8 = code(4, 5);
    /// 4.08 Request Entity Incomplete。
    pub const REQUEST_ENTITY_INCOMPLETE: u8 = code(4, 8);
    /// 4.13 Request Entity Too Large。
    pub const REQUEST_ENTITY_TOO_LARGE: u8 = code(4, 13);
    /// 5.00 Internal Server Error。
    pub const INTERNAL_SERVER_ERROR: u8 = code(5, 0);
    /// 5.03 Service Unavailable。
    pub const SERVICE_UNAVAILABLE: u8 = code(5, 3);
}

/// 选项编号。
pub mod options {
    /// If-Match。
    pub const IF_MATCH: u16 = 1;
    /// Uri-Host。
    pub const URI_HOST: u16 = 3;
    /// ETag。
    pub const ETAG: u16 = 4;
    /// If-None-Match。
    pub const IF_NONE_MATCH: u16 = 5;
    /// Uri-Port。
    pub const URI_PORT: u16 = 7;
    /// Location-Path。
    pub const LOCATION_PATH: u16 = 8;
    /// Uri-Path。
    pub const URI_PATH: u16 = 11;
    /// Content-Format。
    pub const CONTENT_FORMAT: u16 = 12;
    /// Max-Age。
    pub const MAX_AGE: u16 = 14;
    /// Uri-Query。
    pub const URI_QUERY: u16 = 15;
    /// Accept。
    pub const ACCEPT: u16 = 17;
    /// Location-Query。
    pub const LOCATION_QUERY: u16 = 20;
    /// Block2（RFC 7959）。
    pub const BLOCK2: u16 = 23;
    /// Block1（RFC 7959）。
    pub const BLOCK1: u16 = 27;
    /// Size2。
    pub const SIZE2: u16 = 28;
    /// Proxy-Uri。
    pub const PROXY_URI: u16 = 35;
    /// Proxy-Scheme。
    pub const PROXY_SCHEME: u16 = 39;
    /// Size1。
    pub const SIZE1: u16 = 60;
    /// Start-Offset（实现保留编号：断点续传的起始偏移）。
    pub const START_OFFSET: u16 = 2048;
    /// Extended-Error（实现保留编号：5.xx 旁路的结构化错误码）。
    pub const EXTENDED_ERROR: u16 = 2049;
}

/// 报文类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapMessageType {
    /// CON：需要确认。
    Confirmable,
    /// NON：不需要确认。
    NonConfirmable,
    /// ACK：确认（可捎带响应）。
    Acknowledgement,
    /// RST：拒绝。
    Reset,
}

impl CoapMessageType {
    const fn as_bits(self) -> u8 {
        match self {
            Self::Confirmable => 0,
            Self::NonConfirmable => 1,
            Self::Acknowledgement => 2,
            Self::Reset => 3,
        }
    }

    const fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// 请求方法。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoapMethod {
    /// GET。
    Get,
    /// POST。
    Post,
    /// PUT。
    Put,
    /// DELETE。
    Delete,
}

impl CoapMethod {
    /// 对应的报文码。
    #[must_use]
    pub const fn as_code(self) -> u8 {
        match self {
            Self::Get => codes::GET,
            Self::Post => codes::POST,
            Self::Put => codes::PUT,
            Self::Delete => codes::DELETE,
        }
    }

    /// 从报文码还原方法。
    #[must_use]
    pub const fn from_code(value: u8) -> Option<Self> {
        match value {
            _ if value == codes::GET => Some(Self::Get),
            _ if value == codes::POST => Some(Self::Post),
            _ if value == codes::PUT => Some(Self::Put),
            _ if value == codes::DELETE => Some(Self::Delete),
            _ => None,
        }
    }
}

/// 0..=8 字节的请求/响应关联 token。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CoapToken {
    bytes: [u8; COAP_MAX_TOKEN_LENGTH],
    length: u8,
}

impl CoapToken {
    /// 从切片构造；超长返回 `InvalidParameters`。
    pub fn new(bytes: &[u8]) -> GgResult<Self> {
        if bytes.len() > COAP_MAX_TOKEN_LENGTH {
            return Err(GgError::InvalidParameters);
        }
        let mut token = Self::default();
        token.bytes[..bytes.len()].copy_from_slice(bytes);
        token.length = bytes.len() as u8;
        Ok(token)
    }

    /// token 字节。
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..usize::from(self.length)]
    }

    /// token 长度。
    #[must_use]
    pub const fn len(&self) -> usize {
        self.length as usize
    }

    /// 是否为空 token。
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// 选项值的四种类型。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoapOptionValue {
    /// 空选项。
    Empty,
    /// 无符号整数（编码为最短大端字节串）。
    Uint(u32),
    /// UTF-8 字符串。
    String(String),
    /// 不透明字节串。
    Opaque(Vec<u8>),
}

/// 一个选项：编号加值。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    /// 选项编号。
    pub number: u16,
    /// 选项值。
    pub value: CoapOptionValue,
}

impl CoapOption {
    /// 构造 uint 选项。
    #[must_use]
    pub const fn uint(number: u16, value: u32) -> Self {
        Self {
            number,
            value: CoapOptionValue::Uint(value),
        }
    }

    /// 构造字符串选项。
    #[must_use]
    pub fn string(number: u16, value: &str) -> Self {
        Self {
            number,
            value: CoapOptionValue::String(value.to_owned()),
        }
    }

    /// 把 `a/b/c` 形式的路径拆成一串 Uri-Path 选项。
    #[must_use]
    pub fn uri_path_segments(path: &str) -> Vec<Self> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .map(|segment| Self::string(options::URI_PATH, segment))
            .collect()
    }

    fn encoded_value(&self) -> Vec<u8> {
        match &self.value {
            CoapOptionValue::Empty => Vec::new(),
            CoapOptionValue::Uint(value) => {
                let bytes = value.to_be_bytes();
                let skip = bytes.iter().take_while(|byte| **byte == 0).count();
                bytes[skip..].to_vec()
            }
            CoapOptionValue::String(value) => value.as_bytes().to_vec(),
            CoapOptionValue::Opaque(value) => value.clone(),
        }
    }
}

/// 已知编号的取值类型表（解码时用）。
fn value_type_of(number: u16) -> ValueType {
    use options::*;
    match number {
        IF_NONE_MATCH => ValueType::Empty,
        URI_PORT | CONTENT_FORMAT | MAX_AGE | ACCEPT | BLOCK1 | BLOCK2 | SIZE1 | SIZE2
        | START_OFFSET | EXTENDED_ERROR => ValueType::Uint,
        URI_HOST | LOCATION_PATH | URI_PATH | URI_QUERY | LOCATION_QUERY | PROXY_URI
        | PROXY_SCHEME => ValueType::String,
        _ => ValueType::Opaque,
    }
}

enum ValueType {
    Empty,
    Uint,
    String,
    Opaque,
}

/// 解码失败分类。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CoapMessageError {
    /// 报文短于固定头。
    #[error("message shorter than the fixed header")]
    TooShort,
    /// 版本不是 1。
    #[error("unsupported CoAP version")]
    UnsupportedVersion,
    /// TKL 超过 8 或 token 被截断。
    #[error("invalid token length")]
    InvalidToken,
    /// 选项差分编码非法（保留 nibble、越界等）。
    #[error("malformed option encoding")]
    MalformedOption,
    /// 负载标记后没有负载。
    #[error("payload marker with empty payload")]
    EmptyPayload,
}

/// 一条 CoAP 报文。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapMessage {
    /// 报文类型。
    pub message_type: CoapMessageType,
    /// 报文码（class.detail）。
    pub code: u8,
    /// 16 位报文 ID。
    pub message_id: u16,
    /// 关联 token。
    pub token: CoapToken,
    options: Vec<CoapOption>,
    /// 负载。
    pub payload: Buffer,
}

impl CoapMessage {
    /// 构造无选项、无负载的报文。
    #[must_use]
    pub fn new(message_type: CoapMessageType, code: u8, message_id: u16) -> Self {
        Self {
            message_type,
            code,
            message_id,
            token: CoapToken::default(),
            options: Vec::new(),
            payload: Buffer::default(),
        }
    }

    /// 报文码的 class 部分。
    #[must_use]
    pub const fn code_class(&self) -> u8 {
        self.code >> 5
    }

    /// 是否是请求（class 0 且非空码）。
    #[must_use]
    pub const fn is_request(&self) -> bool {
        self.code_class() == 0 && self.code != codes::EMPTY
    }

    /// 是否是响应（class ≥ 2）。
    #[must_use]
    pub const fn is_response(&self) -> bool {
        self.code_class() >= 2
    }

    /// 追加一个选项（保持插入顺序；编码时稳定排序）。
    pub fn add_option(&mut self, option: CoapOption) {
        self.options.push(option);
    }

    /// 链式追加选项。
    #[must_use]
    pub fn with_option(mut self, option: CoapOption) -> Self {
        self.add_option(option);
        self
    }

    /// 按编号升序迭代全部选项（同编号保持插入顺序）。
    pub fn options(&self) -> impl Iterator<Item = &CoapOption> {
        let mut ordered: Vec<&CoapOption> = self.options.iter().collect();
        ordered.sort_by_key(|option| option.number);
        ordered.into_iter()
    }

    /// 只迭代指定编号的选项。
    pub fn options_filtered(&self, number: u16) -> impl Iterator<Item = &CoapOption> {
        self.options
            .iter()
            .filter(move |option| option.number == number)
    }

    /// 第一个指定编号选项的 uint 值。
    #[must_use]
    pub fn uint_option(&self, number: u16) -> Option<u32> {
        self.options_filtered(number).find_map(|option| match &option.value {
            CoapOptionValue::Uint(value) => Some(*value),
            _ => None,
        })
    }

    /// 拼接全部 Uri-Path 选项为 `a/b/c` 形式。
    #[must_use]
    pub fn uri_path(&self) -> String {
        let mut path = String::new();
        for option in self.options() {
            if option.number == options::URI_PATH
                && let CoapOptionValue::String(segment) = &option.value
            {
                if !path.is_empty() {
                    path.push('/');
                }
                path.push_str(segment);
            }
        }
        path
    }

    /// 编码为线上字节。
    pub fn encode(&self) -> GgResult<Buffer> {
        if self.token.len() > COAP_MAX_TOKEN_LENGTH {
            return Err(GgError::InvalidParameters);
        }
        let mut out = Vec::with_capacity(4 + self.token.len() + self.payload.len() + 16);
        out.push(
            (COAP_VERSION << 6) | (self.message_type.as_bits() << 4) | (self.token.len() as u8),
        );
        out.push(self.code);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.extend_from_slice(self.token.as_slice());

        let mut previous_number: u16 = 0;
        for option in self.options() {
            let value = option.encoded_value();
            let delta = option.number - previous_number;
            previous_number = option.number;
            let (delta_nibble, delta_ext) = encode_option_field(u32::from(delta));
            let (length_nibble, length_ext) = encode_option_field(value.len() as u32);
            out.push((delta_nibble << 4) | length_nibble);
            out.extend_from_slice(&delta_ext);
            out.extend_from_slice(&length_ext);
            out.extend_from_slice(&value);
        }

        if !self.payload.is_empty() {
            out.push(PAYLOAD_MARKER);
            out.extend_from_slice(self.payload.as_slice());
        }
        Ok(Buffer::from_vec(out))
    }

    /// 从线上字节解码。
    pub fn decode(data: &[u8]) -> Result<Self, CoapMessageError> {
        if data.len() < 4 {
            return Err(CoapMessageError::TooShort);
        }
        if data[0] >> 6 != COAP_VERSION {
            return Err(CoapMessageError::UnsupportedVersion);
        }
        let message_type = CoapMessageType::from_bits(data[0] >> 4);
        let token_length = usize::from(data[0] & 0x0F);
        if token_length > COAP_MAX_TOKEN_LENGTH || data.len() < 4 + token_length {
            return Err(CoapMessageError::InvalidToken);
        }
        let code = data[1];
        let message_id = u16::from_be_bytes([data[2], data[3]]);
        let token =
            CoapToken::new(&data[4..4 + token_length]).map_err(|_| CoapMessageError::InvalidToken)?;

        let mut options = Vec::new();
        let mut cursor = 4 + token_length;
        let mut current_number: u16 = 0;
        let mut payload = Buffer::default();
        while cursor < data.len() {
            if data[cursor] == PAYLOAD_MARKER {
                if cursor + 1 >= data.len() {
                    return Err(CoapMessageError::EmptyPayload);
                }
                payload = Buffer::from_slice(&data[cursor + 1..]);
                break;
            }
            let byte = data[cursor];
            cursor += 1;
            let delta = decode_option_field(byte >> 4, data, &mut cursor)?;
            let length = decode_option_field(byte & 0x0F, data, &mut cursor)?;
            let length = length as usize;
            let next_number = u32::from(current_number) + delta;
            if next_number > u32::from(u16::MAX) {
                return Err(CoapMessageError::MalformedOption);
            }
            current_number = next_number as u16;
            if cursor + length > data.len() {
                return Err(CoapMessageError::MalformedOption);
            }
            let raw = &data[cursor..cursor + length];
            cursor += length;
            let value = match value_type_of(current_number) {
                ValueType::Empty if raw.is_empty() => CoapOptionValue::Empty,
                ValueType::Empty => CoapOptionValue::Opaque(raw.to_vec()),
                ValueType::Uint => {
                    if raw.len() > 4 {
                        return Err(CoapMessageError::MalformedOption);
                    }
                    let mut value: u32 = 0;
                    for &byte in raw {
                        value = (value << 8) | u32::from(byte);
                    }
                    CoapOptionValue::Uint(value)
                }
                ValueType::String => match std::str::from_utf8(raw) {
                    Ok(text) => CoapOptionValue::String(text.to_owned()),
                    Err(_) => return Err(CoapMessageError::MalformedOption),
                },
                ValueType::Opaque => CoapOptionValue::Opaque(raw.to_vec()),
            };
            options.push(CoapOption {
                number: current_number,
                value,
            });
        }

        Ok(Self {
            message_type,
            code,
            message_id,
            token,
            options,
            payload,
        })
    }
}

/// 差分字段编码：返回（nibble，扩展字节）。
fn encode_option_field(value: u32) -> (u8, Vec<u8>) {
    if value < 13 {
        (value as u8, Vec::new())
    } else if value < 269 {
        (13, vec![(value - 13) as u8])
    } else {
        (14, ((value - 269) as u16).to_be_bytes().to_vec())
    }
}

fn decode_option_field(
    nibble: u8,
    data: &[u8],
    cursor: &mut usize,
) -> Result<u32, CoapMessageError> {
    match nibble {
        0..=12 => Ok(u32::from(nibble)),
        13 => {
            let byte = *data.get(*cursor).ok_or(CoapMessageError::MalformedOption)?;
            *cursor += 1;
            Ok(u32::from(byte) + 13)
        }
        14 => {
            if *cursor + 2 > data.len() {
                return Err(CoapMessageError::MalformedOption);
            }
            let value = u16::from_be_bytes([data[*cursor], data[*cursor + 1]]);
            *cursor += 2;
            Ok(u32::from(value) + 269)
        }
        _ => Err(CoapMessageError::MalformedOption),
    }
}
