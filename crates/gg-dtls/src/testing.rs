//! 回环 PSK 测试引擎。
//!
//! 没有任何密码学强度：握手是两条明文消息（HELLO 携带身份与套件列表，
//! DONE 携带选中套件与密钥指纹），数据记录用密钥循环异或"加密"。
//! 它存在的意义是让协议元素与整栈测试在不绑定真实 TLS 库的情况下，
//! 走完握手状态机、密钥解析回调与双向数据路径。

use std::sync::Arc;

use gg_core::error::{GgError, GgResult};

use crate::engine::{
    DtlsClientOptions, DtlsEngine, DtlsEngineFactory, DtlsEngineOutput, DtlsEngineState,
    DtlsKeyResolver, DtlsServerOptions,
};

const RECORD_ALERT: u8 = 0x15;
const RECORD_HANDSHAKE: u8 = 0x16;
const RECORD_DATA: u8 = 0x17;

const HANDSHAKE_HELLO: u8 = 0x01;
const HANDSHAKE_DONE: u8 = 0x02;

/// 身份未被解析器认出。
pub const LOOPBACK_ERROR_UNKNOWN_IDENTITY: i32 = -1;
/// 双方密钥不一致（指纹校验失败）。
pub const LOOPBACK_ERROR_KEY_MISMATCH: i32 = -2;
/// 收到对端告警。
pub const LOOPBACK_ERROR_ALERT: i32 = -3;
/// 收到当前状态下不该出现的记录。
pub const LOOPBACK_ERROR_UNEXPECTED_RECORD: i32 = -4;
/// 双方没有共同的密码套件。
pub const LOOPBACK_ERROR_NO_COMMON_SUITE: i32 = -5;

fn key_tag(key: &[u8]) -> Vec<u8> {
    key.iter().map(|byte| byte ^ 0x5A).collect()
}

fn xor_with_key(key: &[u8], data: &[u8]) -> Vec<u8> {
    data.iter()
        .zip(key.iter().cycle())
        .map(|(byte, key_byte)| byte ^ key_byte)
        .collect()
}

fn alert(code: u8) -> Vec<u8> {
    vec![RECORD_ALERT, code]
}

fn failed(code: i32, records: Vec<Vec<u8>>) -> DtlsEngineOutput {
    DtlsEngineOutput {
        state: Some(DtlsEngineState::Failed(code)),
        records,
        plaintext: Vec::new(),
    }
}

enum LoopbackRole {
    Client {
        identity: Vec<u8>,
        key: Vec<u8>,
        cipher_suites: Vec<u16>,
    },
    Server {
        key_resolver: Arc<dyn DtlsKeyResolver>,
        cipher_suites: Vec<u16>,
        session_key: Option<Vec<u8>>,
    },
}

enum LoopbackPhase {
    Initial,
    AwaitingDone,
    AwaitingHello,
    Session,
    Failed,
}

/// 回环引擎本体。
pub struct LoopbackEngine {
    role: LoopbackRole,
    phase: LoopbackPhase,
}

impl LoopbackEngine {
    fn session_key(&self) -> Option<&[u8]> {
        match &self.role {
            LoopbackRole::Client { key, .. } => Some(key),
            LoopbackRole::Server { session_key, .. } => session_key.as_deref(),
        }
    }

    fn consume_hello(&mut self, body: &[u8]) -> DtlsEngineOutput {
        let LoopbackRole::Server {
            key_resolver,
            cipher_suites,
            session_key,
        } = &mut self.role
        else {
            self.phase = LoopbackPhase::Failed;
            return failed(LOOPBACK_ERROR_UNEXPECTED_RECORD, vec![alert(0x01)]);
        };
        // HELLO: [id_len, identity..., n_suites, suite(u16 BE)...]
        let parsed = (|| {
            let (&id_len, rest) = body.split_first()?;
            let identity = rest.get(..usize::from(id_len))?;
            let rest = &rest[usize::from(id_len)..];
            let (&suite_count, rest) = rest.split_first()?;
            let mut suites = Vec::new();
            for chunk in rest.get(..usize::from(suite_count) * 2)?.chunks_exact(2) {
                suites.push(u16::from_be_bytes([chunk[0], chunk[1]]));
            }
            Some((identity.to_vec(), suites))
        })();
        let Some((identity, client_suites)) = parsed else {
            self.phase = LoopbackPhase::Failed;
            return failed(LOOPBACK_ERROR_UNEXPECTED_RECORD, vec![alert(0x01)]);
        };
        let Some(chosen) = client_suites
            .iter()
            .find(|suite| cipher_suites.contains(suite))
        else {
            self.phase = LoopbackPhase::Failed;
            return failed(LOOPBACK_ERROR_NO_COMMON_SUITE, vec![alert(0x03)]);
        };
        let Some(key) = key_resolver.resolve_key(&identity) else {
            self.phase = LoopbackPhase::Failed;
            return failed(LOOPBACK_ERROR_UNKNOWN_IDENTITY, vec![alert(0x02)]);
        };
        // DONE: [suite u16 BE, tag...]
        let mut done = vec![RECORD_HANDSHAKE, HANDSHAKE_DONE];
        done.extend_from_slice(&chosen.to_be_bytes());
        done.extend_from_slice(&key_tag(&key));
        *session_key = Some(key);
        self.phase = LoopbackPhase::Session;
        DtlsEngineOutput {
            state: Some(DtlsEngineState::Session),
            records: vec![done],
            plaintext: Vec::new(),
        }
    }

    fn consume_done(&mut self, body: &[u8]) -> DtlsEngineOutput {
        let LoopbackRole::Client { key, .. } = &self.role else {
            self.phase = LoopbackPhase::Failed;
            return failed(LOOPBACK_ERROR_UNEXPECTED_RECORD, vec![alert(0x01)]);
        };
        if body.len() < 2 || body[2..] != key_tag(key)[..] {
            self.phase = LoopbackPhase::Failed;
            return failed(LOOPBACK_ERROR_KEY_MISMATCH, vec![alert(0x04)]);
        }
        self.phase = LoopbackPhase::Session;
        DtlsEngineOutput {
            state: Some(DtlsEngineState::Session),
            records: Vec::new(),
            plaintext: Vec::new(),
        }
    }
}

impl DtlsEngine for LoopbackEngine {
    fn start(&mut self) -> GgResult<DtlsEngineOutput> {
        match &self.role {
            LoopbackRole::Client {
                identity,
                cipher_suites,
                ..
            } => {
                let mut hello = vec![RECORD_HANDSHAKE, HANDSHAKE_HELLO];
                hello.push(identity.len() as u8);
                hello.extend_from_slice(identity);
                hello.push(cipher_suites.len() as u8);
                for suite in cipher_suites {
                    hello.extend_from_slice(&suite.to_be_bytes());
                }
                self.phase = LoopbackPhase::AwaitingDone;
                Ok(DtlsEngineOutput {
                    state: Some(DtlsEngineState::Handshaking),
                    records: vec![hello],
                    plaintext: Vec::new(),
                })
            }
            LoopbackRole::Server { .. } => {
                self.phase = LoopbackPhase::AwaitingHello;
                Ok(DtlsEngineOutput {
                    state: Some(DtlsEngineState::Handshaking),
                    records: Vec::new(),
                    plaintext: Vec::new(),
                })
            }
        }
    }

    fn consume_record(&mut self, record: &[u8]) -> GgResult<DtlsEngineOutput> {
        let Some((&record_type, body)) = record.split_first() else {
            return Err(GgError::InvalidParameters);
        };
        match record_type {
            RECORD_ALERT => {
                self.phase = LoopbackPhase::Failed;
                Ok(failed(LOOPBACK_ERROR_ALERT, Vec::new()))
            }
            RECORD_HANDSHAKE => {
                let Some((&handshake_type, body)) = body.split_first() else {
                    return Err(GgError::InvalidParameters);
                };
                match handshake_type {
                    HANDSHAKE_HELLO => Ok(self.consume_hello(body)),
                    HANDSHAKE_DONE => Ok(self.consume_done(body)),
                    _ => Err(GgError::InvalidParameters),
                }
            }
            RECORD_DATA => {
                if !matches!(self.phase, LoopbackPhase::Session) {
                    return Err(GgError::InvalidState);
                }
                let key = self.session_key().ok_or(GgError::InvalidState)?.to_vec();
                Ok(DtlsEngineOutput {
                    state: None,
                    records: Vec::new(),
                    plaintext: vec![xor_with_key(&key, body)],
                })
            }
            _ => Err(GgError::InvalidParameters),
        }
    }

    fn wrap(&mut self, plaintext: &[u8]) -> GgResult<Vec<u8>> {
        if !matches!(self.phase, LoopbackPhase::Session) {
            return Err(GgError::InvalidState);
        }
        let key = self.session_key().ok_or(GgError::InvalidState)?.to_vec();
        let mut record = vec![RECORD_DATA];
        record.extend_from_slice(&xor_with_key(&key, plaintext));
        Ok(record)
    }

    fn reset(&mut self) {
        self.phase = LoopbackPhase::Initial;
        if let LoopbackRole::Server { session_key, .. } = &mut self.role {
            *session_key = None;
        }
    }
}

/// 回环引擎工厂。
#[derive(Default)]
pub struct LoopbackEngineFactory;

impl DtlsEngineFactory for LoopbackEngineFactory {
    fn create_client(&self, options: &DtlsClientOptions) -> GgResult<Box<dyn DtlsEngine>> {
        Ok(Box::new(LoopbackEngine {
            role: LoopbackRole::Client {
                identity: options.identity.clone(),
                key: options.key.clone(),
                cipher_suites: options.cipher_suites.clone(),
            },
            phase: LoopbackPhase::Initial,
        }))
    }

    fn create_server(&self, options: &DtlsServerOptions) -> GgResult<Box<dyn DtlsEngine>> {
        Ok(Box::new(LoopbackEngine {
            role: LoopbackRole::Server {
                key_resolver: Arc::clone(&options.key_resolver),
                cipher_suites: options.cipher_suites.clone(),
                session_key: None,
            },
            phase: LoopbackPhase::Initial,
        }))
    }
}
