//! 日志配置：`plist:` 配置串到 `tracing` 过滤器的翻译层。
//!
//! # 教案目的（Why）
//! - 宿主侧沿用分层点号命名与九级日志级别（OFF..ALL）的配置习惯：
//!   `plist:.level=INFO;.handlers=ConsoleHandler;foo.bar.level=FINE`；
//! - Rust 侧的观测基座是 `tracing`；本模块把上述配置串翻译为
//!   `tracing-subscriber` 的 `EnvFilter` 指令并安装控制台输出层，
//!   两个世界各自保持原生习惯。
//!
//! # 契约说明（What）
//! - 配置串必须以 `plist:` 前缀开头，否则返回 `InvalidSyntax`；
//! - 条目以 `;` 分隔；`<logger>.level=<LEVEL>` 设置某个记录器的级别，
//!   记录器名为空（条目形如 `.level=...`）表示根记录器；
//! - `.handlers=ConsoleHandler` 选择控制台输出；未知的 handler 与未知的
//!   键记一条 warning 后忽略；
//! - 级别映射：FATAL/SEVERE→ERROR，WARNING→WARN，INFO→INFO，FINE→DEBUG，
//!   FINER/FINEST/ALL→TRACE，OFF→off；
//! - 点号分层名翻译为模块路径（`foo.bar` → `foo::bar`）。

use tracing::warn;
use tracing_subscriber::EnvFilter;

use crate::error::{GgError, GgResult};

/// 配置串必须携带的前缀。
const CONFIG_PREFIX: &str = "plist:";
/// 未给出根级别时的缺省值。
const DEFAULT_ROOT_LEVEL: LogLevel = LogLevel::Warning;

/// 九级日志级别。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// 关闭全部输出。
    Off,
    /// 致命故障。
    Fatal,
    /// 严重故障。
    Severe,
    /// 告警。
    Warning,
    /// 常规信息。
    Info,
    /// 调试细节。
    Fine,
    /// 更细的调试细节。
    Finer,
    /// 最细调试细节。
    Finest,
    /// 全部输出。
    All,
}

impl LogLevel {
    /// 解析级别名（大小写不敏感）。
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "OFF" => Some(Self::Off),
            "FATAL" => Some(Self::Fatal),
            "SEVERE" => Some(Self::Severe),
            "WARNING" => Some(Self::Warning),
            "INFO" => Some(Self::Info),
            "FINE" => Some(Self::Fine),
            "FINER" => Some(Self::Finer),
            "FINEST" => Some(Self::Finest),
            "ALL" => Some(Self::All),
            _ => None,
        }
    }

    /// 对应的 `tracing` 级别指令片段。
    #[must_use]
    pub const fn as_tracing_directive(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Fatal | Self::Severe => "error",
            Self::Warning => "warn",
            Self::Info => "info",
            Self::Fine => "debug",
            Self::Finer | Self::Finest | Self::All => "trace",
        }
    }
}

/// 单条级别指令：记录器名（空串为根）加级别。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogDirective {
    /// 点号分层的记录器名；空串表示根记录器。
    pub logger: String,
    /// 该记录器的级别。
    pub level: LogLevel,
}

/// 解析后的日志配置。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogConfig {
    /// 全部级别指令，保持配置串中的出现顺序。
    pub directives: Vec<LogDirective>,
    /// `.handlers` 键列出的输出处理器名。
    pub handlers: Vec<String>,
}

impl LogConfig {
    /// 解析 `plist:` 配置串。
    pub fn parse(config: &str) -> GgResult<Self> {
        let body = config
            .strip_prefix(CONFIG_PREFIX)
            .ok_or(GgError::InvalidSyntax)?;
        let mut parsed = Self::default();
        for entry in body.split(';') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let (key, value) = entry.split_once('=').ok_or(GgError::InvalidSyntax)?;
            if let Some(logger) = key.strip_suffix(".level") {
                let level = LogLevel::parse(value).ok_or(GgError::InvalidSyntax)?;
                parsed.directives.push(LogDirective {
                    logger: logger.to_owned(),
                    level,
                });
            } else if key == ".handlers" {
                parsed
                    .handlers
                    .extend(value.split(',').map(|name| name.trim().to_owned()));
            } else {
                warn!(key, "ignoring unknown logging configuration key");
            }
        }
        Ok(parsed)
    }

    /// 翻译为 `EnvFilter` 指令串（根级别在前，子记录器覆盖在后）。
    #[must_use]
    pub fn env_filter_directives(&self) -> String {
        let mut root = DEFAULT_ROOT_LEVEL;
        let mut pieces: Vec<String> = Vec::new();
        for directive in &self.directives {
            if directive.logger.is_empty() {
                root = directive.level;
            } else {
                let target = directive.logger.replace('.', "::");
                pieces.push(format!(
                    "{}={}",
                    target,
                    directive.level.as_tracing_directive()
                ));
            }
        }
        let mut rendered = String::from(root.as_tracing_directive());
        for piece in pieces {
            rendered.push(',');
            rendered.push_str(&piece);
        }
        rendered
    }

    /// 安装为全局订阅器（fmt 控制台层 + 过滤器）。
    ///
    /// 已安装过全局订阅器时返回 `InvalidState`。
    pub fn install(&self) -> GgResult<()> {
        let filter = EnvFilter::new(self.env_filter_directives());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|_already_set| GgError::InvalidState)
    }
}

/// 按 `GG_LOG_CONFIG` 环境变量安装日志；未设置时采用缺省配置。
pub fn configure_from_env() -> GgResult<()> {
    let config = std::env::var("GG_LOG_CONFIG")
        .unwrap_or_else(|_| format!("{CONFIG_PREFIX}.level=INFO;.handlers=ConsoleHandler"));
    LogConfig::parse(&config)?.install()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_root_and_child_levels() {
        let config =
            LogConfig::parse("plist:.level=INFO;.handlers=ConsoleHandler;foo.bar.level=FINE")
                .unwrap();
        assert_eq!(config.directives.len(), 2);
        assert_eq!(config.handlers, vec!["ConsoleHandler".to_owned()]);
        assert_eq!(config.env_filter_directives(), "info,foo::bar=debug");
    }

    #[test]
    fn rejects_missing_prefix_and_bad_entries() {
        assert_eq!(
            LogConfig::parse(".level=INFO"),
            Err(GgError::InvalidSyntax)
        );
        assert_eq!(
            LogConfig::parse("plist:.level"),
            Err(GgError::InvalidSyntax)
        );
        assert_eq!(
            LogConfig::parse("plist:.level=LOUD"),
            Err(GgError::InvalidSyntax)
        );
    }

    #[test]
    fn default_root_level_is_warning() {
        let config = LogConfig::parse("plist:gg.coap.level=FINEST").unwrap();
        assert_eq!(config.env_filter_directives(), "warn,gg::coap=trace");
    }
}
