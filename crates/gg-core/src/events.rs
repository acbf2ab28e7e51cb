//! 事件词汇表：4CC 事件类型、封闭数据枚举与发射/监听契约。
//!
//! 栈内元素（Gattlink、DTLS、活动监视器……）通过事件向宿主上报状态变化。
//! 每个事件携带一个 4 字符类型码；栈对象把子元素的事件用
//! [`EventData::Forward`] 包装后继续上抛，保留事件的来源元素 ID。

use std::sync::Weak;

use crate::fourcc::FourCc;

/// `'gls+'`：Gattlink 会话就绪。
pub const EVENT_TYPE_GATTLINK_SESSION_READY: FourCc = FourCc::new(*b"gls+");
/// `'gls-'`：Gattlink 会话被重置。
pub const EVENT_TYPE_GATTLINK_SESSION_RESET: FourCc = FourCc::new(*b"gls-");
/// `'prbr'`：Gattlink 链路质量探针报告。
pub const EVENT_TYPE_LINK_PROBE_REPORT: FourCc = FourCc::new(*b"prbr");
/// `'mtuc'`：链路 MTU 变化。
pub const EVENT_TYPE_LINK_MTU_CHANGE: FourCc = FourCc::new(*b"mtuc");
/// `'link'`：链路状态变化（由平台链路控制器发出）。
pub const EVENT_TYPE_LINK_STATUS_CHANGE: FourCc = FourCc::new(*b"link");
/// `'scan'`：扫描状态变化（由平台链路控制器发出）。
pub const EVENT_TYPE_SCAN_STATUS_CHANGE: FourCc = FourCc::new(*b"scan");
/// `'lscc'`：链路连接配置变化（由平台链路控制器发出）。
pub const EVENT_TYPE_LINK_STATUS_CONNECTION_CONFIG: FourCc = FourCc::new(*b"lscc");
/// `'tlss'`：DTLS 协议状态变化。
pub const EVENT_TYPE_TLS_STATE_CHANGE: FourCc = FourCc::new(*b"tlss");
/// `'amch'`：活动监视器活动状态翻转。
pub const EVENT_TYPE_ACTIVITY_MONITOR_CHANGE: FourCc = FourCc::new(*b"amch");
/// `'stkf'`：栈转发的子元素事件（包装原事件并保留来源）。
pub const EVENT_TYPE_STACK_EVENT_FORWARD: FourCc = FourCc::new(*b"stkf");

/// 活动监视器关注的数据方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityDirection {
    /// 自上而下（出站）。
    TopToBottom,
    /// 自下而上（入站）。
    BottomToTop,
}

/// 事件负载的封闭枚举。
///
/// 与缓冲元数据同理，按规格落为封闭和类型而非开放继承：事件消费方
/// 可以对全部变体做穷尽匹配，新增变体由编译器强制触达所有消费点。
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventData {
    /// 无额外负载。
    None,
    /// 链路 MTU 变为给定字节数。
    LinkMtuChange(u32),
    /// DTLS 状态迁移；负载为新状态的序号编码。
    TlsStateChange(u8),
    /// 某方向的活动状态翻转。
    ActivityChange {
        /// 方向。
        direction: ActivityDirection,
        /// 当前是否有数据活动。
        active: bool,
    },
    /// 链路吞吐探针的窗口统计。
    LinkProbeReport {
        /// 窗口内平均吞吐（字节/秒）。
        bytes_per_second: u32,
    },
    /// 栈转发的子元素事件。
    Forward {
        /// 事件来源元素的 4CC ID。
        element: FourCc,
        /// 被包装的原事件。
        event: Box<Event>,
    },
}

/// 一次事件：类型码加负载。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// 事件类型 4CC。
    pub event_type: FourCc,
    /// 事件负载。
    pub data: EventData,
}

impl Event {
    /// 构造无负载事件。
    #[must_use]
    pub const fn plain(event_type: FourCc) -> Self {
        Self {
            event_type,
            data: EventData::None,
        }
    }
}

/// 事件监听方。
pub trait EventListener: Send + Sync {
    /// 处理一个事件；在事件循环线程上被调用。
    fn on_event(&self, event: &Event);
}

/// 事件发射方：最多挂接一个监听器（弱引用）。
pub trait EventEmitter {
    /// 注册/注销事件监听器。
    fn set_event_listener(&self, listener: Option<Weak<dyn EventListener>>);
}
