//! 活动监视器：透传元素，按方向侦测数据活动的起落。
//!
//! 任一方向出现数据即标记该方向活跃并发出 `'amch'` 事件；超过配置的
//! 静默时长没有新数据则翻转回不活跃再发一次事件。数据与背压原样透传，
//! 监视器对管线语义完全中立。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use gg_core::buffer::Buffer;
use gg_core::error::GgResult;
use gg_core::events::{
    ActivityDirection, EVENT_TYPE_ACTIVITY_MONITOR_CHANGE, Event, EventData, EventEmitter,
    EventListener,
};
use gg_core::io::{BufferMetadata, DataSink, DataSinkListener, DataSource};
use gg_core::timer::{Timer, TimerId, TimerListener, TimerScheduler};

struct DirectionState {
    active: bool,
    /// 尚未应用到下游 sink 的监听器注册。
    pending_listener: Option<Weak<dyn DataSinkListener>>,
}

struct MonitorInner {
    inactivity_timeout: u64,
    down_state: Mutex<DirectionState>,
    up_state: Mutex<DirectionState>,
    /// 向下转发的目标（下方元素的顶部 sink）。
    down_sink: Mutex<Option<Arc<dyn DataSink>>>,
    /// 向上转发的目标（上方元素的底部 sink）。
    up_sink: Mutex<Option<Arc<dyn DataSink>>>,
    down_timer: Timer,
    up_timer: Timer,
    event_listener: Mutex<Option<Weak<dyn EventListener>>>,
    timer_relay: Arc<MonitorTimerRelay>,
}

struct MonitorTimerRelay {
    inner: Mutex<Weak<MonitorInner>>,
}

impl TimerListener for MonitorTimerRelay {
    fn on_timer_fired(&self, timer_id: TimerId, _elapsed: u64) {
        let Some(inner) = self.inner.lock().upgrade() else {
            return;
        };
        if timer_id == inner.down_timer.id() {
            inner.mark_inactive(ActivityDirection::TopToBottom);
        } else if timer_id == inner.up_timer.id() {
            inner.mark_inactive(ActivityDirection::BottomToTop);
        }
    }
}

impl MonitorInner {
    fn direction_state(&self, direction: ActivityDirection) -> &Mutex<DirectionState> {
        match direction {
            ActivityDirection::TopToBottom => &self.down_state,
            ActivityDirection::BottomToTop => &self.up_state,
        }
    }

    fn direction_timer(&self, direction: ActivityDirection) -> &Timer {
        match direction {
            ActivityDirection::TopToBottom => &self.down_timer,
            ActivityDirection::BottomToTop => &self.up_timer,
        }
    }

    fn emit(&self, direction: ActivityDirection, active: bool) {
        if let Some(listener) = self
            .event_listener
            .lock()
            .clone()
            .and_then(|weak| weak.upgrade())
        {
            listener.on_event(&Event {
                event_type: EVENT_TYPE_ACTIVITY_MONITOR_CHANGE,
                data: EventData::ActivityChange { direction, active },
            });
        }
    }

    /// 数据经过：必要时翻转为活跃并重置静默计时。
    fn note_activity(&self, direction: ActivityDirection, relay: &Arc<MonitorTimerRelay>) {
        let became_active = {
            let mut state = self.direction_state(direction).lock();
            if state.active {
                false
            } else {
                state.active = true;
                true
            }
        };
        let relay_dyn: Arc<dyn TimerListener> = relay.clone();
        let listener: Weak<dyn TimerListener> = Arc::downgrade(&relay_dyn);
        let _ = self
            .direction_timer(direction)
            .schedule(listener, self.inactivity_timeout);
        if became_active {
            self.emit(direction, true);
        }
    }

    fn mark_inactive(&self, direction: ActivityDirection) {
        let flipped = {
            let mut state = self.direction_state(direction).lock();
            if state.active {
                state.active = false;
                true
            } else {
                false
            }
        };
        if flipped {
            self.emit(direction, false);
        }
    }

    fn forward(
        &self,
        direction: ActivityDirection,
        data: &Buffer,
        metadata: Option<&BufferMetadata>,
    ) -> GgResult<()> {
        self.note_activity(direction, &self.timer_relay);
        let sink = match direction {
            ActivityDirection::TopToBottom => self.down_sink.lock().clone(),
            ActivityDirection::BottomToTop => self.up_sink.lock().clone(),
        };
        match sink {
            // 未接线时静默吞掉：监视器不制造错误。
            None => Ok(()),
            Some(sink) => sink.put_data(data, metadata),
        }
    }
}

struct TopSink {
    inner: Arc<MonitorInner>,
}

impl DataSink for TopSink {
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()> {
        self.inner.forward(ActivityDirection::TopToBottom, data, metadata)
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        // 背压监听直通到下游 sink；未接线时先记账。
        if let Some(sink) = self.inner.down_sink.lock().clone() {
            sink.set_listener(listener)
        } else {
            self.inner.down_state.lock().pending_listener = listener;
            Ok(())
        }
    }
}

struct BottomSink {
    inner: Arc<MonitorInner>,
}

impl DataSink for BottomSink {
    fn put_data(&self, data: &Buffer, metadata: Option<&BufferMetadata>) -> GgResult<()> {
        self.inner.forward(ActivityDirection::BottomToTop, data, metadata)
    }

    fn set_listener(&self, listener: Option<Weak<dyn DataSinkListener>>) -> GgResult<()> {
        if let Some(sink) = self.inner.up_sink.lock().clone() {
            sink.set_listener(listener)
        } else {
            self.inner.up_state.lock().pending_listener = listener;
            Ok(())
        }
    }
}

struct BottomSource {
    inner: Arc<MonitorInner>,
}

impl DataSource for BottomSource {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(sink) = &sink {
            // 应用迟到的监听器注册。
            if let Some(listener) = self.inner.down_state.lock().pending_listener.take() {
                sink.set_listener(Some(listener))?;
            }
        }
        *self.inner.down_sink.lock() = sink;
        Ok(())
    }
}

struct TopSource {
    inner: Arc<MonitorInner>,
}

impl DataSource for TopSource {
    fn set_data_sink(&self, sink: Option<Arc<dyn DataSink>>) -> GgResult<()> {
        if let Some(sink) = &sink {
            if let Some(listener) = self.inner.up_state.lock().pending_listener.take() {
                sink.set_listener(Some(listener))?;
            }
        }
        *self.inner.up_sink.lock() = sink;
        Ok(())
    }
}

/// 活动监视器元素。
pub struct ActivityMonitor {
    inner: Arc<MonitorInner>,
}

impl ActivityMonitor {
    /// 以静默阈值（毫秒）构造。
    #[must_use]
    pub fn new(scheduler: &Arc<TimerScheduler>, inactivity_timeout_ms: u64) -> Arc<Self> {
        let timer_relay = Arc::new(MonitorTimerRelay {
            inner: Mutex::new(Weak::new()),
        });
        let inner = Arc::new(MonitorInner {
            inactivity_timeout: inactivity_timeout_ms,
            down_state: Mutex::new(DirectionState {
                active: false,
                pending_listener: None,
            }),
            up_state: Mutex::new(DirectionState {
                active: false,
                pending_listener: None,
            }),
            down_sink: Mutex::new(None),
            up_sink: Mutex::new(None),
            down_timer: scheduler.create_timer(),
            up_timer: scheduler.create_timer(),
            event_listener: Mutex::new(None),
            timer_relay: Arc::clone(&timer_relay),
        });
        *timer_relay.inner.lock() = Arc::downgrade(&inner);
        Arc::new(Self { inner })
    }

    /// 顶部 sink（上方元素向下写）。
    #[must_use]
    pub fn top_sink(&self) -> Arc<dyn DataSink> {
        Arc::new(TopSink {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 顶部 source（向上方元素交付）。
    #[must_use]
    pub fn top_source(&self) -> Arc<dyn DataSource> {
        Arc::new(TopSource {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 底部 sink（下方元素向上写）。
    #[must_use]
    pub fn bottom_sink(&self) -> Arc<dyn DataSink> {
        Arc::new(BottomSink {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 底部 source（向下方元素交付）。
    #[must_use]
    pub fn bottom_source(&self) -> Arc<dyn DataSource> {
        Arc::new(BottomSource {
            inner: Arc::clone(&self.inner),
        })
    }

    /// 某方向当前是否活跃。
    #[must_use]
    pub fn is_active(&self, direction: ActivityDirection) -> bool {
        self.inner.direction_state(direction).lock().active
    }

    /// 清零活动状态（元素 reset）。
    pub fn reset(&self) {
        self.inner.down_timer.unschedule();
        self.inner.up_timer.unschedule();
        self.inner.down_state.lock().active = false;
        self.inner.up_state.lock().active = false;
    }
}

impl EventEmitter for ActivityMonitor {
    fn set_event_listener(&self, listener: Option<Weak<dyn EventListener>>) {
        *self.inner.event_listener.lock() = listener;
    }
}
