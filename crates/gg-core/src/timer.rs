//! 一次性定时器与毫秒级定时器调度器。
//!
//! # 教案目的（Why）
//! - 栈内全部时间行为（Gattlink 重传、CoAP 退避、事件发射器延迟合批）都
//!   建立在"单调毫秒时钟 + 截止时间排序"的最小调度器之上；
//! - 时钟由外部推进（事件循环在真实时间下调用 `set_time`，测试直接注入
//!   虚拟时间），因此协议逻辑天然可在测试里以确定性时间驱动。
//!
//! # 契约说明（What）
//! - `set_time(now)` 按截止时间升序触发所有 `deadline <= now` 的定时器；
//!   同一截止时间按插入顺序触发；
//! - 定时器在回调之前先被摘除，回调内可以重新挂表；回调内新挂（或重挂）
//!   的定时器在本次 `set_time` 中不触发，留待后续推进；
//! - `delay = 0` 表示"下一次推进即触发"；
//! - 销毁 [`Timer`] 句柄即取消；销毁调度器取消全部在挂定时器且不触发。
//!
//! # 实现提示（How）
//! - 触发循环每轮在锁内摘取最早的到期项、锁外执行回调，因此回调中重入
//!   调度器（重挂、取消其它定时器）不会死锁，也能即时生效。

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::{GgError, GgResult};

/// 定时器的稳定标识（调度器内唯一）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// 定时器到期回调。
pub trait TimerListener: Send + Sync {
    /// 定时器触发；`elapsed` 为从挂表到触发实际经过的毫秒数。
    fn on_timer_fired(&self, timer_id: TimerId, elapsed: u64);
}

struct TimerEntry {
    id: u64,
    deadline: u64,
    /// 插入序号；同截止时间的并列项以它定序，也用于"本轮不触发新挂项"。
    seq: u64,
    scheduled_at: u64,
    listener: Weak<dyn TimerListener>,
}

#[derive(Default)]
struct SchedulerState {
    now: u64,
    next_id: u64,
    next_seq: u64,
    entries: Vec<TimerEntry>,
}

impl SchedulerState {
    /// 摘取 `(deadline, seq)` 最小且满足条件的到期项。
    fn pop_due(&mut self, now: u64, seq_boundary: u64) -> Option<TimerEntry> {
        let mut best: Option<usize> = None;
        for (index, entry) in self.entries.iter().enumerate() {
            if entry.deadline > now || entry.seq >= seq_boundary {
                continue;
            }
            match best {
                Some(current)
                    if (self.entries[current].deadline, self.entries[current].seq)
                        <= (entry.deadline, entry.seq) => {}
                _ => best = Some(index),
            }
        }
        best.map(|index| self.entries.remove(index))
    }
}

/// 毫秒级定时器调度器。
///
/// 以 `Arc` 共享；[`Timer`] 句柄经 [`create_timer`](Self::create_timer)
/// 派生并弱引用回调度器，调度器先于句柄销毁时句柄操作安全退化为空操作。
pub struct TimerScheduler {
    state: Mutex<SchedulerState>,
}

impl TimerScheduler {
    /// 构造空调度器，时钟起点为 0。
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SchedulerState::default()),
        })
    }

    /// 派生一个定时器句柄（尚未挂表）。
    #[must_use]
    pub fn create_timer(self: &Arc<Self>) -> Timer {
        let id = {
            let mut state = self.state.lock();
            state.next_id += 1;
            state.next_id
        };
        Timer {
            scheduler: Arc::downgrade(self),
            id,
        }
    }

    /// 推进时钟并触发所有到期定时器。
    ///
    /// 回调在锁外逐个执行；回调中新挂的定时器即使已到期也只在后续推进
    /// 中触发。时钟单调：小于当前时间的输入按当前时间处理。
    pub fn set_time(&self, now: u64) {
        let (now, seq_boundary) = {
            let mut state = self.state.lock();
            state.now = state.now.max(now);
            (state.now, state.next_seq)
        };
        loop {
            let due = self.state.lock().pop_due(now, seq_boundary);
            let Some(entry) = due else { break };
            if let Some(listener) = entry.listener.upgrade() {
                listener.on_timer_fired(TimerId(entry.id), now - entry.scheduled_at);
            }
        }
    }

    /// 当前时钟（最近一次 `set_time` 的单调化结果）。
    #[must_use]
    pub fn now(&self) -> u64 {
        self.state.lock().now
    }

    /// 距最近一个未触发定时器的毫秒数；无定时器时返回 `None`。
    #[must_use]
    pub fn ms_until_next_timer(&self) -> Option<u64> {
        let state = self.state.lock();
        state
            .entries
            .iter()
            .map(|entry| entry.deadline.saturating_sub(state.now))
            .min()
    }

    fn schedule(&self, id: u64, listener: Weak<dyn TimerListener>, delay: u64) {
        let mut state = self.state.lock();
        state.entries.retain(|entry| entry.id != id);
        let seq = state.next_seq;
        state.next_seq += 1;
        let now = state.now;
        state.entries.push(TimerEntry {
            id,
            deadline: now.saturating_add(delay),
            seq,
            scheduled_at: now,
            listener,
        });
    }

    fn unschedule(&self, id: u64) {
        self.state.lock().entries.retain(|entry| entry.id != id);
    }

    fn is_scheduled(&self, id: u64) -> bool {
        self.state.lock().entries.iter().any(|entry| entry.id == id)
    }
}

/// 一次性定时器句柄。
///
/// 挂表中的句柄再次 `schedule` 即重新定时；`Drop` 自动取消。
pub struct Timer {
    scheduler: Weak<TimerScheduler>,
    id: u64,
}

impl Timer {
    /// 挂表：`delay` 毫秒后触发回调；已挂表则重新定时。
    ///
    /// 调度器已销毁时返回 `InvalidState`。
    pub fn schedule(&self, listener: Weak<dyn TimerListener>, delay: u64) -> GgResult<()> {
        let scheduler = self.scheduler.upgrade().ok_or(GgError::InvalidState)?;
        scheduler.schedule(self.id, listener, delay);
        Ok(())
    }

    /// 取消（未挂表时为空操作）。
    pub fn unschedule(&self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.unschedule(self.id);
        }
    }

    /// 是否在挂表中。
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.scheduler
            .upgrade()
            .is_some_and(|scheduler| scheduler.is_scheduled(self.id))
    }

    /// 本句柄的稳定标识。
    #[must_use]
    pub const fn id(&self) -> TimerId {
        TimerId(self.id)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.unschedule();
    }
}
