//! 调试期线程归属检查。
//!
//! 核心对象约定只在事件循环线程上被访问；该约定无法用类型系统完整表达
//! （跨线程入口合法存在），因此在调试构建里以"记录绑定线程 + 访问断言"
//! 的方式捕获违例。发布构建中检查编译为空操作。

use std::thread::{self, ThreadId};

use parking_lot::Mutex;

use crate::error::{GgError, GgResult};

/// 线程守卫：首次绑定记录线程 ID，之后的检查断言仍在同一线程。
#[derive(Debug, Default)]
pub struct ThreadGuard {
    bound: Mutex<Option<ThreadId>>,
}

impl ThreadGuard {
    /// 构造未绑定的守卫。
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定到当前线程。
    ///
    /// 重复绑定到同一线程是幂等操作；绑定到不同线程返回 `InvalidState`。
    pub fn bind_to_current_thread(&self) -> GgResult<()> {
        let current = thread::current().id();
        let mut bound = self.bound.lock();
        match *bound {
            Some(existing) if existing != current => Err(GgError::InvalidState),
            _ => {
                *bound = Some(current);
                Ok(())
            }
        }
    }

    /// 是否已绑定到某个线程。
    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.bound.lock().is_some()
    }

    /// 当前线程是否就是绑定线程（未绑定视为否）。
    #[must_use]
    pub fn is_current_thread_bound(&self) -> bool {
        *self.bound.lock() == Some(thread::current().id())
    }

    /// 调试断言：调用方必须运行在绑定线程上。
    ///
    /// 未绑定时不触发（对象尚未进入单线程阶段）。
    #[inline]
    pub fn check_binding(&self) {
        #[cfg(debug_assertions)]
        {
            let bound = self.bound.lock();
            if let Some(owner) = *bound {
                debug_assert_eq!(
                    owner,
                    thread::current().id(),
                    "对象被非绑定线程访问，违反单线程协作模型"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebinding_same_thread_is_idempotent() {
        let guard = ThreadGuard::new();
        assert!(!guard.is_bound());
        guard.bind_to_current_thread().unwrap();
        guard.bind_to_current_thread().unwrap();
        assert!(guard.is_current_thread_bound());
    }

    #[test]
    fn binding_from_another_thread_is_rejected() {
        let guard = std::sync::Arc::new(ThreadGuard::new());
        guard.bind_to_current_thread().unwrap();
        let remote = std::sync::Arc::clone(&guard);
        let result = std::thread::spawn(move || remote.bind_to_current_thread())
            .join()
            .unwrap();
        assert_eq!(result, Err(GgError::InvalidState));
    }
}
