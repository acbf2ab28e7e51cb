//! 运行时句柄：显式的模块初始化与逆序终止。
//!
//! 原始设计以全局 init/terminate 函数对管理子模块生命周期；Rust 侧改为
//! 一个显式的 [`Runtime`] 值：构造即完成初始化（日志安装），注册的终止
//! 处理器在句柄销毁时按注册的逆序执行。

use parking_lot::Mutex;
use tracing::debug;

use crate::error::GgResult;
use crate::logging;

/// 运行时句柄。
///
/// 通常每个进程只构造一个；重复构造时日志安装失败会被忽略（全局订阅器
/// 只能安装一次），其余语义不受影响。
#[derive(Default)]
pub struct Runtime {
    termination_handlers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Runtime {
    /// 初始化运行时：按 `GG_LOG_CONFIG` 安装日志。
    pub fn new() -> GgResult<Self> {
        // 二次安装返回 InvalidState；对运行时而言这不是故障。
        if let Err(error) = logging::configure_from_env() {
            debug!(code = error.raw_code(), "logging already installed, keeping existing subscriber");
        }
        Ok(Self::default())
    }

    /// 注册终止处理器；销毁时按注册逆序执行。
    pub fn register_termination_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.termination_handlers.lock().push(Box::new(handler));
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        let mut handlers = self.termination_handlers.lock();
        while let Some(handler) = handlers.pop() {
            handler();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn termination_handlers_run_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let runtime = Runtime::default();
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            runtime.register_termination_handler(move || order.lock().push(tag));
        }
        drop(runtime);
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn handlers_run_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let runtime = Runtime::default();
        {
            let count = Arc::clone(&count);
            runtime.register_termination_handler(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        drop(runtime);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
