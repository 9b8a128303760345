//! # 轮询锁池
//!
//! 每个多密钥渠道一把互斥锁, 串行化游标的读取与推进。

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

/// 渠道级轮询锁池
#[derive(Default)]
pub struct PollingLockArena {
    locks: DashMap<i32, Arc<Mutex<()>>>,
}

impl PollingLockArena {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取 (必要时创建) 渠道的轮询锁
    #[must_use]
    pub fn lock_for(&self, channel_id: i32) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(channel_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// 丢弃已不存在的渠道的锁, 返回清理数量
    ///
    /// 正被持有的锁会保留到下一轮。
    pub fn sweep(&self, live_channel_ids: &HashSet<i32>) -> usize {
        let before = self.locks.len();
        self.locks.retain(|id, lock| {
            live_channel_ids.contains(id) || Arc::strong_count(lock) > 1
        });
        before - self.locks.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_for_returns_same_lock() {
        let arena = PollingLockArena::new();
        let a = arena.lock_for(1);
        let b = arena.lock_for(1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_sweep_drops_dead_channels() {
        let arena = PollingLockArena::new();
        drop(arena.lock_for(1));
        drop(arena.lock_for(2));
        let held = arena.lock_for(3);

        let live: HashSet<i32> = [1].into_iter().collect();
        assert_eq!(arena.sweep(&live), 1);
        assert_eq!(arena.len(), 2);

        drop(held);
        assert_eq!(arena.sweep(&live), 1);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_lock_is_exclusive_per_channel() {
        let arena = PollingLockArena::new();
        tokio_test::block_on(async {
            let first = arena.lock_for(7);
            let guard = first.lock().await;
            assert!(arena.lock_for(7).try_lock().is_err());
            assert!(arena.lock_for(8).try_lock().is_ok());
            drop(guard);
            assert!(arena.lock_for(7).try_lock().is_ok());
        });
    }
}
