//! # Registry：连接仓储
//!
//! ## 核心意图（Why）
//! - 以不透明句柄索引存活连接，读多写少：查找发生在每次 API 调用与每个完成事件上，插入与移除只在接入与销毁时发生；
//! - 引擎协同关停需要“等待仓储清空”，以条件变量通知代替轮询；
//! - 连接销毁后句柄仍可能被查询（重复 `close`、`error_code`），首个关闭状态需要在销毁后继续可读。
//!
//! ## 行为契约（What）
//! - `insert`：登记新连接，增加存活计数与登记代数并唤醒等待者；
//! - `get`：克隆出 `Arc` 后立即释放分片锁，调用方再自行执行安全获取；
//! - `bury` + `remove` + `retire`：销毁流程先写入墓碑、再移除条目使查找失败，回调与资源归还完成后
//!   递减存活计数并唤醒等待者；
//! - 墓碑按写入顺序保留至多 [`TOMBSTONE_CAPACITY`] 条，`prune_tombstones` 在引擎终结时清空。
//!
//! ## 风险提示（Trade-offs）
//! - `DashMap` 的分片读写锁在迭代期间阻塞同分片写入，`snapshot` 只做克隆，不在持锁期间执行任何回调；
//! - 超出容量后最早的墓碑被淘汰，对应句柄重新退化为“无效句柄”。

use std::{
    collections::VecDeque,
    num::NonZeroU64,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::{connection::Connection, error::ConduitError, handle::ConnectionHandle};

/// 销毁后仍保留首个关闭状态的句柄数上限。
pub(crate) const TOMBSTONE_CAPACITY: usize = 4096;

/// 存活计数与登记代数；二者共用一把锁，等待者据此区分“清空”与“有新连接登记”。
#[derive(Debug, Default)]
struct Census {
    live: usize,
    registered: u64,
}

pub(crate) struct Registry {
    connections: DashMap<ConnectionHandle, Arc<Connection>>,
    census: Mutex<Census>,
    changed: Condvar,
    next_handle: AtomicU64,
    tombstones: DashMap<ConnectionHandle, Option<ConduitError>>,
    burial_order: Mutex<VecDeque<ConnectionHandle>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            connections: DashMap::new(),
            census: Mutex::new(Census::default()),
            changed: Condvar::new(),
            next_handle: AtomicU64::new(1),
            tombstones: DashMap::new(),
            burial_order: Mutex::new(VecDeque::new()),
        }
    }
}

impl Registry {
    pub(crate) fn allocate_handle(&self) -> ConnectionHandle {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        ConnectionHandle::new(NonZeroU64::new(raw).unwrap_or(NonZeroU64::MIN))
    }

    pub(crate) fn insert(&self, conn: Arc<Connection>) {
        {
            let mut census = self.census.lock();
            census.live += 1;
            census.registered += 1;
        }
        self.connections.insert(conn.handle, conn);
        self.changed.notify_all();
    }

    pub(crate) fn get(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        self.connections
            .get(&handle)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub(crate) fn remove(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        self.connections.remove(&handle).map(|(_, conn)| conn)
    }

    /// 为即将销毁的句柄写入首个关闭状态。
    pub(crate) fn bury(&self, handle: ConnectionHandle, status: Option<ConduitError>) {
        let evicted = {
            let mut order = self.burial_order.lock();
            order.push_back(handle);
            if order.len() > TOMBSTONE_CAPACITY {
                order.pop_front()
            } else {
                None
            }
        };
        self.tombstones.insert(handle, status);
        if let Some(evicted) = evicted {
            self.tombstones.remove(&evicted);
        }
    }

    /// 已销毁句柄的首个关闭状态；外层 `None` 表示没有墓碑。
    pub(crate) fn tombstone(&self, handle: ConnectionHandle) -> Option<Option<ConduitError>> {
        self.tombstones.get(&handle).map(|entry| entry.value().clone())
    }

    pub(crate) fn prune_tombstones(&self) -> usize {
        let mut order = self.burial_order.lock();
        let pruned = order.len();
        order.clear();
        self.tombstones.clear();
        pruned
    }

    /// 一条连接完成销毁；计数归零时唤醒全部等待者。
    pub(crate) fn retire(&self) {
        let drained = {
            let mut census = self.census.lock();
            census.live = census.live.saturating_sub(1);
            census.live == 0
        };
        if drained {
            self.changed.notify_all();
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.census.lock().live
    }

    /// 当前登记代数，配合 [`Registry::wait_drained`] 使用。
    pub(crate) fn registered(&self) -> u64 {
        self.census.lock().registered
    }

    /// 阻塞直到仓储清空，或自 `seen` 之后有新连接登记；返回是否已清空。
    pub(crate) fn wait_drained(&self, seen: u64) -> bool {
        let mut census = self.census.lock();
        self.changed
            .wait_while(&mut census, |census| census.live > 0 && census.registered == seen);
        census.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(raw: u64) -> ConnectionHandle {
        ConnectionHandle::from_raw(raw).expect("非零句柄")
    }

    #[test]
    fn tombstones_keep_the_first_status() {
        let registry = Registry::default();
        assert_eq!(registry.tombstone(handle(7)), None);
        registry.bury(handle(7), Some(ConduitError::Cancelled));
        registry.bury(handle(8), None);
        assert_eq!(registry.tombstone(handle(7)), Some(Some(ConduitError::Cancelled)));
        assert_eq!(registry.tombstone(handle(8)), Some(None));
        assert_eq!(registry.prune_tombstones(), 2);
        assert_eq!(registry.tombstone(handle(7)), None);
    }

    #[test]
    fn oldest_tombstone_is_evicted_past_capacity() {
        let registry = Registry::default();
        for raw in 1..=(TOMBSTONE_CAPACITY as u64 + 1) {
            registry.bury(handle(raw), None);
        }
        assert_eq!(registry.tombstone(handle(1)), None);
        assert_eq!(registry.tombstone(handle(2)), Some(None));
        assert_eq!(
            registry.tombstone(handle(TOMBSTONE_CAPACITY as u64 + 1)),
            Some(None)
        );
    }

    #[test]
    fn empty_registry_is_drained_immediately() {
        let registry = Registry::default();
        assert!(registry.wait_drained(registry.registered()));
    }

    #[test]
    fn last_retirement_wakes_the_drain_waiter() {
        let registry = Arc::new(Registry::default());
        registry.census.lock().live = 1;
        let seen = registry.registered();
        let retiring = Arc::clone(&registry);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            retiring.retire();
        });
        assert!(registry.wait_drained(seen));
        worker.join().expect("退役线程不应 panic");
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn new_registration_interrupts_the_drain_wait() {
        let registry = Arc::new(Registry::default());
        registry.census.lock().live = 1;
        let seen = registry.registered();
        let registering = Arc::clone(&registry);
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            registering.census.lock().registered += 1;
            registering.changed.notify_all();
        });
        assert!(!registry.wait_drained(seen), "存活连接仍在，等待应因新登记返回");
        worker.join().expect("登记线程不应 panic");
        assert_eq!(registry.registered(), seen + 1);
    }
}
