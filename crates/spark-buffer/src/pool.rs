use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::packet::{Packet, PacketKind, SizeClass};

/// 自由链表上限配置。
///
/// # 契约说明（What）
/// - `small_free_cap` / `large_free_cap`：进程级两档自由链表各自最多缓存的 Packet 数；
/// - `local_free_cap`：每条连接、每个档位最多缓存的 Packet 数；
/// - 上限只约束“空闲”Packet，在途 Packet 数量不受限制，超出上限的归还直接释放内存。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolLimits {
    pub small_free_cap: usize,
    pub large_free_cap: usize,
    pub local_free_cap: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            small_free_cap: 1024,
            large_free_cap: 256,
            local_free_cap: 4,
        }
    }
}

/// 池统计快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 向堆申请新 Packet 的累计次数。
    pub allocations: u64,
    /// 从自由链表（连接级或进程级）命中的累计次数。
    pub reuses: u64,
    /// 成功放回某条自由链表的累计次数。
    pub releases: u64,
    /// 因自由链表已满而直接释放的累计次数。
    pub discards: u64,
    /// 当前进程级小档空闲数量。
    pub free_small: usize,
    /// 当前进程级大档空闲数量。
    pub free_large: usize,
}

/// 连接私有的自由链表。
///
/// # 意图（Why）
/// - 连接在稳定态下反复租借同一档位的 Packet，若每次都竞争进程级锁会在高并发时形成热点；
/// - 先查本地再查全局，与进程级链表构成两级缓存。
///
/// # 风险（Trade-offs）
/// - 连接销毁时必须调用 [`PacketPool::reclaim_local`]，否则缓存的 Packet 只会随连接一起释放，
///   不会回到进程级链表。
#[derive(Debug)]
pub struct LocalFreeList {
    small: Mutex<Vec<Packet>>,
    large: Mutex<Vec<Packet>>,
    cap: usize,
}

impl LocalFreeList {
    pub fn new(cap: usize) -> Self {
        Self {
            small: Mutex::new(Vec::with_capacity(cap)),
            large: Mutex::new(Vec::with_capacity(cap)),
            cap,
        }
    }

    fn list(&self, class: SizeClass) -> &Mutex<Vec<Packet>> {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Large => &self.large,
        }
    }

    fn pop(&self, class: SizeClass) -> Option<Packet> {
        self.list(class).lock().pop()
    }

    /// 尝试放入本地链表，已满时把 Packet 交还给调用方。
    fn push(&self, packet: Packet) -> Result<(), Packet> {
        let mut list = self.list(packet.class()).lock();
        if list.len() < self.cap {
            list.push(packet);
            Ok(())
        } else {
            Err(packet)
        }
    }

    /// 当前缓存数量（两档合计）。
    pub fn len(&self) -> usize {
        self.small.lock().len() + self.large.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 进程级 Packet 池。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 为读写流水线与控制事件提供统一的缓冲来源，消除稳定态下的堆分配；
/// - “耗尽”不是一种需要区分的错误：链表为空时直接分配新 Packet，内存不足交给分配器报告。
///
/// ## 逻辑（How）
/// - 每个档位一条 `spin::Mutex<Vec<Packet>>`，临界区只有一次 `push`/`pop`；
/// - `acquire` 依次尝试连接级链表、进程级链表、堆分配；
/// - `release` 依次尝试连接级链表、进程级链表，全部已满时直接丢弃。
///
/// ## 契约（What）
/// - 返回的 Packet 元数据已重置，`kind` 为调用方请求的种类；
/// - 在自由链表上限之内，`acquire`/`release` 的循环不会使分配次数超过观测到的并发峰值。
///
/// ## 风险与权衡（Trade-offs）
/// - 使用自旋锁而非阻塞锁：临界区极短，且调度池线程数固定，自旋的最坏代价可控。
#[derive(Debug)]
pub struct PacketPool {
    small: Mutex<Vec<Packet>>,
    large: Mutex<Vec<Packet>>,
    limits: PoolLimits,
    metrics: PoolMetrics,
}

impl Default for PacketPool {
    fn default() -> Self {
        Self::new(PoolLimits::default())
    }
}

impl PacketPool {
    pub fn new(limits: PoolLimits) -> Self {
        Self {
            small: Mutex::new(Vec::new()),
            large: Mutex::new(Vec::new()),
            limits,
            metrics: PoolMetrics::default(),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.limits
    }

    /// 为连接创建遵循本池上限的本地自由链表。
    pub fn local_list(&self) -> LocalFreeList {
        LocalFreeList::new(self.limits.local_free_cap)
    }

    /// 租借一个满足期望容量档位的 Packet。
    ///
    /// # 参数与契约
    /// - `kind`：Packet 的新角色；
    /// - `desired`：期望容量，仅用于选择档位；超过大档容量时调用方需自行分片；
    /// - `local`：连接级链表，优先命中。
    pub fn acquire(
        &self,
        kind: PacketKind,
        desired: usize,
        local: Option<&LocalFreeList>,
    ) -> Packet {
        let class = SizeClass::for_request(desired);
        let reused = local
            .and_then(|list| list.pop(class))
            .or_else(|| self.global(class).lock().pop());
        match reused {
            Some(mut packet) => {
                self.metrics.reuses.fetch_add(1, Ordering::Relaxed);
                packet.reset(kind);
                packet
            }
            None => {
                self.metrics.allocations.fetch_add(1, Ordering::Relaxed);
                Packet::new(kind, class)
            }
        }
    }

    /// 归还一个 Packet。
    pub fn release(&self, mut packet: Packet, local: Option<&LocalFreeList>) {
        packet.reset(PacketKind::Discard);
        let packet = match local {
            Some(list) => match list.push(packet) {
                Ok(()) => {
                    self.metrics.releases.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(rejected) => rejected,
            },
            None => packet,
        };
        self.push_global(packet);
    }

    /// 批量归还。
    pub fn release_all<I>(&self, packets: I, local: Option<&LocalFreeList>)
    where
        I: IntoIterator<Item = Packet>,
    {
        for packet in packets {
            self.release(packet, local);
        }
    }

    /// 连接销毁时把本地缓存转移到进程级链表。
    pub fn reclaim_local(&self, local: &LocalFreeList) {
        let drained: Vec<Packet> = {
            let mut small = local.small.lock();
            let mut large = local.large.lock();
            small.drain(..).chain(large.drain(..)).collect()
        };
        for packet in drained {
            self.push_global(packet);
        }
    }

    /// 清空进程级自由链表，返回释放的 Packet 数。
    pub fn shrink(&self) -> usize {
        let mut released = 0;
        for class in [SizeClass::Small, SizeClass::Large] {
            let mut list = self.global(class).lock();
            released += list.len();
            list.clear();
        }
        released
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.metrics.allocations.load(Ordering::Relaxed),
            reuses: self.metrics.reuses.load(Ordering::Relaxed),
            releases: self.metrics.releases.load(Ordering::Relaxed),
            discards: self.metrics.discards.load(Ordering::Relaxed),
            free_small: self.small.lock().len(),
            free_large: self.large.lock().len(),
        }
    }

    fn global(&self, class: SizeClass) -> &Mutex<Vec<Packet>> {
        match class {
            SizeClass::Small => &self.small,
            SizeClass::Large => &self.large,
        }
    }

    fn cap(&self, class: SizeClass) -> usize {
        match class {
            SizeClass::Small => self.limits.small_free_cap,
            SizeClass::Large => self.limits.large_free_cap,
        }
    }

    fn push_global(&self, packet: Packet) {
        let class = packet.class();
        let cap = self.cap(class);
        let mut list = self.global(class).lock();
        if list.len() < cap {
            list.push(packet);
            self.metrics.releases.fetch_add(1, Ordering::Relaxed);
        } else {
            drop(list);
            self.metrics.discards.fetch_add(1, Ordering::Relaxed);
            drop(packet);
        }
    }
}

#[derive(Debug, Default)]
struct PoolMetrics {
    allocations: AtomicU64,
    reuses: AtomicU64,
    releases: AtomicU64,
    discards: AtomicU64,
}
