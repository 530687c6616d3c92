//! 连接状态字。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接状态被读写流水线、路由器、用户 API 在不同线程上并发修改；
//!   把全部标志压缩进一个 `AtomicU32`，以 `fetch_or` / `fetch_and` / CAS 完成转换，无需额外锁。
//!
//! ## 状态机（What）
//! ```text
//! (created) → CONNECTED → CLOSED [+GRACEFUL_SHUTDOWN] → SHUTDOWN_PROCESSED → DESTROYED
//! ```
//! - `CLOSED` 只能被置位一次，首次置位时根据关闭状态决定是否同时置 `GRACEFUL_SHUTDOWN`；
//! - `SHUTDOWN_PROCESSED` 要求 `CLOSED` 已置位，且只能成功置位一次；
//! - `DESTROYED` 要求 `SHUTDOWN_PROCESSED` 已置位；
//! - 其余标志（暂停、TLS、拆除进度等）为正交位，可独立置位与清除。

use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) const CONNECTED: u32 = 1 << 0;
pub(crate) const CLOSED: u32 = 1 << 1;
pub(crate) const GRACEFUL_SHUTDOWN: u32 = 1 << 2;
pub(crate) const HAS_TLS: u32 = 1 << 3;
pub(crate) const HANDSHAKE_DONE: u32 = 1 << 4;
pub(crate) const INPUT_PAUSED: u32 = 1 << 5;
pub(crate) const OUTPUT_PAUSED: u32 = 1 << 6;
pub(crate) const SHUTDOWN_PROCESSED: u32 = 1 << 7;
pub(crate) const CLOSING_ON_SHUTDOWN: u32 = 1 << 8;
pub(crate) const LINK_TORN_DOWN: u32 = 1 << 9;
pub(crate) const CLOSE_NOTIFY_SENT: u32 = 1 << 10;
pub(crate) const DISCONNECT_FIRED: u32 = 1 << 11;
pub(crate) const DESTROYED: u32 = 1 << 12;

#[derive(Debug, Default)]
pub(crate) struct StateWord(AtomicU32);

impl StateWord {
    pub(crate) fn load(&self) -> u32 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn contains(&self, flag: u32) -> bool {
        self.load() & flag == flag
    }

    /// 置位；返回此前是否未置位。
    pub(crate) fn insert(&self, flag: u32) -> bool {
        self.0.fetch_or(flag, Ordering::AcqRel) & flag == 0
    }

    /// 清除；返回此前是否已置位。
    pub(crate) fn remove(&self, flag: u32) -> bool {
        self.0.fetch_and(!flag, Ordering::AcqRel) & flag != 0
    }

    /// 首次关闭时置 `CLOSED`（优雅关闭同时置 `GRACEFUL_SHUTDOWN`）；返回是否为首次关闭。
    pub(crate) fn mark_closed(&self, graceful: bool) -> bool {
        let extra = if graceful { GRACEFUL_SHUTDOWN } else { 0 };
        self.transition(|current| (current & CLOSED == 0).then_some(current | CLOSED | extra))
    }

    /// 进入一次性关停序列；要求已关闭且尚未处理。
    pub(crate) fn begin_shutdown(&self) -> bool {
        self.transition(|current| {
            (current & CLOSED != 0 && current & SHUTDOWN_PROCESSED == 0)
                .then_some(current | SHUTDOWN_PROCESSED)
        })
    }

    /// 标记销毁；要求关停序列已执行。
    pub(crate) fn mark_destroyed(&self) -> bool {
        self.transition(|current| {
            (current & SHUTDOWN_PROCESSED != 0 && current & DESTROYED == 0)
                .then_some(current | DESTROYED)
        })
    }

    fn transition(&self, step: impl Fn(u32) -> Option<u32>) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, step)
            .is_ok()
    }
}
