//! 连接对象与租约。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 连接在多个调度线程之间流转：在途读写、控制事件、用户 API 都可能同时持有它；
//!   内存由 `Arc` 管理，而“何时可以销毁”由一个显式的租约计数决定；
//! - 注册表查找与销毁可能赛跑，查找必须使用“安全获取”：计数已归零时失败，绝不复活垂死对象。
//!
//! ## 逻辑（How）
//! - 新连接持有两份租约：注册表持有（首次关闭时释放）与生命周期持有（关停序列结束时释放）；
//! - 每个提交给链路或调度池的操作额外持有一份租约，完成时由路由器“接管”而不再加一；
//! - 计数从 1 变为 0 的线程执行销毁。
//!
//! ## 契约（What）
//! - 销毁之前关停序列必然已经执行：生命周期租约只在关停序列末尾释放；
//! - 关闭状态首写者胜出，后续状态只进入日志。

use std::{
    ops::Deref,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
};

use parking_lot::{Condvar, Mutex};
use spark_buffer::LocalFreeList;
use spark_transport::AsyncLink;
use spark_transport_tls::TlsSession;

use crate::{
    callbacks::ConnectionHandler,
    engine::EngineCore,
    error::ConduitError,
    handle::{ConnectionClass, ConnectionHandle},
    read::ReadState,
    ring::ReceiveBuffer,
    state::StateWord,
    stats::StatsCell,
    write::WriteState,
};

/// 注册表持有 + 生命周期持有。
const INITIAL_LEASES: usize = 2;

pub(crate) struct Connection {
    pub(crate) handle: ConnectionHandle,
    pub(crate) class: ConnectionClass,
    pub(crate) link: Arc<dyn AsyncLink>,
    pub(crate) handler: Arc<dyn ConnectionHandler>,
    pub(crate) state: StateWord,
    status: OnceLock<Result<(), ConduitError>>,
    leases: AtomicUsize,
    registry_hold: AtomicBool,
    pub(crate) local: LocalFreeList,

    pub(crate) reads: Mutex<ReadState>,
    /// 已提交、尚未被路由处理完毕的读与探测。
    pub(crate) incoming: AtomicUsize,
    pub(crate) ring: Mutex<ReceiveBuffer>,
    pub(crate) new_data: AtomicBool,

    pub(crate) writes: Mutex<WriteState>,
    /// 已提交给链路、尚未完成的写字节数；用于出站上限。
    pub(crate) outgoing_bytes: AtomicUsize,
    /// 排队中的发送项 + 在途写 Packet；归零是关停的前提。
    pub(crate) outgoing_writes: AtomicUsize,
    pub(crate) drain: DrainGate,

    pub(crate) tls: Mutex<Option<TlsSession>>,

    delivering: Mutex<Option<ThreadId>>,
    delivery_idle: Condvar,

    pub(crate) stats: StatsCell,
}

/// 出站排空的单执行者闸门。
#[derive(Debug, Default)]
pub(crate) struct DrainGate {
    pub(crate) active: AtomicBool,
    pub(crate) rerun: AtomicBool,
}

impl Connection {
    pub(crate) fn new(
        handle: ConnectionHandle,
        class: ConnectionClass,
        link: Arc<dyn AsyncLink>,
        handler: Arc<dyn ConnectionHandler>,
        local: LocalFreeList,
    ) -> Self {
        Self {
            handle,
            class,
            link,
            handler,
            state: StateWord::default(),
            status: OnceLock::new(),
            leases: AtomicUsize::new(INITIAL_LEASES),
            registry_hold: AtomicBool::new(true),
            local,
            reads: Mutex::new(ReadState::default()),
            incoming: AtomicUsize::new(0),
            ring: Mutex::new(ReceiveBuffer::default()),
            new_data: AtomicBool::new(false),
            writes: Mutex::new(WriteState::default()),
            outgoing_bytes: AtomicUsize::new(0),
            outgoing_writes: AtomicUsize::new(0),
            drain: DrainGate::default(),
            tls: Mutex::new(None),
            delivering: Mutex::new(None),
            delivery_idle: Condvar::new(),
            stats: StatsCell::default(),
        }
    }

    /// 安全获取：计数已归零时失败。
    pub(crate) fn try_retain(&self) -> bool {
        self.leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then_some(current + 1)
            })
            .is_ok()
    }

    /// 为即将提交的操作追加一份租约；调用方必须已经持有租约。
    pub(crate) fn retain_op(&self) {
        let previous = self.leases.fetch_add(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "retain_op on a connection without leases");
    }

    pub(crate) fn release(&self, core: &EngineCore) {
        if self.leases.fetch_sub(1, Ordering::AcqRel) == 1 {
            core.destroy(self);
        }
    }

    pub(crate) fn release_registry_hold(&self, core: &EngineCore) {
        if self.registry_hold.swap(false, Ordering::AcqRel) {
            self.release(core);
        }
    }

    /// 记录关闭状态；返回本次是否成为首个记录者。
    pub(crate) fn record_status(&self, status: Result<(), ConduitError>) -> bool {
        self.status.set(status).is_ok()
    }

    pub(crate) fn recorded_error(&self) -> Option<ConduitError> {
        self.status.get().and_then(|status| status.as_ref().err().cloned())
    }

    /// 尝试成为数据回调的唯一执行者：有新数据且无人投递时成功。
    pub(crate) fn begin_delivery(&self) -> bool {
        let mut delivering = self.delivering.lock();
        if delivering.is_some() || !self.new_data.swap(false, Ordering::AcqRel) {
            return false;
        }
        *delivering = Some(thread::current().id());
        true
    }

    pub(crate) fn end_delivery(&self) {
        *self.delivering.lock() = None;
        self.delivery_idle.notify_all();
    }

    /// 等待进行中的数据回调结束；若投递者正是当前线程则立即返回。
    pub(crate) fn wait_delivery_idle(&self) {
        let current = thread::current().id();
        let mut delivering = self.delivering.lock();
        while let Some(owner) = *delivering {
            if owner == current {
                return;
            }
            self.delivery_idle.wait(&mut delivering);
        }
    }
}

/// 持有一份租约的连接引用；析构时归还租约。
pub(crate) struct ConnectionRef {
    conn: Arc<Connection>,
    core: Arc<EngineCore>,
}

impl ConnectionRef {
    /// 查找并安全获取。
    pub(crate) fn acquire(core: &Arc<EngineCore>, handle: ConnectionHandle) -> Option<Self> {
        let conn = core.registry.get(handle)?;
        conn.try_retain().then(|| Self {
            conn,
            core: Arc::clone(core),
        })
    }

    /// 接管某个已完成操作所持有的租约，不再增加计数。
    pub(crate) fn adopt(core: &Arc<EngineCore>, handle: ConnectionHandle) -> Option<Self> {
        let conn = core.registry.get(handle)?;
        Some(Self {
            conn,
            core: Arc::clone(core),
        })
    }
}

impl Deref for ConnectionRef {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        self.conn.release(&self.core);
    }
}
