//! 引擎：初始化 / 终结、连接接入与全部句柄级操作。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 引擎是进程内唯一的连接宿主：持有配置、Packet 池、连接注册表与外部调度池的引用；
//! - 对外只暴露句柄级 API，所有操作都可在任意线程（包括回调内部）调用。
//!
//! ## 逻辑（How）
//! - [`EngineCore`] 以 `Arc::new_cyclic` 构造，完成入口 [`EnginePort`] 只保存弱引用，
//!   引擎被丢弃后迟到的完成直接丢弃；
//! - 完成经 `schedule` 投递到调度池；调度池不可用时在当前线程路由；
//! - 句柄操作先“安全获取”连接，失败即返回无效句柄错误，不改变任何连接状态；
//! - `finalize` 执行协同关停：置关停标志 → 扫描注册表，以 `Cancelled` 关闭并强制拆除
//!   每条尚未标记的连接 → 在条件变量上等待注册表清空；等待期间若有新连接登记则重新扫描；
//! - 已销毁句柄上的 `close` / `error_code` 从注册表墓碑读取首个关闭状态。
//!
//! ## 契约（What）
//! - `initialize` 要求调度池已在运行且线程数固定；重复初始化返回 `AlreadyInitialized`；
//! - 未初始化或关停期间 `attach` 失败；
//! - `Engine` 析构时若仍在运行则自动 `finalize`。
//!
//! ## 风险与权衡（Trade-offs）
//! - 调度池被外部提前关闭时，完成退化为在提交线程上内联路由；若当前线程已在路由中
//!   （可能持有连接锁），完成被挂到线程本地的延后队列，由最外层路由在释放锁之后处理。

use std::{
    io::{self, Read},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use spark_buffer::{Packet, PacketKind, PacketPool, PoolStats};
use spark_transport::{AsyncLink, CompletionPort, DispatchPool, TeardownMode};
use spark_transport_tls::TlsOptions;
use tracing::{debug, trace, warn};

use crate::{
    callbacks::ConnectionHandler,
    config::EngineConfig,
    connection::{Connection, ConnectionRef},
    error::ConduitError,
    handle::{ConnectionClass, ConnectionHandle},
    lifecycle, read,
    registry::Registry,
    router,
    state::{
        CLOSED, CLOSING_ON_SHUTDOWN, CONNECTED, HANDSHAKE_DONE, INPUT_PAUSED, OUTPUT_PAUSED,
    },
    stats::ConnectionStats,
    tls,
    write::{self, WriteItem},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Finalizing,
}

struct Runtime {
    phase: Phase,
    dispatch: Option<Arc<dyn DispatchPool>>,
}

pub(crate) struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) pool: PacketPool,
    pub(crate) registry: Registry,
    runtime: RwLock<Runtime>,
    shutting_down: AtomicBool,
    port: Arc<dyn CompletionPort>,
    this: Weak<EngineCore>,
}

/// 链路回送完成的入口。
struct EnginePort {
    core: Weak<EngineCore>,
}

impl CompletionPort for EnginePort {
    fn complete(&self, packet: Packet, result: io::Result<usize>) {
        match self.core.upgrade() {
            Some(core) => core.schedule(packet, result),
            None => trace!(kind = ?packet.kind(), "engine dropped; completion discarded"),
        }
    }
}

impl EngineCore {
    fn new(config: EngineConfig) -> Arc<Self> {
        Arc::new_cyclic(|this: &Weak<EngineCore>| EngineCore {
            pool: PacketPool::new(config.pool.into()),
            config,
            registry: Registry::default(),
            runtime: RwLock::new(Runtime {
                phase: Phase::Idle,
                dispatch: None,
            }),
            shutting_down: AtomicBool::new(false),
            port: Arc::new(EnginePort { core: this.clone() }),
            this: this.clone(),
        })
    }

    pub(crate) fn port(&self) -> &Arc<dyn CompletionPort> {
        &self.port
    }

    /// 把一个完成交给调度池；调度池不可用时就地路由。
    pub(crate) fn schedule(&self, packet: Packet, result: io::Result<usize>) {
        let Some(core) = self.this.upgrade() else {
            return;
        };
        let slot = Arc::new(Mutex::new(Some((packet, result))));
        let dispatch = self.runtime.read().dispatch.clone();
        if let Some(dispatch) = dispatch {
            let job_core = Arc::clone(&core);
            let job_slot = Arc::clone(&slot);
            let posted = dispatch.post(Box::new(move || {
                if let Some((packet, result)) = job_slot.lock().take() {
                    router::route(&job_core, packet, result);
                }
            }));
            match posted {
                Ok(()) => return,
                Err(err) => {
                    debug!(error = %err, "dispatch pool rejected completion; routing inline")
                }
            }
        }
        let inline = slot.lock().take();
        if let Some((packet, result)) = inline {
            router::route(&core, packet, result);
        }
    }

    /// 投递一个内部控制事件；调用方必须持有该连接的租约。
    pub(crate) fn post_control(&self, conn: &Connection, kind: PacketKind) {
        let mut packet = self.pool.acquire(kind, 0, Some(&conn.local));
        packet.set_owner(conn.handle.get());
        conn.retain_op();
        self.schedule(packet, Ok(0));
    }

    /// 租约归零：移除注册项、通知处理器并归还连接持有的全部 Packet。
    pub(crate) fn destroy(&self, conn: &Connection) {
        if !conn.state.mark_destroyed() {
            warn!(handle = %conn.handle, "connection destroyed before its shutdown sequence ran");
        }
        let handle = conn.handle;
        self.registry.bury(handle, conn.recorded_error());
        self.registry.remove(handle);
        crate::callbacks::notify("on_destroy", || conn.handler.on_destroy(handle));
        let reads = read::release_pending(self, conn);
        let writes = write::discard_queue(conn);
        conn.tls.lock().take();
        self.pool.reclaim_local(&conn.local);
        self.registry.retire();
        debug!(handle = %handle, reads, writes, "connection destroyed");
    }

    fn ensure_running(&self) -> Result<(), ConduitError> {
        if self.runtime.read().phase != Phase::Running {
            return Err(ConduitError::NotInitialized);
        }
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(ConduitError::ShuttingDown);
        }
        Ok(())
    }

    fn acquire(self: &Arc<Self>, handle: ConnectionHandle) -> Result<ConnectionRef, ConduitError> {
        ConnectionRef::acquire(self, handle).ok_or_else(|| ConduitError::unknown_handle(handle))
    }

    fn acquire_open(
        self: &Arc<Self>,
        handle: ConnectionHandle,
    ) -> Result<ConnectionRef, ConduitError> {
        let conn = self.acquire(handle)?;
        if conn.state.contains(CLOSED) {
            return Err(ConduitError::Cancelled);
        }
        Ok(conn)
    }

    /// 已进入销毁的连接的首个关闭状态：优先读仍在注册表中的对象，其次读墓碑。
    fn settled_status(&self, handle: ConnectionHandle) -> Option<Option<ConduitError>> {
        if let Some(conn) = self.registry.get(handle) {
            if conn.state.contains(CLOSED) {
                return Some(conn.recorded_error());
            }
        }
        self.registry.tombstone(handle)
    }

    fn queue_write(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        item: WriteItem,
    ) -> Result<(), ConduitError> {
        let conn = self.acquire_open(handle)?;
        let sequence = write::enqueue(&conn, item)?;
        trace!(handle = %handle, seq = sequence, "write queued");
        self.post_control(&conn, PacketKind::WriteRequest);
        Ok(())
    }

    pub(crate) fn send(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        data: Bytes,
    ) -> Result<(), ConduitError> {
        if data.is_empty() {
            return Err(ConduitError::invalid("cannot send an empty buffer"));
        }
        self.queue_write(handle, WriteItem::Buffer(data))
    }

    pub(crate) fn send_stream(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        source: Box<dyn Read + Send + 'static>,
    ) -> Result<(), ConduitError> {
        self.queue_write(
            handle,
            WriteItem::Stream {
                source,
                pending: Default::default(),
            },
        )
    }

    pub(crate) fn after_write_signal(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        signal: write::Signal,
    ) -> Result<(), ConduitError> {
        self.queue_write(handle, WriteItem::Signal(signal))
    }

    pub(crate) fn received_len(
        self: &Arc<Self>,
        handle: ConnectionHandle,
    ) -> Result<usize, ConduitError> {
        let conn = self.acquire(handle)?;
        let len = conn.ring.lock().len();
        Ok(len)
    }

    pub(crate) fn peek_received(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        out: &mut [u8],
    ) -> Result<usize, ConduitError> {
        let conn = self.acquire(handle)?;
        let copied = conn.ring.lock().peek(out);
        Ok(copied)
    }

    pub(crate) fn consume_received(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        count: usize,
    ) -> Result<usize, ConduitError> {
        let conn = self.acquire(handle)?;
        let consumed = conn.ring.lock().consume(count);
        Ok(consumed)
    }

    pub(crate) fn pause_input(
        self: &Arc<Self>,
        handle: ConnectionHandle,
    ) -> Result<(), ConduitError> {
        let conn = self.acquire_open(handle)?;
        if conn.state.insert(INPUT_PAUSED) {
            trace!(handle = %handle, "input paused");
        }
        Ok(())
    }

    pub(crate) fn resume_input(
        self: &Arc<Self>,
        handle: ConnectionHandle,
    ) -> Result<(), ConduitError> {
        let conn = self.acquire(handle)?;
        if conn.state.remove(INPUT_PAUSED) {
            trace!(handle = %handle, "input resumed");
            self.post_control(&conn, PacketKind::ResumeProcessing);
        }
        Ok(())
    }

    pub(crate) fn pause_output(
        self: &Arc<Self>,
        handle: ConnectionHandle,
    ) -> Result<(), ConduitError> {
        let conn = self.acquire_open(handle)?;
        if conn.state.insert(OUTPUT_PAUSED) {
            trace!(handle = %handle, "output paused");
        }
        Ok(())
    }

    pub(crate) fn resume_output(
        self: &Arc<Self>,
        handle: ConnectionHandle,
    ) -> Result<(), ConduitError> {
        let conn = self.acquire(handle)?;
        if conn.state.remove(OUTPUT_PAUSED) {
            trace!(handle = %handle, "output resumed");
            self.post_control(&conn, PacketKind::WriteRequest);
        }
        Ok(())
    }

    pub(crate) fn enable_tls(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        options: &TlsOptions,
    ) -> Result<(), ConduitError> {
        let conn = self.acquire_open(handle)?;
        let session = tls::new_session(conn.class, options)?;
        tls::install(&conn, session)?;
        self.post_control(&conn, PacketKind::ResumeProcessing);
        Ok(())
    }

    pub(crate) fn close(
        self: &Arc<Self>,
        handle: ConnectionHandle,
        error: Option<ConduitError>,
    ) -> Result<Option<ConduitError>, ConduitError> {
        let conn = match self.acquire(handle) {
            Ok(conn) => conn,
            Err(err) => return self.settled_status(handle).ok_or(err),
        };
        let status = match error {
            Some(error) => Err(error),
            None => Ok(()),
        };
        lifecycle::close(self, &conn, status);
        Ok(conn.recorded_error())
    }

    pub(crate) fn is_handshake_done(self: &Arc<Self>, handle: ConnectionHandle) -> bool {
        self.acquire(handle)
            .map(|conn| conn.state.contains(HANDSHAKE_DONE))
            .unwrap_or(false)
    }

    /// 扫描注册表，关闭并强制拆除全部尚未标记的连接，直到某一轮没有新标记。
    fn cancel_all(self: &Arc<Self>) -> usize {
        let mut total = 0;
        loop {
            let mut marked = 0;
            for entry in self.registry.snapshot() {
                let Some(conn) = ConnectionRef::acquire(self, entry.handle) else {
                    continue;
                };
                if !conn.state.insert(CLOSING_ON_SHUTDOWN) {
                    continue;
                }
                marked += 1;
                lifecycle::close(self, &conn, Err(ConduitError::Cancelled));
                lifecycle::teardown_link(&conn, TeardownMode::Abortive);
                write::discard_queue(&conn);
                self.post_control(&conn, PacketKind::Discard);
            }
            if marked == 0 {
                return total;
            }
            total += marked;
        }
    }
}

/// 接入一条链路时的选项。
pub struct AttachOptions {
    pub class: ConnectionClass,
    pub handler: Arc<dyn ConnectionHandler>,
    /// 接入时即启用 TLS；也可稍后通过 [`Engine::enable_tls`] 就地升级。
    pub tls: Option<TlsOptions>,
}

impl AttachOptions {
    pub fn new(class: ConnectionClass, handler: Arc<dyn ConnectionHandler>) -> Self {
        Self {
            class,
            handler,
            tls: None,
        }
    }

    pub fn client(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::new(ConnectionClass::Client, handler)
    }

    pub fn server(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::new(ConnectionClass::Server, handler)
    }

    pub fn listener(handler: Arc<dyn ConnectionHandler>) -> Self {
        Self::new(ConnectionClass::Listener, handler)
    }

    pub fn with_tls(mut self, options: TlsOptions) -> Self {
        self.tls = Some(options);
        self
    }
}

/// 完成驱动的连接引擎。
///
/// ```ignore
/// let engine = Engine::new(EngineConfig::default())?;
/// engine.initialize(Arc::new(FixedDispatchPool::new(4)?))?;
/// let handle = engine.attach(Arc::new(link), AttachOptions::client(handler))?;
/// engine.send(handle, &b"ping"[..])?;
/// engine.finalize();
/// ```
pub struct Engine {
    core: Arc<EngineCore>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Result<Self, ConduitError> {
        config.validate()?;
        Ok(Self {
            core: EngineCore::new(config),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.core.config
    }

    /// 绑定调度池并开始接受连接。
    pub fn initialize(&self, pool: Arc<dyn DispatchPool>) -> Result<(), ConduitError> {
        let mut runtime = self.core.runtime.write();
        if runtime.phase != Phase::Idle {
            return Err(ConduitError::AlreadyInitialized);
        }
        if !pool.is_running() {
            return Err(ConduitError::PoolNotReady);
        }
        if !pool.is_fixed_size() {
            return Err(ConduitError::PoolGrowable);
        }
        let workers = pool.worker_count();
        runtime.dispatch = Some(pool);
        runtime.phase = Phase::Running;
        self.core.shutting_down.store(false, Ordering::Release);
        debug!(workers, "engine initialized");
        Ok(())
    }

    /// 协同关停：取消全部连接并等待它们销毁。未初始化时不做任何事。
    pub fn finalize(&self) {
        {
            let mut runtime = self.core.runtime.write();
            if runtime.phase != Phase::Running {
                return;
            }
            runtime.phase = Phase::Finalizing;
        }
        self.core.shutting_down.store(true, Ordering::Release);
        let registry = &self.core.registry;
        debug!(connections = registry.len(), "engine finalizing");
        loop {
            let seen = registry.registered();
            let cancelled = self.core.cancel_all();
            if registry.wait_drained(seen) {
                break;
            }
            debug!(
                remaining = registry.len(),
                cancelled, "connection registered during finalize; rescanning"
            );
        }
        let mut runtime = self.core.runtime.write();
        runtime.dispatch = None;
        runtime.phase = Phase::Idle;
        drop(runtime);
        let pruned = registry.prune_tombstones();
        debug!(tombstones = pruned, "engine finalized");
    }

    /// 接入一条已建立的链路，返回其句柄。
    pub fn attach(
        &self,
        link: Arc<dyn AsyncLink>,
        options: AttachOptions,
    ) -> Result<ConnectionHandle, ConduitError> {
        let core = &self.core;
        core.ensure_running()?;
        let AttachOptions {
            class,
            handler,
            tls: tls_options,
        } = options;
        let session = tls_options
            .as_ref()
            .map(|options| tls::new_session(class, options))
            .transpose()?;

        let handle = core.registry.allocate_handle();
        let conn = Arc::new(Connection::new(
            handle,
            class,
            link,
            handler,
            core.pool.local_list(),
        ));
        if let Some(session) = session {
            tls::install(&conn, session)?;
        }
        core.registry.insert(Arc::clone(&conn));
        debug!(
            handle = %handle,
            ?class,
            link = %conn.link.describe(),
            tls = tls_options.is_some(),
            "connection registered"
        );
        core.post_control(&conn, PacketKind::InitialSetup);
        if core.shutting_down.load(Ordering::Acquire) {
            lifecycle::close(core, &conn, Err(ConduitError::Cancelled));
        }
        Ok(handle)
    }

    /// 按调用顺序发送一段字节。
    pub fn send(
        &self,
        handle: ConnectionHandle,
        data: impl Into<Bytes>,
    ) -> Result<(), ConduitError> {
        self.core.send(handle, data.into())
    }

    /// 从数据源流式发送，直到其返回 EOF。
    pub fn send_stream(
        &self,
        handle: ConnectionHandle,
        source: impl Read + Send + 'static,
    ) -> Result<(), ConduitError> {
        self.core.send_stream(handle, Box::new(source))
    }

    /// 此前排队的全部写完成后调用 `signal`。
    pub fn after_write_signal(
        &self,
        handle: ConnectionHandle,
        signal: impl FnOnce() + Send + 'static,
    ) -> Result<(), ConduitError> {
        self.core.after_write_signal(handle, Box::new(signal))
    }

    pub fn peek_received(
        &self,
        handle: ConnectionHandle,
        out: &mut [u8],
    ) -> Result<usize, ConduitError> {
        self.core.peek_received(handle, out)
    }

    pub fn consume_received(
        &self,
        handle: ConnectionHandle,
        count: usize,
    ) -> Result<usize, ConduitError> {
        self.core.consume_received(handle, count)
    }

    pub fn received_len(&self, handle: ConnectionHandle) -> Result<usize, ConduitError> {
        self.core.received_len(handle)
    }

    pub fn pause_input(&self, handle: ConnectionHandle) -> Result<(), ConduitError> {
        self.core.pause_input(handle)
    }

    pub fn resume_input(&self, handle: ConnectionHandle) -> Result<(), ConduitError> {
        self.core.resume_input(handle)
    }

    pub fn pause_output(&self, handle: ConnectionHandle) -> Result<(), ConduitError> {
        self.core.pause_output(handle)
    }

    pub fn resume_output(&self, handle: ConnectionHandle) -> Result<(), ConduitError> {
        self.core.resume_output(handle)
    }

    /// 在已有连接上就地启用 TLS；角色由连接类别决定。
    pub fn enable_tls(
        &self,
        handle: ConnectionHandle,
        options: &TlsOptions,
    ) -> Result<(), ConduitError> {
        self.core.enable_tls(handle, options)
    }

    /// 关闭连接；`error` 为 `None` 表示优雅关闭。返回最终记录的错误。
    pub fn close(
        &self,
        handle: ConnectionHandle,
        error: Option<ConduitError>,
    ) -> Result<Option<ConduitError>, ConduitError> {
        self.core.close(handle, error)
    }

    pub fn is_connected(&self, handle: ConnectionHandle) -> bool {
        ConnectionRef::acquire(&self.core, handle)
            .map(|conn| {
                let state = conn.state.load();
                state & CONNECTED != 0 && state & CLOSED == 0
            })
            .unwrap_or(false)
    }

    /// 已关闭或已销毁（句柄无效）的连接都视为已关闭。
    pub fn is_closed(&self, handle: ConnectionHandle) -> bool {
        ConnectionRef::acquire(&self.core, handle)
            .map(|conn| conn.state.contains(CLOSED))
            .unwrap_or(true)
    }

    pub fn is_handshake_done(&self, handle: ConnectionHandle) -> bool {
        self.core.is_handshake_done(handle)
    }

    /// 首个记录的关闭错误；未关闭或优雅关闭时为 `None`。连接销毁后仍可查询。
    pub fn error_code(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Option<ConduitError>, ConduitError> {
        match self.core.acquire(handle) {
            Ok(conn) => Ok(conn.recorded_error()),
            Err(err) => self.core.settled_status(handle).ok_or(err),
        }
    }

    pub fn connection_stats(
        &self,
        handle: ConnectionHandle,
    ) -> Result<ConnectionStats, ConduitError> {
        let conn = self.core.acquire(handle)?;
        Ok(conn.stats.snapshot())
    }

    /// 尚未销毁的连接数。
    pub fn connection_count(&self) -> usize {
        self.core.registry.len()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.core.pool.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.finalize();
    }
}
