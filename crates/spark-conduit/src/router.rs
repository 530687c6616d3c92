//! 完成路由器。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 调度池线程交回的每一个完成都从这里进入引擎；路由器按 Packet 类别分派到读写流水线，
//!   并在每次分派之后统一结算：数据回调、链路拆除、一次性关停序列。
//!
//! ## 逻辑（How）
//! - 提交时同步完成的操作不递归路由，而是压入本地工作表，由同一次 `route` 调用依次处理；
//! - 完成所持有的租约由 [`ConnectionRef::adopt`] 接管，路由结束时随引用析构归还；
//! - 调度池不可用时完成会在提交方线程上就地路由；若该线程已处于路由之中（此时可能仍持有连接锁），
//!   完成改为压入线程局部的延后队列，由最外层 `route` 在释放全部锁之后处理；
//! - 结算顺序固定为：数据回调 → 拆除判定 → 关停判定。
//!
//! ## 契约（What）
//! - 路由期间不持有任何连接锁调用用户回调；
//! - `owner` 指向不存在的连接时只记录告警并归还 Packet。

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    sync::Arc,
};

use spark_buffer::{Packet, PacketKind};
use tracing::{debug, warn};

use crate::{
    callbacks::{self, ConnectionContext},
    connection::{Connection, ConnectionRef},
    engine::EngineCore,
    handle::ConnectionHandle,
    lifecycle,
    read::{self, ReadEffects},
    state::{CLOSED, CONNECTED},
    write,
};

/// 同步完成的后续工作。
pub(crate) type Worklist = VecDeque<(Packet, io::Result<usize>)>;

type Deferred = VecDeque<(Arc<EngineCore>, Packet, io::Result<usize>)>;

thread_local! {
    static ROUTING: Cell<bool> = const { Cell::new(false) };
    static DEFERRED: RefCell<Deferred> = const { RefCell::new(VecDeque::new()) };
}

/// 离开最外层路由时清除线程标记，回调恐慌展开时同样生效。
struct RoutingScope;

impl RoutingScope {
    fn enter() -> Option<Self> {
        if ROUTING.with(|routing| routing.replace(true)) {
            None
        } else {
            Some(Self)
        }
    }
}

impl Drop for RoutingScope {
    fn drop(&mut self) {
        ROUTING.with(|routing| routing.set(false));
    }
}

/// 处理一个外部完成及其引发的全部同步后续完成。
pub(crate) fn route(core: &Arc<EngineCore>, packet: Packet, result: io::Result<usize>) {
    let Some(_scope) = RoutingScope::enter() else {
        DEFERRED.with(|deferred| {
            deferred
                .borrow_mut()
                .push_back((Arc::clone(core), packet, result));
        });
        return;
    };
    drain_worklist(core, packet, result);
    while let Some((core, packet, result)) =
        DEFERRED.with(|deferred| deferred.borrow_mut().pop_front())
    {
        drain_worklist(&core, packet, result);
    }
}

fn drain_worklist(core: &Arc<EngineCore>, packet: Packet, result: io::Result<usize>) {
    let mut work = Worklist::new();
    work.push_back((packet, result));
    while let Some((packet, result)) = work.pop_front() {
        route_one(core, packet, result, &mut work);
    }
}

fn route_one(
    core: &Arc<EngineCore>,
    packet: Packet,
    result: io::Result<usize>,
    work: &mut Worklist,
) {
    let conn = match ConnectionHandle::from_raw(packet.owner())
        .and_then(|handle| ConnectionRef::adopt(core, handle))
    {
        Some(conn) => conn,
        None => {
            warn!(
                owner = packet.owner(),
                kind = ?packet.kind(),
                "completion for an unknown connection dropped"
            );
            core.pool.release(packet, None);
            return;
        }
    };

    match packet.kind() {
        PacketKind::InitialSetup => {
            core.pool.release(packet, Some(&conn.local));
            on_setup(core, &conn, work);
        }
        PacketKind::ZeroByteProbe => {
            let effects = read::on_probe_complete(core, &conn, packet, result, work);
            apply(core, &conn, effects, work);
        }
        PacketKind::Read => {
            let effects = read::on_read_complete(core, &conn, packet, result, work);
            apply(core, &conn, effects, work);
        }
        PacketKind::WriteRequest | PacketKind::Discard => {
            core.pool.release(packet, Some(&conn.local));
            write::drain_outgoing(core, &conn, work);
        }
        PacketKind::Write => {
            if let Some(status) = write::on_write_complete(core, &conn, packet, result) {
                lifecycle::close(core, &conn, status);
            }
            write::drain_outgoing(core, &conn, work);
        }
        PacketKind::ResumeProcessing => {
            core.pool.release(packet, Some(&conn.local));
            let effects = read::resume(core, &conn, work);
            apply(core, &conn, effects, work);
            write::drain_outgoing(core, &conn, work);
        }
    }

    settle(core, &conn, work);
}

fn on_setup(core: &Arc<EngineCore>, conn: &Connection, work: &mut Worklist) {
    if !conn.state.contains(CLOSED) && conn.state.insert(CONNECTED) {
        debug!(
            handle = %conn.handle,
            class = ?conn.class,
            link = %conn.link.describe(),
            "connection established"
        );
        let ctx = ConnectionContext::new(core, conn.handle);
        if let Err(err) = callbacks::invoke("on_connect", || conn.handler.on_connect(&ctx)) {
            lifecycle::close(core, conn, Err(err));
            return;
        }
    }
    let effects = read::resume(core, conn, work);
    apply(core, conn, effects, work);
}

fn apply(core: &EngineCore, conn: &Connection, effects: ReadEffects, work: &mut Worklist) {
    if effects.handshake_completed {
        write::drain_outgoing(core, conn, work);
    }
    if let Some(status) = effects.close {
        lifecycle::close(core, conn, status);
    }
}

fn settle(core: &Arc<EngineCore>, conn: &Connection, work: &mut Worklist) {
    callbacks::deliver(core, conn, false);
    lifecycle::maybe_teardown(core, conn, work);
    lifecycle::maybe_finish(core, conn);
}
