//! 连接关闭、链路拆除与一次性关停序列。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 关闭可能由用户、读写失败、TLS 故障、对端断开或引擎关停并发触发，各方必须收敛到同一个
//!   首次记录的状态，且后续清理只执行一次；
//! - 优雅关闭要先把已排队的写与 TLS `close_notify` 送出，再拆除链路；非优雅关闭立即拆除。
//!
//! ## 逻辑（How）
//! - `close`：良性断开降级为成功 → `OnceLock` 首写者胜出 → 状态字置 `CLOSED`；
//!   首个关闭者释放注册表持有，并投递一个 `Discard` 控制事件驱动后续结算；
//! - `maybe_teardown`：优雅关闭且出站计数归零后发送 `close_notify`，其密文也排空后拆除链路；
//! - `maybe_finish`：已关闭且两个在途计数均为零时进入关停序列，由状态字保证只执行一次；
//!   序列末尾释放生命周期持有，租约归零的线程随后执行销毁。
//!
//! ## 契约（What）
//! - `on_disconnect` 只对到达过 `CONNECTED` 的连接触发且恰好一次，携带首个记录的错误；
//! - 后到的关闭状态只进入 `debug` 日志。

use std::sync::{Arc, atomic::Ordering};

use spark_buffer::PacketKind;
use spark_transport::TeardownMode;
use tracing::{debug, trace};

use crate::{
    callbacks::{self, ConnectionContext},
    connection::Connection,
    engine::EngineCore,
    error::{ConduitError, downgrade_benign},
    read,
    router::Worklist,
    state::{
        CLOSE_NOTIFY_SENT, CLOSED, CONNECTED, DISCONNECT_FIRED, GRACEFUL_SHUTDOWN,
        HANDSHAKE_DONE, HAS_TLS, LINK_TORN_DOWN, OUTPUT_PAUSED,
    },
    tls, write,
};

/// 关闭连接；只有首个关闭状态被记录。
pub(crate) fn close(core: &EngineCore, conn: &Connection, status: Result<(), ConduitError>) {
    let status = downgrade_benign(status);
    let graceful = status.is_ok();
    if conn.record_status(status.clone()) {
        conn.state.mark_closed(graceful);
        match &status {
            Ok(()) => debug!(handle = %conn.handle, "connection closed gracefully"),
            Err(err) => debug!(handle = %conn.handle, error = %err, "connection closed"),
        }
        if graceful {
            // 暂停的输出会让排队项永远无法排空。
            conn.state.remove(OUTPUT_PAUSED);
        } else {
            write::discard_queue(conn);
        }
        conn.release_registry_hold(core);
        core.post_control(conn, PacketKind::Discard);
    } else if let Err(err) = &status {
        debug!(handle = %conn.handle, error = %err, "later close status dropped");
    }
}

pub(crate) fn teardown_link(conn: &Connection, mode: TeardownMode) {
    if conn.state.insert(LINK_TORN_DOWN) {
        trace!(handle = %conn.handle, ?mode, "tearing down link");
        conn.link.teardown(mode);
    }
}

/// 已关闭的连接在条件满足时拆除链路。
pub(crate) fn maybe_teardown(core: &EngineCore, conn: &Connection, work: &mut Worklist) {
    let state = conn.state.load();
    if state & CLOSED == 0 || state & LINK_TORN_DOWN != 0 {
        return;
    }
    if state & GRACEFUL_SHUTDOWN == 0 {
        teardown_link(conn, TeardownMode::Abortive);
        return;
    }
    if conn.outgoing_writes.load(Ordering::Acquire) > 0 {
        return;
    }
    if state & HAS_TLS != 0 && state & HANDSHAKE_DONE != 0 && conn.state.insert(CLOSE_NOTIFY_SENT)
    {
        tls::close_notify(core, conn, work);
        if conn.outgoing_writes.load(Ordering::Acquire) > 0 {
            return;
        }
    }
    teardown_link(conn, TeardownMode::Graceful);
}

/// 两个在途计数归零后执行一次性关停序列。
pub(crate) fn maybe_finish(core: &Arc<EngineCore>, conn: &Connection) {
    if !conn.state.contains(CLOSED)
        || conn.incoming.load(Ordering::Acquire) > 0
        || conn.outgoing_writes.load(Ordering::Acquire) > 0
    {
        return;
    }
    if !conn.state.begin_shutdown() {
        return;
    }
    let graceful = conn.state.contains(GRACEFUL_SHUTDOWN);
    debug!(handle = %conn.handle, graceful, "running shutdown sequence");

    conn.wait_delivery_idle();
    teardown_link(
        conn,
        if graceful {
            TeardownMode::Graceful
        } else {
            TeardownMode::Abortive
        },
    );
    tls::teardown(conn);
    if graceful {
        callbacks::deliver(core, conn, true);
    }
    let dropped = read::release_pending(core, conn);
    if dropped > 0 {
        trace!(handle = %conn.handle, packets = dropped, "undelivered reads released");
    }

    if conn.state.contains(CONNECTED) && conn.state.insert(DISCONNECT_FIRED) {
        let ctx = ConnectionContext::new(core, conn.handle);
        let error = conn.recorded_error();
        callbacks::notify("on_disconnect", || {
            conn.handler.on_disconnect(&ctx, error.as_ref())
        });
    }
    conn.release(core);
}
