//! 连接侧的 TLS 桥接胶水。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - [`TlsSession`] 只认识两条字节队列；本模块负责把读流水线排出的密文送进会话、
//!   把会话产生的密文交给写流水线提交，并把握手完成、对端 `close_notify`、记录层错误
//!   翻译为连接状态变化。
//!
//! ## 逻辑（How）
//! - 入站：在 `tls` 锁内追加密文，然后循环 `advance` → 明文进入接收缓冲 → 密文立即提交，
//!   直到某一轮不再有进展；
//! - 所有密文都在 `tls` 锁内提交，握手记录与应用数据记录因此保持产生顺序；
//! - 出错时先把会话排队的告警密文发出，再由调用方关闭连接。
//!
//! ## 契约（What）
//! - 调用方若同时需要 `reads` 锁，必须先于 `tls` 锁获取；
//! - 会话被关停序列拆除后，迟到的密文直接丢弃。

use std::sync::atomic::Ordering;

use spark_buffer::{LARGE_PACKET_CAPACITY, PacketKind};
use spark_transport_tls::{TlsOptions, TlsRole, TlsSession};
use tracing::{debug, trace, warn};

use crate::{
    connection::Connection,
    engine::EngineCore,
    error::ConduitError,
    handle::ConnectionClass,
    router::Worklist,
    state::{HANDSHAKE_DONE, HAS_TLS},
    write::{self, Submitted},
};

/// 一次入站处理的结果。
#[derive(Debug, Default)]
pub(crate) struct TlsOutcome {
    pub(crate) failure: Option<ConduitError>,
    pub(crate) handshake_completed: bool,
    pub(crate) peer_closed: bool,
}

/// 密文提交结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Flush {
    Drained,
    Blocked,
    Failed,
}

pub(crate) fn role_for(class: ConnectionClass) -> Result<TlsRole, ConduitError> {
    match class {
        ConnectionClass::Client => Ok(TlsRole::Client),
        ConnectionClass::Server => Ok(TlsRole::Server),
        ConnectionClass::Listener => Err(ConduitError::invalid(
            "TLS cannot be enabled on a listener connection",
        )),
    }
}

pub(crate) fn new_session(
    class: ConnectionClass,
    options: &TlsOptions,
) -> Result<TlsSession, ConduitError> {
    let role = role_for(class)?;
    if role == TlsRole::Client && options.verify_certificates && options.hostname.is_none() {
        return Err(ConduitError::invalid(
            "certificate verification requires a hostname",
        ));
    }
    Ok(TlsSession::new(role, options)?)
}

/// 在已有连接上就地启用 TLS。
pub(crate) fn install(conn: &Connection, session: TlsSession) -> Result<(), ConduitError> {
    let _reads = conn.reads.lock();
    let mut slot = conn.tls.lock();
    if slot.is_some() || conn.state.contains(HAS_TLS) {
        return Err(ConduitError::invalid("TLS is already enabled"));
    }
    *slot = Some(session);
    conn.state.insert(HAS_TLS);
    debug!(handle = %conn.handle, "TLS enabled");
    Ok(())
}

pub(crate) fn absorb_inbound(
    core: &EngineCore,
    conn: &Connection,
    ciphertext: &[u8],
    work: &mut Worklist,
) -> TlsOutcome {
    let mut guard = conn.tls.lock();
    let Some(session) = guard.as_mut() else {
        trace!(
            handle = %conn.handle,
            bytes = ciphertext.len(),
            "TLS torn down; ciphertext dropped"
        );
        return TlsOutcome::default();
    };
    session.absorb(ciphertext);
    pump(core, conn, session, work)
}

/// 无新密文时推进一轮，用于发出 ClientHello 或补发积压密文。
pub(crate) fn kick(core: &EngineCore, conn: &Connection, work: &mut Worklist) -> TlsOutcome {
    let mut guard = conn.tls.lock();
    match guard.as_mut() {
        Some(session) => pump(core, conn, session, work),
        None => TlsOutcome::default(),
    }
}

fn pump(
    core: &EngineCore,
    conn: &Connection,
    session: &mut TlsSession,
    work: &mut Worklist,
) -> TlsOutcome {
    let mut outcome = TlsOutcome::default();
    let mut plaintext = false;
    loop {
        let advanced = session.advance(&mut |bytes| {
            conn.ring.lock().append(bytes);
            plaintext = true;
        });
        let flushed = flush_ciphertext(core, conn, session, work);
        match advanced {
            Err(err) => {
                warn!(handle = %conn.handle, error = %err, "TLS record processing failed");
                outcome.failure = Some(err.into());
                break;
            }
            Ok(progress) => {
                if progress.handshake_completed && conn.state.insert(HANDSHAKE_DONE) {
                    debug!(
                        handle = %conn.handle,
                        role = ?session.role(),
                        "TLS handshake completed"
                    );
                    outcome.handshake_completed = true;
                }
                outcome.peer_closed |= progress.peer_closed;
                if !progress.progressed || flushed == Flush::Failed {
                    break;
                }
            }
        }
    }
    if plaintext {
        conn.new_data.store(true, Ordering::Release);
    }
    outcome
}

/// 把会话中待发送的密文按大档 Packet 分块提交。
pub(crate) fn flush_ciphertext(
    core: &EngineCore,
    conn: &Connection,
    session: &mut TlsSession,
    work: &mut Worklist,
) -> Flush {
    while let Some(chunk) = session.take_ciphertext(LARGE_PACKET_CAPACITY) {
        let mut packet = core
            .pool
            .acquire(PacketKind::Write, chunk.len(), Some(&conn.local));
        packet.fill_from(&chunk);
        match write::submit_packet(core, conn, packet, work) {
            Submitted::Sent => {}
            Submitted::Blocked => {
                session.requeue_ciphertext(&chunk);
                return Flush::Blocked;
            }
            Submitted::Failed => return Flush::Failed,
        }
    }
    Flush::Drained
}

/// 优雅拆除前排队 `close_notify` 并提交其密文。
pub(crate) fn close_notify(core: &EngineCore, conn: &Connection, work: &mut Worklist) {
    let mut guard = conn.tls.lock();
    let Some(session) = guard.as_mut() else {
        return;
    };
    if let Err(err) = session.close_notify() {
        debug!(handle = %conn.handle, error = %err, "failed to queue close_notify");
        return;
    }
    flush_ciphertext(core, conn, session, work);
}

/// 关停序列：丢弃会话。
pub(crate) fn teardown(conn: &Connection) {
    if conn.tls.lock().take().is_some() {
        trace!(handle = %conn.handle, "TLS session torn down");
    }
}
