//! 读流水线。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 同一连接上保持多个读同时在途以压满链路，但完成顺序不确定；
//!   读在提交时分配序号，完成后进入按序号索引的待交付表，只从“下一个应交付序号”开始连续排空。
//!
//! ## 逻辑（How）
//! - 序号分配与提交在 `reads` 锁内完成，提交顺序因此与序号一致；
//! - 零字节或错误完成也占据其序号（以空槽表示），避免后续序号永远等待；
//! - 排空时若连接启用了 TLS，密文交给 TLS 桥接，否则直接追加到接收缓冲；
//! - 预取策略：开启零字节探测且链路支持时，空闲连接只保留一个探测，探测完成后补满预取窗口，
//!   最后一个真实读完成后重新探测；否则始终保持 `read_ahead` 个读在途。
//!
//! ## 契约（What）
//! - 暂停输入同时抑制补读与排空；
//! - 关闭后不再补读；非优雅关闭后不再排空；
//! - 锁顺序：`reads` → `tls` → 链路；接收缓冲锁为叶子锁。

use std::{collections::BTreeMap, io, sync::atomic::Ordering};

use spark_buffer::{LARGE_PACKET_CAPACITY, Packet, PacketKind, SMALL_PACKET_CAPACITY};
use spark_transport::Submission;
use tracing::{debug, trace};

use crate::{
    connection::Connection,
    engine::EngineCore,
    error::ConduitError,
    handle::ConnectionClass,
    router::Worklist,
    state::{CLOSED, GRACEFUL_SHUTDOWN, HAS_TLS, INPUT_PAUSED, LINK_TORN_DOWN},
    tls::{self, TlsOutcome},
};

#[derive(Debug, Default)]
pub(crate) struct ReadState {
    next_assigned: u64,
    next_to_deliver: u64,
    /// `None` 表示该序号以零字节或错误完成，只推进游标。
    pending: BTreeMap<u64, Option<Packet>>,
    /// 在途的真实读数量。
    outstanding: usize,
    probing: bool,
}

impl ReadState {
    fn take_pending(&mut self) -> Vec<Packet> {
        std::mem::take(&mut self.pending)
            .into_values()
            .flatten()
            .collect()
    }
}

/// 读流水线在释放锁之后需要执行的动作。
#[derive(Debug, Default)]
pub(crate) struct ReadEffects {
    pub(crate) close: Option<Result<(), ConduitError>>,
    pub(crate) handshake_completed: bool,
}

impl ReadEffects {
    fn close_with(&mut self, status: Result<(), ConduitError>) {
        if self.close.is_none() {
            self.close = Some(status);
        }
    }

    fn absorb_tls(&mut self, outcome: TlsOutcome) -> bool {
        self.handshake_completed |= outcome.handshake_completed;
        if let Some(err) = outcome.failure {
            self.close_with(Err(err));
            return false;
        }
        if outcome.peer_closed {
            self.close_with(Ok(()));
        }
        true
    }
}

fn can_issue_reads(conn: &Connection) -> bool {
    conn.class != ConnectionClass::Listener
        && conn.state.load() & (CLOSED | INPUT_PAUSED | LINK_TORN_DOWN) == 0
}

fn drain_allowed(conn: &Connection) -> bool {
    let state = conn.state.load();
    state & INPUT_PAUSED == 0 && (state & CLOSED == 0 || state & GRACEFUL_SHUTDOWN != 0)
}

fn probes_enabled(core: &EngineCore, conn: &Connection) -> bool {
    core.config.zero_byte_probe && conn.link.supports_zero_byte_probe()
}

fn refill(
    core: &EngineCore,
    conn: &Connection,
    reads: &mut ReadState,
    work: &mut Worklist,
    effects: &mut ReadEffects,
) {
    if !can_issue_reads(conn) {
        return;
    }
    if probes_enabled(core, conn) {
        if reads.outstanding == 0 && !reads.probing {
            issue_probe(core, conn, reads, work, effects);
        }
    } else {
        let wanted = core.config.read_ahead.saturating_sub(reads.outstanding);
        issue_reads(core, conn, reads, wanted, work, effects);
    }
}

fn issue_reads(
    core: &EngineCore,
    conn: &Connection,
    reads: &mut ReadState,
    count: usize,
    work: &mut Worklist,
    effects: &mut ReadEffects,
) {
    for _ in 0..count {
        let mut packet = core
            .pool
            .acquire(PacketKind::Read, LARGE_PACKET_CAPACITY, Some(&conn.local));
        packet.set_owner(conn.handle.get());
        packet.set_sequence(reads.next_assigned);
        reads.next_assigned += 1;
        reads.outstanding += 1;
        if !submit(core, conn, reads, packet, work, effects) {
            break;
        }
    }
}

fn issue_probe(
    core: &EngineCore,
    conn: &Connection,
    reads: &mut ReadState,
    work: &mut Worklist,
    effects: &mut ReadEffects,
) {
    let mut packet = core.pool.acquire(
        PacketKind::ZeroByteProbe,
        SMALL_PACKET_CAPACITY,
        Some(&conn.local),
    );
    packet.set_owner(conn.handle.get());
    reads.probing = true;
    submit(core, conn, reads, packet, work, effects);
}

/// 把一个读或探测交给链路；返回 `false` 表示链路当场拒绝，调用方应停止继续提交。
///
/// 当场拒绝的操作从未进入链路：撤销它占用的序号与计数、归还租约，并以优雅方式关闭连接，
/// 让已排队的写仍有机会送出。
fn submit(
    core: &EngineCore,
    conn: &Connection,
    reads: &mut ReadState,
    packet: Packet,
    work: &mut Worklist,
    effects: &mut ReadEffects,
) -> bool {
    conn.incoming.fetch_add(1, Ordering::AcqRel);
    conn.retain_op();
    let (packet, error) = match conn.link.submit_read(packet, core.port()) {
        Submission::Pending => return true,
        Submission::Completed {
            mut packet,
            transferred,
        } => {
            packet.set_len(transferred);
            work.push_back((packet, Ok(transferred)));
            return true;
        }
        Submission::EndOfStream(packet) => {
            work.push_back((packet, Ok(0)));
            return true;
        }
        Submission::WouldBlock(packet) => (packet, io::Error::from(io::ErrorKind::WouldBlock)),
        Submission::Failed { packet, error } => (packet, error),
    };
    if packet.kind() == PacketKind::ZeroByteProbe {
        reads.probing = false;
    } else {
        reads.next_assigned -= 1;
        reads.outstanding = reads.outstanding.saturating_sub(1);
    }
    debug!(
        handle = %conn.handle,
        kind = ?packet.kind(),
        error = %error,
        "link refused a read; closing gracefully"
    );
    core.pool.release(packet, Some(&conn.local));
    conn.incoming.fetch_sub(1, Ordering::AcqRel);
    conn.release(core);
    effects.close_with(Ok(()));
    false
}

/// 连续排空待交付表。
fn drain(
    core: &EngineCore,
    conn: &Connection,
    reads: &mut ReadState,
    work: &mut Worklist,
    effects: &mut ReadEffects,
) {
    if !drain_allowed(conn) {
        return;
    }
    let mut appended = false;
    while let Some(entry) = reads.pending.first_entry() {
        if *entry.key() != reads.next_to_deliver {
            break;
        }
        let slot = entry.remove();
        reads.next_to_deliver += 1;
        let Some(packet) = slot else {
            continue;
        };
        let healthy = if conn.state.contains(HAS_TLS) {
            let outcome = tls::absorb_inbound(core, conn, packet.filled(), work);
            effects.absorb_tls(outcome)
        } else {
            conn.ring.lock().append(packet.filled());
            appended = true;
            true
        };
        core.pool.release(packet, Some(&conn.local));
        if !healthy {
            break;
        }
    }
    if appended {
        conn.new_data.store(true, Ordering::Release);
    }
}

/// 路由一个读完成。
pub(crate) fn on_read_complete(
    core: &EngineCore,
    conn: &Connection,
    mut packet: Packet,
    result: io::Result<usize>,
    work: &mut Worklist,
) -> ReadEffects {
    let mut effects = ReadEffects::default();
    {
        let mut reads = conn.reads.lock();
        reads.outstanding = reads.outstanding.saturating_sub(1);
        let sequence = packet.sequence();
        match result {
            Ok(transferred) if transferred > 0 => {
                packet.set_len(transferred);
                conn.stats.record_read(transferred);
                trace!(
                    handle = %conn.handle,
                    seq = sequence,
                    bytes = transferred,
                    "read completed"
                );
                reads.pending.insert(sequence, Some(packet));
            }
            Ok(_) => {
                debug!(handle = %conn.handle, seq = sequence, "peer closed its write side");
                reads.pending.insert(sequence, None);
                core.pool.release(packet, Some(&conn.local));
                effects.close_with(Ok(()));
            }
            Err(err) => {
                debug!(handle = %conn.handle, seq = sequence, error = %err, "read failed");
                reads.pending.insert(sequence, None);
                core.pool.release(packet, Some(&conn.local));
                effects.close_with(Err(err.into()));
            }
        }
        drain(core, conn, &mut reads, work, &mut effects);
        if effects.close.is_none() {
            refill(core, conn, &mut reads, work, &mut effects);
        }
    }
    conn.incoming.fetch_sub(1, Ordering::AcqRel);
    effects
}

/// 路由一个零字节探测完成：链路已有数据可读，转为真实读。
pub(crate) fn on_probe_complete(
    core: &EngineCore,
    conn: &Connection,
    packet: Packet,
    result: io::Result<usize>,
    work: &mut Worklist,
) -> ReadEffects {
    let mut effects = ReadEffects::default();
    core.pool.release(packet, Some(&conn.local));
    {
        let mut reads = conn.reads.lock();
        reads.probing = false;
        match result {
            Ok(_) => {
                if can_issue_reads(conn) {
                    issue_reads(
                        core,
                        conn,
                        &mut reads,
                        core.config.read_ahead,
                        work,
                        &mut effects,
                    );
                }
            }
            Err(err) => {
                debug!(handle = %conn.handle, error = %err, "zero-byte probe failed");
                effects.close_with(Err(err.into()));
            }
        }
    }
    conn.incoming.fetch_sub(1, Ordering::AcqRel);
    effects
}

/// 连接建立或恢复输入时：推进 TLS、重放排空并补满预取窗口。
pub(crate) fn resume(core: &EngineCore, conn: &Connection, work: &mut Worklist) -> ReadEffects {
    let mut effects = ReadEffects::default();
    let mut reads = conn.reads.lock();
    if conn.state.contains(HAS_TLS) && !effects.absorb_tls(tls::kick(core, conn, work)) {
        return effects;
    }
    drain(core, conn, &mut reads, work, &mut effects);
    if effects.close.is_none() {
        refill(core, conn, &mut reads, work, &mut effects);
    }
    effects
}

/// 关停序列：归还仍滞留在待交付表中的 Packet。
pub(crate) fn release_pending(core: &EngineCore, conn: &Connection) -> usize {
    let packets = conn.reads.lock().take_pending();
    let count = packets.len();
    core.pool.release_all(packets, Some(&conn.local));
    count
}
