//! 集成测试共享设施：脚本化链路、记录型处理器与等待工具。
#![allow(dead_code)]

use std::{
    borrow::Cow,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result, bail};
use parking_lot::Mutex;
use spark_buffer::Packet;
use spark_conduit::{
    ConduitError, ConnectionContext, ConnectionHandle, ConnectionHandler, Engine, EngineConfig,
    FixedDispatchPool,
};
use spark_transport::{AsyncLink, CompletionPort, Submission, TeardownMode};

pub const WAIT: Duration = Duration::from_secs(10);

/// 轮询等待条件成立。
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

pub fn expect_within(what: &str, condition: impl FnMut() -> bool) -> Result<()> {
    if wait_until(condition) {
        Ok(())
    } else {
        bail!("timed out waiting for {what}")
    }
}

/// 已初始化的引擎及其调度池；析构时先终结引擎再关闭调度池。
pub struct Harness {
    pub engine: Engine,
    pub pool: Arc<FixedDispatchPool>,
}

impl Harness {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let engine = Engine::new(config).context("构造引擎失败")?;
        let pool = Arc::new(FixedDispatchPool::new(2).context("启动调度池失败")?);
        engine
            .initialize(pool.clone())
            .context("初始化引擎失败")?;
        Ok(Self { engine, pool })
    }

    pub fn without_probes() -> Result<Self> {
        Self::new(
            EngineConfig::builder()
                .zero_byte_probe(false)
                .build()
                .context("构造配置失败")?,
        )
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.engine.finalize();
        self.pool.shutdown();
    }
}

#[derive(Default)]
struct Script {
    reads: Vec<(Packet, Arc<dyn CompletionPort>)>,
    writes: Vec<(Packet, Arc<dyn CompletionPort>)>,
    submitted: Vec<u8>,
    in_flight: usize,
    peak_in_flight: usize,
    teardown: Option<TeardownMode>,
}

type Ready = Vec<(Packet, Arc<dyn CompletionPort>, io::Result<usize>)>;

fn deliver(ready: Ready) {
    for (packet, port, result) in ready {
        port.complete(packet, result);
    }
}

/// 所有读写都挂起、由测试显式完成的链路。
///
/// 读按序号定位，写按提交位置定位，因此测试可以按任意顺序回送完成。
/// `defer_teardown` 开启时拆除只被记录，挂起操作要等 `cancel_all` 才以错误完成；
/// `refuse_reads` 开启后新的读提交当场失败。
#[derive(Default)]
pub struct ScriptedLink {
    script: Mutex<Script>,
    defer_teardown: AtomicBool,
    refuse_reads: AtomicBool,
}

impl ScriptedLink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn deferred_teardown() -> Arc<Self> {
        let link = Self::default();
        link.defer_teardown.store(true, Ordering::SeqCst);
        Arc::new(link)
    }

    /// 此后的读提交以 `ConnectionRefused` 当场失败。
    pub fn refuse_reads(&self) {
        self.refuse_reads.store(true, Ordering::SeqCst);
    }

    pub fn pending_reads(&self) -> usize {
        self.script.lock().reads.len()
    }

    pub fn pending_read_sequences(&self) -> Vec<u64> {
        self.script
            .lock()
            .reads
            .iter()
            .map(|(packet, _)| packet.sequence())
            .collect()
    }

    pub fn pending_writes(&self) -> usize {
        self.script.lock().writes.len()
    }

    /// 已提交给链路的全部写字节（按提交顺序）。
    pub fn submitted(&self) -> Vec<u8> {
        self.script.lock().submitted.clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.script.lock().peak_in_flight
    }

    pub fn teardown_mode(&self) -> Option<TeardownMode> {
        self.script.lock().teardown
    }

    /// 以 `data` 完成序号为 `sequence` 的挂起读；该读不存在时返回 `false`。
    pub fn complete_read(&self, sequence: u64, data: &[u8]) -> bool {
        let entry = {
            let mut script = self.script.lock();
            let Some(index) = script
                .reads
                .iter()
                .position(|(packet, _)| packet.sequence() == sequence)
            else {
                return false;
            };
            script.reads.remove(index)
        };
        let (mut packet, port) = entry;
        let count = data.len().min(packet.capacity());
        packet.spare_mut()[..count].copy_from_slice(&data[..count]);
        packet.set_len(count);
        port.complete(packet, Ok(count));
        true
    }

    /// 以流结束完成最早的挂起读。
    pub fn complete_read_eof(&self) -> bool {
        let entry = {
            let mut script = self.script.lock();
            if script.reads.is_empty() {
                return false;
            }
            script.reads.remove(0)
        };
        let (packet, port) = entry;
        port.complete(packet, Ok(0));
        true
    }

    /// 按提交位置完成一个挂起写。
    pub fn complete_write(&self, index: usize) -> bool {
        self.finish_write(index, None)
    }

    /// 以少于请求长度的字节数完成一个挂起写。
    pub fn complete_write_short(&self, index: usize, written: usize) -> bool {
        self.finish_write(index, Some(written))
    }

    fn finish_write(&self, index: usize, written: Option<usize>) -> bool {
        let entry = {
            let mut script = self.script.lock();
            if index >= script.writes.len() {
                return false;
            }
            let entry = script.writes.remove(index);
            script.in_flight -= entry.0.len();
            entry
        };
        let (packet, port) = entry;
        let written = written.unwrap_or(packet.len());
        port.complete(packet, Ok(written));
        true
    }

    /// 从最新到最旧完成全部挂起写；返回完成数量。
    pub fn complete_writes_reversed(&self) -> usize {
        let mut completed = 0;
        while self.complete_write(self.pending_writes().saturating_sub(1)) {
            completed += 1;
        }
        completed
    }

    /// 以 `ConnectionAborted` 完成全部挂起操作。
    pub fn cancel_all(&self) {
        let ready: Ready = {
            let mut script = self.script.lock();
            script.in_flight = 0;
            let reads = std::mem::take(&mut script.reads);
            let writes = std::mem::take(&mut script.writes);
            reads
                .into_iter()
                .chain(writes)
                .map(|(packet, port)| {
                    (
                        packet,
                        port,
                        Err(io::Error::from(io::ErrorKind::ConnectionAborted)),
                    )
                })
                .collect()
        };
        deliver(ready);
    }
}

impl AsyncLink for ScriptedLink {
    fn submit_read(&self, packet: Packet, port: &Arc<dyn CompletionPort>) -> Submission {
        if self.refuse_reads.load(Ordering::SeqCst) {
            return Submission::Failed {
                packet,
                error: io::Error::from(io::ErrorKind::ConnectionRefused),
            };
        }
        let mut script = self.script.lock();
        if script.teardown.is_some() {
            return Submission::Failed {
                packet,
                error: io::Error::from(io::ErrorKind::ConnectionAborted),
            };
        }
        script.reads.push((packet, Arc::clone(port)));
        Submission::Pending
    }

    fn submit_write(&self, packet: Packet, port: &Arc<dyn CompletionPort>) -> Submission {
        let mut script = self.script.lock();
        if script.teardown.is_some() {
            return Submission::Failed {
                packet,
                error: io::Error::from(io::ErrorKind::BrokenPipe),
            };
        }
        script.submitted.extend_from_slice(packet.filled());
        script.in_flight += packet.len();
        script.peak_in_flight = script.peak_in_flight.max(script.in_flight);
        script.writes.push((packet, Arc::clone(port)));
        Submission::Pending
    }

    fn teardown(&self, mode: TeardownMode) {
        {
            let mut script = self.script.lock();
            if script.teardown.is_some() {
                return;
            }
            script.teardown = Some(mode);
        }
        if !self.defer_teardown.load(Ordering::SeqCst) {
            self.cancel_all();
        }
    }

    fn describe(&self) -> Cow<'_, str> {
        Cow::Borrowed("scripted")
    }
}

/// 记录全部回调的处理器；数据回调取走接收缓冲中的全部字节。
#[derive(Default)]
pub struct Recorder {
    pub connects: AtomicUsize,
    pub data_calls: AtomicUsize,
    pub received: Mutex<Vec<u8>>,
    pub disconnects: Mutex<Vec<Option<ConduitError>>>,
    pub destroyed: AtomicBool,
    in_callback: AtomicBool,
    pub overlapped: AtomicBool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub fn received_len(&self) -> usize {
        self.received.lock().len()
    }

    pub fn disconnects(&self) -> Vec<Option<ConduitError>> {
        self.disconnects.lock().clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl ConnectionHandler for Recorder {
    fn on_connect(&self, _ctx: &ConnectionContext<'_>) -> Result<(), ConduitError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_data_received(&self, ctx: &ConnectionContext<'_>) -> Result<(), ConduitError> {
        if self.in_callback.swap(true, Ordering::SeqCst) {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.data_calls.fetch_add(1, Ordering::SeqCst);
        let bytes = ctx.take_received();
        self.in_callback.store(false, Ordering::SeqCst);
        self.received.lock().extend_from_slice(&bytes?);
        Ok(())
    }

    fn on_disconnect(&self, _ctx: &ConnectionContext<'_>, error: Option<&ConduitError>) {
        self.disconnects.lock().push(error.cloned());
    }

    fn on_destroy(&self, _handle: ConnectionHandle) {
        self.destroyed.store(true, Ordering::SeqCst);
    }
}
