//! 用户回调：连接处理器、回调上下文与数据投递。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每条连接的用户逻辑以一个 [`ConnectionHandler`] trait 对象提供，由调度池线程调用；
//! - 回调内部常常需要读取接收缓冲、发送响应或关闭连接，[`ConnectionContext`] 把这些操作
//!   绑定到当前连接上，避免用户自己保存引擎与句柄。
//!
//! ## 逻辑（How）
//! - `deliver` 以“投递者”槽位串行化 `on_data_received`：同一连接同一时刻只有一个线程在回调中，
//!   回调期间到达的新数据由当前投递者在返回后再投递一轮；
//! - 所有回调都包裹在 `catch_unwind` 中，panic 被转换为 [`ConduitError::CallbackFailed`]。
//!
//! ## 契约（What）
//! - `on_connect` 或 `on_data_received` 返回的错误成为连接的关闭错误（除非已记录过其它状态）；
//! - `on_disconnect` 与 `on_destroy` 的 panic 只记录日志；
//! - 回调中调用任意引擎操作都是安全的，包括关闭当前连接。

use std::{
    any::Any,
    io::Read,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::{
    connection::Connection,
    engine::EngineCore,
    error::ConduitError,
    handle::ConnectionHandle,
    lifecycle,
    state::{CLOSED, INPUT_PAUSED},
};

/// 每条连接的事件处理器。
///
/// 全部方法都在调度池线程上调用；`on_data_received` 对同一连接从不并发。
pub trait ConnectionHandler: Send + Sync + 'static {
    /// 连接建立。返回错误会以该错误关闭连接。
    fn on_connect(&self, ctx: &ConnectionContext<'_>) -> Result<(), ConduitError> {
        let _ = ctx;
        Ok(())
    }

    /// 接收缓冲中有新数据。处理器通过 `peek_received` / `consume_received` 取用。
    fn on_data_received(&self, ctx: &ConnectionContext<'_>) -> Result<(), ConduitError>;

    /// 连接断开；`error` 为首个记录的关闭错误，优雅关闭时为 `None`。
    fn on_disconnect(&self, ctx: &ConnectionContext<'_>, error: Option<&ConduitError>) {
        let _ = (ctx, error);
    }

    /// 连接销毁，此后句柄失效。
    fn on_destroy(&self, handle: ConnectionHandle) {
        let _ = handle;
    }
}

/// 回调期间可用的连接操作。
pub struct ConnectionContext<'a> {
    core: &'a Arc<EngineCore>,
    handle: ConnectionHandle,
}

impl<'a> ConnectionContext<'a> {
    pub(crate) fn new(core: &'a Arc<EngineCore>, handle: ConnectionHandle) -> Self {
        Self { core, handle }
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn received_len(&self) -> usize {
        self.core.received_len(self.handle).unwrap_or(0)
    }

    pub fn peek_received(&self, out: &mut [u8]) -> Result<usize, ConduitError> {
        self.core.peek_received(self.handle, out)
    }

    pub fn consume_received(&self, count: usize) -> Result<usize, ConduitError> {
        self.core.consume_received(self.handle, count)
    }

    /// 取出并消费接收缓冲中的全部字节。
    pub fn take_received(&self) -> Result<Vec<u8>, ConduitError> {
        let mut out = vec![0; self.received_len()];
        let copied = self.peek_received(&mut out)?;
        out.truncate(copied);
        self.consume_received(copied)?;
        Ok(out)
    }

    pub fn send(&self, data: impl Into<Bytes>) -> Result<(), ConduitError> {
        self.core.send(self.handle, data.into())
    }

    pub fn send_stream(&self, source: impl Read + Send + 'static) -> Result<(), ConduitError> {
        self.core.send_stream(self.handle, Box::new(source))
    }

    pub fn after_write_signal(
        &self,
        signal: impl FnOnce() + Send + 'static,
    ) -> Result<(), ConduitError> {
        self.core.after_write_signal(self.handle, Box::new(signal))
    }

    pub fn pause_input(&self) -> Result<(), ConduitError> {
        self.core.pause_input(self.handle)
    }

    pub fn resume_input(&self) -> Result<(), ConduitError> {
        self.core.resume_input(self.handle)
    }

    pub fn pause_output(&self) -> Result<(), ConduitError> {
        self.core.pause_output(self.handle)
    }

    pub fn resume_output(&self) -> Result<(), ConduitError> {
        self.core.resume_output(self.handle)
    }

    pub fn is_handshake_done(&self) -> bool {
        self.core.is_handshake_done(self.handle)
    }

    /// 关闭当前连接；`error` 为 `None` 表示优雅关闭。
    pub fn close(&self, error: Option<ConduitError>) -> Result<Option<ConduitError>, ConduitError> {
        self.core.close(self.handle, error)
    }
}

fn panic_detail(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|text| (*text).to_owned())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic with non-string payload".to_owned())
}

/// 调用一个可失败的回调，panic 转为 `CallbackFailed`。
pub(crate) fn invoke(
    callback: &'static str,
    f: impl FnOnce() -> Result<(), ConduitError>,
) -> Result<(), ConduitError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let detail = panic_detail(payload.as_ref());
            warn!(callback, %detail, "callback panicked");
            Err(ConduitError::CallbackFailed { callback, detail })
        }
    }
}

/// 调用一个无返回值的通知回调，panic 只记录日志。
pub(crate) fn notify(callback: &'static str, f: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(f)) {
        warn!(callback, detail = %panic_detail(payload.as_ref()), "callback panicked");
    }
}

/// 投递新数据；`final_round` 为关停序列中的最后一次投递。
pub(crate) fn deliver(core: &Arc<EngineCore>, conn: &Connection, final_round: bool) {
    loop {
        let state = conn.state.load();
        if state & INPUT_PAUSED != 0 || (!final_round && state & CLOSED != 0) {
            return;
        }
        if !conn.begin_delivery() {
            return;
        }
        let ctx = ConnectionContext::new(core, conn.handle);
        let result = invoke("on_data_received", || conn.handler.on_data_received(&ctx));
        conn.end_delivery();
        if let Err(err) = result {
            if final_round {
                debug!(handle = %conn.handle, error = %err, "final data delivery failed");
            } else {
                lifecycle::close(core, conn, Err(err));
            }
            return;
        }
    }
}
