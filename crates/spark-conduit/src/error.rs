//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为引擎对外暴露的错误语义提供集中定义：取消、参数错误、短写、对端断开、TLS 信任失败、I/O 透传；
//! - 连接只记录首个关闭错误，后续错误仅进入日志，因此错误必须可 `Clone` 以便分发给多个观察者。
//!
//! ## 设计要求（What）
//! - 良性断开（复位、中止、管道破裂、意外 EOF）统一映射为 [`ConduitError::PeerDisconnected`]，
//!   并在进入关闭流程前降级为成功；
//! - 引擎级致命条件（调度池未就绪、调度池可增长）只会从 `Engine::initialize` 返回。

use std::io;

use spark_transport::DispatchError;
use spark_transport_tls::TlsError;
use thiserror::Error;

/// 引擎错误域。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConduitError {
    /// 引擎或连接正在关停，操作被取消。
    #[error("operation cancelled: shutdown in progress")]
    Cancelled,

    /// 句柄无效或参数不合法。
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    #[error("out of memory")]
    OutOfMemory,

    /// 链路报告的完成字节数小于请求长度。
    #[error("short write: requested {requested} bytes, transport wrote {written}")]
    WriteFault { requested: usize, written: usize },

    /// 流式发送的数据源已耗尽；仅在引擎内部流转，不会作为连接错误出现。
    #[error("end of stream")]
    EndOfStream,

    /// 对端已断开；记录关闭状态时降级为成功。
    #[error("peer disconnected")]
    PeerDisconnected,

    #[error(transparent)]
    Tls(#[from] TlsError),

    #[error("I/O failure ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// 用户回调返回错误或发生 panic。
    #[error("{callback} callback failed: {detail}")]
    CallbackFailed {
        callback: &'static str,
        detail: String,
    },

    #[error("dispatch pool is not running")]
    PoolNotReady,

    #[error("dispatch pool must have a fixed number of workers")]
    PoolGrowable,

    #[error("engine is not initialized")]
    NotInitialized,

    #[error("engine is already initialized")]
    AlreadyInitialized,

    #[error("engine is shutting down")]
    ShuttingDown,

    #[error("invalid configuration `{field}`: {detail}")]
    InvalidConfig { field: &'static str, detail: String },
}

impl ConduitError {
    pub(crate) fn invalid(detail: impl Into<String>) -> Self {
        ConduitError::InvalidArgument {
            detail: detail.into(),
        }
    }

    pub(crate) fn unknown_handle(handle: impl std::fmt::Display) -> Self {
        ConduitError::invalid(format!("unknown or destroyed connection {handle}"))
    }

    /// 是否属于对端正常断开的良性错误。
    pub fn is_benign_disconnect(&self) -> bool {
        matches!(self, ConduitError::PeerDisconnected)
    }

    /// 若为 TLS 信任失败，返回其类别。
    pub fn trust_failure(&self) -> Option<spark_transport_tls::TrustFailure> {
        match self {
            ConduitError::Tls(err) => err.trust_failure(),
            _ => None,
        }
    }
}

/// 良性断开降级为成功，其余错误原样保留。
pub(crate) fn downgrade_benign(status: Result<(), ConduitError>) -> Result<(), ConduitError> {
    match status {
        Err(err) if err.is_benign_disconnect() => Ok(()),
        other => other,
    }
}

impl From<io::Error> for ConduitError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ConduitError::PeerDisconnected,
            io::ErrorKind::OutOfMemory => ConduitError::OutOfMemory,
            kind => ConduitError::Io {
                kind,
                message: error.to_string(),
            },
        }
    }
}

impl From<DispatchError> for ConduitError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::NotRunning => ConduitError::ShuttingDown,
            DispatchError::Spawn(message) => ConduitError::Io {
                kind: io::ErrorKind::Other,
                message,
            },
        }
    }
}
