use std::io;

use thiserror::Error;

/// 证书校验失败的类别，每一类对应一个独立错误。
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum TrustFailure {
    #[error("peer certificate has expired or is not yet valid")]
    Expired,
    #[error("peer certificate has been revoked")]
    Revoked,
    #[error("peer certificate is self-signed")]
    SelfSigned,
    #[error("peer certificate was issued by an untrusted authority")]
    UntrustedIssuer,
    #[error("peer certificate chain is invalid")]
    Chain,
}

/// TLS 桥接层错误。
///
/// # 契约（What）
/// - 全部变体可 `Clone`，便于引擎把首个关闭错误分发给多个观察者；
/// - `Protocol` 保存 rustls 错误的文本描述，而非错误对象本身，rustls 错误并不保证 `Clone`。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TlsError {
    #[error("invalid TLS configuration: {detail}")]
    Config { detail: String },
    #[error("invalid TLS server name `{name}`")]
    InvalidServerName { name: String },
    #[error("TLS protocol failure: {detail}")]
    Protocol { detail: String },
    #[error("TLS trust failure: {0}")]
    Trust(#[from] TrustFailure),
    #[error("TLS record I/O failure ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },
}

impl TlsError {
    pub(crate) fn config(detail: impl Into<String>) -> Self {
        TlsError::Config {
            detail: detail.into(),
        }
    }

    /// 若为信任错误，返回其类别。
    pub fn trust_failure(&self) -> Option<TrustFailure> {
        match self {
            TlsError::Trust(failure) => Some(*failure),
            _ => None,
        }
    }
}

impl From<rustls::Error> for TlsError {
    fn from(error: rustls::Error) -> Self {
        match &error {
            rustls::Error::InvalidCertificate(_) => {
                TlsError::Trust(crate::verify::classify(&error))
            }
            _ => TlsError::Protocol {
                detail: error.to_string(),
            },
        }
    }
}

impl From<io::Error> for TlsError {
    fn from(error: io::Error) -> Self {
        TlsError::Io {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}
