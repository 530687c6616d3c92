use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    sync::Arc,
};

use rustls::{
    ClientConfig, ClientConnection, RootCertStore, ServerConfig, ServerConnection,
    crypto::{CryptoProvider, ring},
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tracing::{debug, trace};

use crate::{
    error::TlsError,
    options::{TlsOptions, TlsRole},
    verify::{DeferredServerVerifier, VerifyPolicy},
};

const PLAINTEXT_CHUNK: usize = 4096;
const FALLBACK_HOSTNAME: &str = "localhost";

/// 一轮 [`TlsSession::advance`] 的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// 消耗了密文、产生了明文或产生了待发送密文。
    pub progressed: bool,
    /// 本轮完成了握手（且证书策略检查已通过）。
    pub handshake_completed: bool,
    /// 本轮首次观察到对端的 `close_notify`。
    pub peer_closed: bool,
}

/// [`TlsSession::encrypt`] 的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encrypted {
    /// 接受了前 `n` 字节明文，对应密文已进入出站队列。
    Accepted(usize),
    /// 会话暂时无法接受明文，稍后重试。
    TryLater,
}

enum Connection {
    Client(ClientConnection),
    Server(ServerConnection),
}

macro_rules! dispatch {
    ($conn:expr, $inner:ident => $body:expr) => {
        match $conn {
            Connection::Client($inner) => $body,
            Connection::Server($inner) => $body,
        }
    };
}

/// 面向两条字节队列的 TLS 会话。
///
/// # 教案级注释
///
/// ## 意图（Why）
/// - 引擎以完成事件驱动：密文由读完成送达、由写提交送出；会话因此不能直接持有套接字，
///   只在 `inbound`（待解密密文）与 `outbound`（待发送密文）两条队列之间工作。
///
/// ## 逻辑（How）
/// - [`absorb`](Self::absorb) 把读完成携带的密文追加到 `inbound`；
/// - [`advance`](Self::advance) 执行 `read_tls → process_new_packets → reader().read → write_tls`，
///   明文交给调用方提供的 sink，握手与告警产生的密文写入 `outbound`；
/// - 握手完成的那一轮执行证书策略检查，失败以 [`TlsError::Trust`] 返回，并排队一个 `close_notify`；
/// - [`take_ciphertext`](Self::take_ciphertext) / [`requeue_ciphertext`](Self::requeue_ciphertext)
///   让写管线按块取出密文，并在链路暂不可写时原样归还到队首。
///
/// ## 契约（What）
/// - 非线程安全，调用方以锁串行化；
/// - 任何返回错误的调用之后，`outbound` 中可能仍有告警密文，调用方应尽量发送后再关闭。
pub struct TlsSession {
    role: TlsRole,
    conn: Connection,
    inbound: VecDeque<u8>,
    outbound: VecDeque<u8>,
    policy: Option<VerifyPolicy>,
    handshake_done: bool,
    peer_closed: bool,
    close_sent: bool,
}

impl TlsSession {
    /// 以给定角色与选项创建会话。
    pub fn new(role: TlsRole, options: &TlsOptions) -> Result<Self, TlsError> {
        if options.dh_params.is_some() {
            debug!("DH parameters supplied; only ECDHE key exchange is negotiated, ignoring");
        }
        let provider = Arc::new(ring::default_provider());
        let (conn, policy) = match role {
            TlsRole::Client => build_client(&provider, options)?,
            TlsRole::Server => (build_server(&provider, options)?, None),
        };
        Ok(Self {
            role,
            conn,
            inbound: VecDeque::new(),
            outbound: VecDeque::new(),
            policy,
            handshake_done: false,
            peer_closed: false,
            close_sent: false,
        })
    }

    pub fn role(&self) -> TlsRole {
        self.role
    }

    pub fn is_handshake_done(&self) -> bool {
        self.handshake_done
    }

    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// 协商出的 ALPN 协议。
    pub fn alpn_protocol(&self) -> Option<&[u8]> {
        dispatch!(&self.conn, c => c.alpn_protocol())
    }

    /// 追加一段来自链路的密文。
    pub fn absorb(&mut self, ciphertext: &[u8]) {
        self.inbound.extend(ciphertext);
    }

    /// 尚未被记录层消费的入站密文字节数。
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }

    /// 推进一轮记录处理，明文逐块交给 `sink`。
    pub fn advance(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<Progress, TlsError> {
        let mut progress = Progress::default();

        while !self.inbound.is_empty() {
            let consumed = match dispatch!(&mut self.conn, c => c.read_tls(&mut self.inbound)) {
                Ok(consumed) => consumed,
                // 明文缓冲已满：先排空明文，下一轮再继续消费密文。
                Err(err) if err.kind() == io::ErrorKind::Other => 0,
                Err(err) => return Err(err.into()),
            };
            if consumed == 0 {
                break;
            }
            progress.progressed = true;
            let processed = dispatch!(&mut self.conn, c => c.process_new_packets());
            if let Err(err) = processed {
                self.flush_records()?;
                return Err(err.into());
            }
            self.drain_plaintext(sink, &mut progress)?;
        }
        self.drain_plaintext(sink, &mut progress)?;

        if self.flush_records()? {
            progress.progressed = true;
        }

        let handshaking = dispatch!(&self.conn, c => c.is_handshaking());
        if !self.handshake_done && !handshaking {
            self.handshake_done = true;
            progress.handshake_completed = true;
            progress.progressed = true;
            self.enforce_policy()?;
            debug!(
                role = ?self.role,
                alpn = ?self.alpn_protocol().map(String::from_utf8_lossy),
                "TLS handshake completed"
            );
        }
        Ok(progress)
    }

    /// 提交一段明文；返回被接受的字节数。
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Encrypted, TlsError> {
        if plaintext.is_empty() {
            return Ok(Encrypted::Accepted(0));
        }
        let written = match dispatch!(&mut self.conn, c => c.writer().write(plaintext)) {
            Ok(written) => written,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => 0,
            Err(err) => return Err(err.into()),
        };
        self.flush_records()?;
        if written == 0 {
            return Ok(Encrypted::TryLater);
        }
        trace!(plaintext = written, ciphertext = self.outbound.len(), "plaintext sealed");
        Ok(Encrypted::Accepted(written))
    }

    /// 排队一个 `close_notify` 告警；重复调用无效果。
    pub fn close_notify(&mut self) -> Result<(), TlsError> {
        if self.close_sent {
            return Ok(());
        }
        self.close_sent = true;
        dispatch!(&mut self.conn, c => c.send_close_notify());
        self.flush_records()?;
        Ok(())
    }

    pub fn close_notify_sent(&self) -> bool {
        self.close_sent
    }

    /// 出站队列中待发送的密文字节数。
    pub fn pending_ciphertext(&self) -> usize {
        self.outbound.len()
    }

    /// 取出至多 `max` 字节待发送密文；队列为空时返回 `None`。
    pub fn take_ciphertext(&mut self, max: usize) -> Option<Vec<u8>> {
        if self.outbound.is_empty() || max == 0 {
            return None;
        }
        let count = self.outbound.len().min(max);
        Some(self.outbound.drain(..count).collect())
    }

    /// 把未能提交的密文块放回队首，保持发送顺序。
    pub fn requeue_ciphertext(&mut self, chunk: &[u8]) {
        for byte in chunk.iter().rev() {
            self.outbound.push_front(*byte);
        }
    }

    fn drain_plaintext(
        &mut self,
        sink: &mut dyn FnMut(&[u8]),
        progress: &mut Progress,
    ) -> Result<(), TlsError> {
        let mut chunk = [0u8; PLAINTEXT_CHUNK];
        loop {
            match dispatch!(&mut self.conn, c => c.reader().read(&mut chunk)) {
                Ok(0) => {
                    if !self.peer_closed {
                        self.peer_closed = true;
                        progress.peer_closed = true;
                        progress.progressed = true;
                        debug!(role = ?self.role, "peer sent close_notify");
                    }
                    return Ok(());
                }
                Ok(read) => {
                    sink(&chunk[..read]);
                    progress.progressed = true;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// 把记录层待写的密文移入出站队列，返回是否写出了内容。
    fn flush_records(&mut self) -> Result<bool, TlsError> {
        let mut wrote = false;
        while dispatch!(&self.conn, c => c.wants_write()) {
            let written = dispatch!(&mut self.conn, c => c.write_tls(&mut self.outbound))?;
            if written == 0 {
                break;
            }
            wrote = true;
        }
        Ok(wrote)
    }

    fn enforce_policy(&mut self) -> Result<(), TlsError> {
        let Some(policy) = &self.policy else {
            return Ok(());
        };
        let chain = dispatch!(&self.conn, c => c.peer_certificates()).unwrap_or(&[]);
        if let Err(failure) = policy.check(chain) {
            debug!(?failure, "peer certificate rejected after handshake");
            self.close_notify()?;
            return Err(TlsError::Trust(failure));
        }
        Ok(())
    }
}

fn build_client(
    provider: &Arc<CryptoProvider>,
    options: &TlsOptions,
) -> Result<(Connection, Option<VerifyPolicy>), TlsError> {
    let hostname = match (&options.hostname, options.verify_certificates) {
        (Some(name), _) => name.clone(),
        (None, false) => FALLBACK_HOSTNAME.to_owned(),
        (None, true) => {
            return Err(TlsError::config(
                "certificate verification requires a hostname",
            ));
        }
    };
    let server_name = ServerName::try_from(hostname.clone())
        .map_err(|_| TlsError::InvalidServerName { name: hostname })?;

    let builder = ClientConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| TlsError::config(err.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(DeferredServerVerifier::new(provider)));
    let mut config = match (&options.private_key, options.local_cert_chain.is_empty()) {
        (Some(key), false) => builder
            .with_client_auth_cert(certificates(&options.local_cert_chain), private_key(key)?)
            .map_err(|err| TlsError::config(err.to_string()))?,
        _ => builder.with_no_client_auth(),
    };
    config.alpn_protocols = options.alpn.clone();

    let policy = if options.verify_certificates {
        let mut roots = RootCertStore::empty();
        for der in &options.trusted_certs {
            roots
                .add(CertificateDer::from(der.clone()))
                .map_err(|err| TlsError::config(format!("unusable trusted certificate: {err}")))?;
        }
        Some(VerifyPolicy::new(
            Arc::clone(provider),
            roots,
            server_name.clone(),
            options.accept_self_signed,
        ))
    } else {
        None
    };

    let conn = ClientConnection::new(Arc::new(config), server_name)?;
    Ok((Connection::Client(conn), policy))
}

fn build_server(
    provider: &Arc<CryptoProvider>,
    options: &TlsOptions,
) -> Result<Connection, TlsError> {
    let Some(key) = &options.private_key else {
        return Err(TlsError::config("server session requires a private key"));
    };
    if options.local_cert_chain.is_empty() {
        return Err(TlsError::config("server session requires a certificate chain"));
    }
    let mut config = ServerConfig::builder_with_provider(Arc::clone(provider))
        .with_safe_default_protocol_versions()
        .map_err(|err| TlsError::config(err.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certificates(&options.local_cert_chain), private_key(key)?)
        .map_err(|err| TlsError::config(err.to_string()))?;
    config.alpn_protocols = options.alpn.clone();
    let conn = ServerConnection::new(Arc::new(config))?;
    Ok(Connection::Server(conn))
}

fn certificates(chain: &[Vec<u8>]) -> Vec<CertificateDer<'static>> {
    chain.iter().cloned().map(CertificateDer::from).collect()
}

fn private_key(der: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::try_from(der.to_vec()).map_err(|err| TlsError::config(err.to_string()))
}
