//! 两个会话在内存中互相泵送密文，覆盖握手、双向明文、信任策略与 `close_notify`。

use anyhow::{Context, Result};
use rcgen::{BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use spark_transport_tls::{TlsError, TlsOptions, TlsRole, TlsSession, TrustFailure};

struct Identity {
    cert: Vec<u8>,
    key: Vec<u8>,
}

fn self_signed(names: &[&str]) -> Result<Identity> {
    let key = KeyPair::generate().context("生成密钥失败")?;
    let params = CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
        .context("构造证书参数失败")?;
    let cert = params.self_signed(&key).context("自签名失败")?;
    Ok(Identity {
        cert: cert.der().to_vec(),
        key: key.serialize_der(),
    })
}

fn common_name(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn
}

/// 返回 (CA 证书, 由该 CA 签发的 localhost 叶证书)。
fn ca_signed() -> Result<(Vec<u8>, Identity)> {
    let ca_key = KeyPair::generate().context("生成 CA 密钥失败")?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).context("构造 CA 参数失败")?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.distinguished_name = common_name("Spark Test CA");
    let ca = ca_params.self_signed(&ca_key).context("CA 自签名失败")?;

    let leaf_key = KeyPair::generate().context("生成叶证书密钥失败")?;
    let mut leaf_params =
        CertificateParams::new(vec!["localhost".to_string()]).context("构造叶证书参数失败")?;
    // 签发者与主体名称必须不同，否则叶证书会被当作自签名候选。
    leaf_params.distinguished_name = common_name("spark leaf");
    let leaf = leaf_params
        .signed_by(&leaf_key, &ca, &ca_key)
        .context("签发叶证书失败")?;
    Ok((
        ca.der().to_vec(),
        Identity {
            cert: leaf.der().to_vec(),
            key: leaf_key.serialize_der(),
        },
    ))
}

#[derive(Default)]
struct Received {
    client: Vec<u8>,
    server: Vec<u8>,
    client_saw_close: bool,
    server_saw_close: bool,
}

/// 双向泵送直到不再有进展；任何一端出错立即返回该错误。
fn pump(
    client: &mut TlsSession,
    server: &mut TlsSession,
    received: &mut Received,
) -> Result<(), TlsError> {
    for _ in 0..64 {
        let mut moved = false;
        let progress = client.advance(&mut |bytes| received.client.extend_from_slice(bytes))?;
        received.client_saw_close |= progress.peer_closed;
        if let Some(chunk) = client.take_ciphertext(usize::MAX) {
            server.absorb(&chunk);
            moved = true;
        }
        let progress = server.advance(&mut |bytes| received.server.extend_from_slice(bytes))?;
        received.server_saw_close |= progress.peer_closed;
        if let Some(chunk) = server.take_ciphertext(usize::MAX) {
            client.absorb(&chunk);
            moved = true;
        }
        if !moved && client.pending_inbound() == 0 && server.pending_inbound() == 0 {
            return Ok(());
        }
    }
    Ok(())
}

fn server_for(identity: &Identity) -> Result<TlsSession> {
    TlsSession::new(
        TlsRole::Server,
        &TlsOptions::server(vec![identity.cert.clone()], identity.key.clone()),
    )
    .context("创建服务端会话失败")
}

#[test]
fn self_signed_peer_is_rejected_by_default() -> Result<()> {
    let identity = self_signed(&["localhost"])?;
    let mut server = server_for(&identity)?;
    let mut client = TlsSession::new(TlsRole::Client, &TlsOptions::client("localhost"))?;
    let err = pump(&mut client, &mut server, &mut Received::default())
        .expect_err("默认策略应拒绝自签名证书");
    assert_eq!(err.trust_failure(), Some(TrustFailure::SelfSigned));
    assert!(client.close_notify_sent());
    Ok(())
}

#[test]
fn self_signed_peer_is_accepted_when_allowed() -> Result<()> {
    let identity = self_signed(&["localhost"])?;
    let mut server = server_for(&identity)?;
    let mut client = TlsSession::new(
        TlsRole::Client,
        &TlsOptions::client("localhost").accept_self_signed(true),
    )?;
    let mut received = Received::default();
    pump(&mut client, &mut server, &mut received)?;
    assert!(client.is_handshake_done());
    assert!(server.is_handshake_done());

    client.encrypt(b"ping")?;
    server.encrypt(b"pong")?;
    pump(&mut client, &mut server, &mut received)?;
    assert_eq!(received.server, b"ping");
    assert_eq!(received.client, b"pong");
    Ok(())
}

#[test]
fn certificate_from_trusted_root_passes() -> Result<()> {
    let (ca, identity) = ca_signed()?;
    let mut server = server_for(&identity)?;
    let mut client = TlsSession::new(
        TlsRole::Client,
        &TlsOptions::client("localhost").with_trusted_cert(ca),
    )?;
    pump(&mut client, &mut server, &mut Received::default())?;
    assert!(client.is_handshake_done());
    Ok(())
}

#[test]
fn certificate_from_unknown_root_is_untrusted() -> Result<()> {
    let (_, identity) = ca_signed()?;
    let mut server = server_for(&identity)?;
    let mut client = TlsSession::new(
        TlsRole::Client,
        &TlsOptions::client("localhost").accept_self_signed(true),
    )?;
    let err = pump(&mut client, &mut server, &mut Received::default())
        .expect_err("未知 CA 签发的证书应被拒绝");
    assert_eq!(err.trust_failure(), Some(TrustFailure::UntrustedIssuer));
    Ok(())
}

#[test]
fn name_mismatch_is_chain_failure() -> Result<()> {
    let (ca, identity) = ca_signed()?;
    let mut server = server_for(&identity)?;
    let mut client = TlsSession::new(
        TlsRole::Client,
        &TlsOptions::client("example.invalid").with_trusted_cert(ca),
    )?;
    let err = pump(&mut client, &mut server, &mut Received::default())
        .expect_err("主机名不匹配应被拒绝");
    assert_eq!(err.trust_failure(), Some(TrustFailure::Chain));
    Ok(())
}

#[test]
fn disabled_verification_accepts_anything() -> Result<()> {
    let identity = self_signed(&["unrelated.test"])?;
    let mut server = server_for(&identity)?;
    let mut client =
        TlsSession::new(TlsRole::Client, &TlsOptions::default().with_verification(false))?;
    pump(&mut client, &mut server, &mut Received::default())?;
    assert!(client.is_handshake_done());
    Ok(())
}

#[test]
fn close_notify_reaches_peer() -> Result<()> {
    let identity = self_signed(&["localhost"])?;
    let mut server = server_for(&identity)?;
    let mut client = TlsSession::new(
        TlsRole::Client,
        &TlsOptions::client("localhost").accept_self_signed(true),
    )?;
    let mut received = Received::default();
    pump(&mut client, &mut server, &mut received)?;
    client.encrypt(b"last words")?;
    client.close_notify()?;
    pump(&mut client, &mut server, &mut received)?;
    assert_eq!(received.server, b"last words");
    assert!(received.server_saw_close);
    assert!(server.peer_closed());
    Ok(())
}

#[test]
fn alpn_is_negotiated() -> Result<()> {
    let identity = self_signed(&["localhost"])?;
    let mut server = TlsSession::new(
        TlsRole::Server,
        &TlsOptions::server(vec![identity.cert.clone()], identity.key.clone()).with_alpn("spark/1"),
    )?;
    let mut client = TlsSession::new(
        TlsRole::Client,
        &TlsOptions::client("localhost")
            .accept_self_signed(true)
            .with_alpn("spark/1"),
    )?;
    pump(&mut client, &mut server, &mut Received::default())?;
    assert_eq!(client.alpn_protocol(), Some(&b"spark/1"[..]));
    Ok(())
}
