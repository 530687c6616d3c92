//! 引擎内的 TLS：自签名证书策略、握手后双向明文、就地升级与优雅 `close_notify`。

mod support;

use std::{io, sync::Arc};

use anyhow::{Context, Result, ensure};
use rcgen::{CertificateParams, KeyPair};
use spark_conduit::{
    AttachOptions, ConduitError, ConnectionHandle, EngineConfig, MemoryLink, TlsOptions,
    TrustFailure,
};
use support::{Harness, Recorder, ScriptedLink, expect_within};

struct Identity {
    cert: Vec<u8>,
    key: Vec<u8>,
}

fn self_signed() -> Result<Identity> {
    let key = KeyPair::generate().context("生成密钥失败")?;
    let cert = CertificateParams::new(vec!["localhost".to_string()])
        .context("构造证书参数失败")?
        .self_signed(&key)
        .context("自签名失败")?;
    Ok(Identity {
        cert: cert.der().to_vec(),
        key: key.serialize_der(),
    })
}

struct Pair {
    client: ConnectionHandle,
    server: ConnectionHandle,
    client_events: Arc<Recorder>,
    server_events: Arc<Recorder>,
}

fn connect(harness: &Harness, client_tls: TlsOptions, server_tls: TlsOptions) -> Result<Pair> {
    let (client_link, server_link) = MemoryLink::pair();
    let client_events = Recorder::new();
    let server_events = Recorder::new();
    let server = harness.engine.attach(
        Arc::new(server_link),
        AttachOptions::server(server_events.clone()).with_tls(server_tls),
    )?;
    let client = harness.engine.attach(
        Arc::new(client_link),
        AttachOptions::client(client_events.clone()).with_tls(client_tls),
    )?;
    Ok(Pair {
        client,
        server,
        client_events,
        server_events,
    })
}

#[test]
fn self_signed_certificate_is_rejected_by_default() -> Result<()> {
    let harness = Harness::new(EngineConfig::default())?;
    let identity = self_signed()?;
    let pair = connect(
        &harness,
        TlsOptions::client("localhost"),
        TlsOptions::server(vec![identity.cert], identity.key),
    )?;

    expect_within("client disconnect", || pair.client_events.disconnects().len() == 1)?;
    let error = pair.client_events.disconnects()[0]
        .clone()
        .context("handshake failure must be recorded")?;
    ensure!(
        error.trust_failure() == Some(TrustFailure::SelfSigned),
        "unexpected failure: {error}"
    );
    ensure!(pair.client_events.received().is_empty());
    expect_within("both destroyed", || harness.engine.connection_count() == 0)?;
    ensure!(pair.server_events.received().is_empty());
    Ok(())
}

#[test]
fn self_signed_certificate_round_trips_when_accepted() -> Result<()> {
    let harness = Harness::new(EngineConfig::default())?;
    let identity = self_signed()?;
    let pair = connect(
        &harness,
        TlsOptions::client("localhost").accept_self_signed(true),
        TlsOptions::server(vec![identity.cert], identity.key),
    )?;

    // 握手完成前排队的写在握手完成后按序发出。
    harness.engine.send(pair.client, &b"ping "[..])?;
    harness.engine.send(pair.client, &b"over tls"[..])?;
    expect_within("server plaintext", || {
        pair.server_events.received_len() == b"ping over tls".len()
    })?;
    ensure!(pair.server_events.received() == b"ping over tls");
    ensure!(harness.engine.is_handshake_done(pair.client));
    ensure!(harness.engine.is_handshake_done(pair.server));

    harness.engine.send(pair.server, &b"pong"[..])?;
    expect_within("client plaintext", || pair.client_events.received_len() == 4)?;
    ensure!(pair.client_events.received() == b"pong");

    harness.engine.close(pair.client, None)?;
    expect_within("server sees close_notify", || {
        pair.server_events.disconnects().len() == 1
    })?;
    ensure!(pair.server_events.disconnects() == vec![None]);
    expect_within("client disconnect", || pair.client_events.disconnects().len() == 1)?;
    ensure!(pair.client_events.disconnects() == vec![None]);
    Ok(())
}

#[test]
fn tls_round_trips_when_completions_route_inline() -> Result<()> {
    let harness = Harness::new(EngineConfig::default())?;
    // 调度池停止后，链路完成在提交方线程上就地路由，嵌套完成延后到外层路由结束处理。
    harness.pool.shutdown();
    let identity = self_signed()?;
    let pair = connect(
        &harness,
        TlsOptions::client("localhost").accept_self_signed(true),
        TlsOptions::server(vec![identity.cert], identity.key),
    )?;

    harness.engine.send(pair.client, &b"inline"[..])?;
    expect_within("server plaintext", || pair.server_events.received_len() == 6)?;
    ensure!(pair.server_events.received() == b"inline");
    harness.engine.send(pair.server, &b"reply"[..])?;
    expect_within("client plaintext", || pair.client_events.received_len() == 5)?;
    ensure!(pair.client_events.received() == b"reply");

    harness.engine.close(pair.client, None)?;
    expect_within("both destroyed", || harness.engine.connection_count() == 0)?;
    ensure!(pair.server_events.disconnects() == vec![None]);
    Ok(())
}

#[test]
fn abortive_close_during_handshake_discards_queued_plaintext() -> Result<()> {
    let harness = Harness::without_probes()?;
    let link = ScriptedLink::deferred_teardown();
    let recorder = Recorder::new();
    let handle = harness.engine.attach(
        link.clone(),
        AttachOptions::client(recorder.clone()).with_tls(TlsOptions::client("localhost")),
    )?;
    // ClientHello 挂起不完成，握手停在半途。
    expect_within("client hello submitted", || link.pending_writes() == 1)?;
    harness.engine.send(handle, &b"never sent"[..])?;

    let failure = ConduitError::Io {
        kind: io::ErrorKind::Other,
        message: "abandoned".to_owned(),
    };
    harness.engine.close(handle, Some(failure.clone()))?;
    let late = harness.engine.send(handle, &b"late"[..]).err();
    ensure!(late == Some(ConduitError::Cancelled), "send after close returned {late:?}");
    expect_within("abortive teardown", || link.teardown_mode().is_some())?;

    link.cancel_all();
    expect_within("destroyed", || recorder.is_destroyed())?;
    ensure!(harness.engine.connection_count() == 0);
    ensure!(recorder.disconnects() == vec![Some(failure)]);
    ensure!(recorder.received().is_empty());
    Ok(())
}

#[test]
fn tls_can_be_enabled_on_an_established_connection() -> Result<()> {
    let harness = Harness::new(EngineConfig::default())?;
    let identity = self_signed()?;
    let (client_link, server_link) = MemoryLink::pair();
    let client_events = Recorder::new();
    let server_events = Recorder::new();
    let server = harness
        .engine
        .attach(Arc::new(server_link), AttachOptions::server(server_events.clone()))?;
    let client = harness
        .engine
        .attach(Arc::new(client_link), AttachOptions::client(client_events.clone()))?;
    expect_within("both connected", || {
        harness.engine.is_connected(client) && harness.engine.is_connected(server)
    })?;

    harness
        .engine
        .enable_tls(server, &TlsOptions::server(vec![identity.cert], identity.key))?;
    harness.engine.enable_tls(
        client,
        &TlsOptions::client("localhost").accept_self_signed(true),
    )?;
    let again = harness
        .engine
        .enable_tls(client, &TlsOptions::client("localhost"))
        .err()
        .context("enabling TLS twice should fail")?;
    ensure!(matches!(again, ConduitError::InvalidArgument { .. }));

    expect_within("handshake", || {
        harness.engine.is_handshake_done(client) && harness.engine.is_handshake_done(server)
    })?;
    harness.engine.send(client, &b"upgraded"[..])?;
    expect_within("server plaintext", || server_events.received_len() == 8)?;
    ensure!(server_events.received() == b"upgraded");
    Ok(())
}

#[test]
fn verifying_client_requires_a_hostname() -> Result<()> {
    let harness = Harness::new(EngineConfig::default())?;
    let (client_link, _server_link) = MemoryLink::pair();
    let mut options = TlsOptions::client("localhost");
    options.hostname = None;
    let err = harness
        .engine
        .attach(
            Arc::new(client_link),
            AttachOptions::client(Recorder::new()).with_tls(options),
        )
        .err()
        .context("verification without a hostname should fail")?;
    ensure!(matches!(err, ConduitError::InvalidArgument { .. }));
    ensure!(harness.engine.connection_count() == 0);
    Ok(())
}
