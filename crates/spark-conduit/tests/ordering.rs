//! 读交付与写提交的顺序性：乱序完成不得改变字节顺序，出站在途字节不得越过上限。

mod support;

use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};

use anyhow::{Context, Result, ensure};
use proptest::prelude::*;
use spark_conduit::{AttachOptions, EngineConfig};
use support::{Harness, Recorder, ScriptedLink, expect_within};

fn read_permutation_case(chunks: Vec<Vec<u8>>, order: Vec<usize>) -> Result<()> {
    let depth = chunks.len();
    let harness = Harness::new(
        EngineConfig::builder()
            .read_ahead(depth)
            .zero_byte_probe(false)
            .build()?,
    )?;
    let link = ScriptedLink::new();
    let recorder = Recorder::new();
    harness
        .engine
        .attach(link.clone(), AttachOptions::client(recorder.clone()))?;
    expect_within("read-ahead window", || link.pending_reads() == depth)?;

    for &index in &order {
        ensure!(
            link.complete_read(index as u64, &chunks[index]),
            "read #{index} should be pending"
        );
    }

    let expected: Vec<u8> = chunks.concat();
    expect_within("in-order delivery", || recorder.received_len() == expected.len())?;
    ensure!(recorder.received() == expected, "bytes delivered out of order");
    ensure!(
        !recorder.overlapped.load(Ordering::SeqCst),
        "data callbacks overlapped"
    );
    Ok(())
}

fn chunks_and_order() -> impl Strategy<Value = (Vec<Vec<u8>>, Vec<usize>)> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 1..64), 1..=8).prop_flat_map(
        |chunks| {
            let order: Vec<usize> = (0..chunks.len()).collect();
            (Just(chunks), Just(order).prop_shuffle())
        },
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn reads_are_delivered_in_submission_order((chunks, order) in chunks_and_order()) {
        read_permutation_case(chunks, order)
            .map_err(|err| TestCaseError::fail(format!("{err:#}")))?;
    }
}

fn write_order_case(sizes: Vec<usize>) -> Result<()> {
    let ceiling = 8 * 1024;
    let harness = Harness::new(
        EngineConfig::builder()
            .outgoing_byte_ceiling(ceiling)
            .zero_byte_probe(false)
            .build()?,
    )?;
    let link = ScriptedLink::new();
    let handle = harness
        .engine
        .attach(link.clone(), AttachOptions::client(Recorder::new()))?;

    let mut expected = Vec::new();
    for (index, size) in sizes.iter().copied().enumerate() {
        let payload: Vec<u8> = (0..size).map(|offset| (index * 31 + offset) as u8).collect();
        expected.extend_from_slice(&payload);
        if index % 3 == 2 {
            harness.engine.send_stream(handle, Cursor::new(payload))?;
        } else {
            harness.engine.send(handle, payload)?;
        }
    }

    expect_within("all bytes submitted", || {
        link.complete_writes_reversed();
        link.submitted().len() == expected.len() && link.pending_writes() == 0
    })?;
    ensure!(link.submitted() == expected, "bytes left the connection out of order");
    ensure!(
        link.peak_in_flight() <= ceiling,
        "in-flight bytes {} exceeded the ceiling",
        link.peak_in_flight()
    );
    expect_within("write completions routed", || {
        harness
            .engine
            .connection_stats(handle)
            .is_ok_and(|stats| stats.bytes_sent == expected.len() as u64)
    })?;
    let stats = harness.engine.connection_stats(handle)?;
    ensure!(stats.peak_outgoing_bytes <= ceiling, "engine peak exceeded the ceiling");
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn writes_leave_in_call_order(sizes in prop::collection::vec(1usize..20_000, 1..8)) {
        write_order_case(sizes).map_err(|err| TestCaseError::fail(format!("{err:#}")))?;
    }
}

#[test]
fn after_write_signal_waits_for_prior_writes() -> Result<()> {
    let harness = Harness::without_probes()?;
    let link = ScriptedLink::new();
    let handle = harness
        .engine
        .attach(link.clone(), AttachOptions::client(Recorder::new()))?;

    let seen_at_signal = Arc::new(AtomicUsize::new(usize::MAX));
    harness.engine.send(handle, &b"first"[..])?;
    {
        let link = link.clone();
        let seen = seen_at_signal.clone();
        harness.engine.after_write_signal(handle, move || {
            seen.store(link.submitted().len(), Ordering::SeqCst);
        })?;
    }
    harness.engine.send(handle, &b"second"[..])?;

    expect_within("first write submitted", || link.pending_writes() == 1)?;
    std::thread::sleep(std::time::Duration::from_millis(20));
    ensure!(
        seen_at_signal.load(Ordering::SeqCst) == usize::MAX,
        "signal fired while a write was still in flight"
    );
    ensure!(link.submitted() == b"first", "later write overtook the signal");

    link.complete_write(0);
    expect_within("signal fired", || {
        seen_at_signal.load(Ordering::SeqCst) != usize::MAX
    })?;
    ensure!(seen_at_signal.load(Ordering::SeqCst) == b"first".len());
    expect_within("second write submitted", || link.pending_writes() == 1)?;
    ensure!(link.submitted() == b"firstsecond");
    link.complete_write(0);
    Ok(())
}

#[test]
fn empty_send_is_rejected_without_state_change() -> Result<()> {
    let harness = Harness::without_probes()?;
    let link = ScriptedLink::new();
    let handle = harness
        .engine
        .attach(link.clone(), AttachOptions::client(Recorder::new()))?;
    let err = harness
        .engine
        .send(handle, Vec::new())
        .err()
        .context("empty send should fail")?;
    ensure!(matches!(err, spark_conduit::ConduitError::InvalidArgument { .. }));
    ensure!(!harness.engine.is_closed(handle));
    Ok(())
}
