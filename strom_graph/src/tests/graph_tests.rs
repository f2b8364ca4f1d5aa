//! End-to-end scenarios over whole chains: cold start, starvation
//! recovery, replicator fanout, chain link drop, flush and restart.

use crate::chain::ChainUnit;
use crate::link::{LinkInput, LinkOutput};
use crate::mixer::{MixerInput, MixerInputType, MixerOutput, StreamMixer};
use crate::proxy::StreamProxy;
use crate::replicator::{ForwardMode, StreamReplicator};
use crate::tests::utils::{
    EchoSink, TestFrameMixer, TestRenderer, data_packet, drain_matching, wait_for,
    wait_for_completion,
};
use std::sync::Arc;
use std::time::Duration;
use strom_core::{
    CommandKind, ConnectorId, FlushMode, HeapPool, PacketFlags, Speed, StreamCommand, StreamError,
    StreamPacket, StreamState, StreamTime, ThreadOptions, TickDuration, UnitRef, UpstreamMessage,
};

const FRAME: TickDuration = TickDuration::from_millis(40);
const FRAME_BYTES: usize = 16;
const LONG: Duration = Duration::from_secs(10);

struct MixerChain {
    proxy: Arc<StreamProxy>,
    renderer: Arc<TestRenderer>,
    #[allow(dead_code)]
    mixer: Arc<StreamMixer>,
    #[allow(dead_code)]
    inputs: Vec<Arc<MixerInput>>,
}

/// `source -> mixer input(s) -> mixer -> mixer output -> renderer`, rooted
/// under one proxy. The application plays the source.
fn mixer_chain(num_inputs: usize) -> MixerChain {
    let mixer = StreamMixer::new(
        "mixer",
        Box::new(TestFrameMixer::new(FRAME, FRAME_BYTES)),
        ThreadOptions::named("mixer-thread"),
    )
    .expect("mixer thread spawns");

    let chain = ChainUnit::new("chain");
    let mut inputs = Vec::new();
    for i in 0..num_inputs {
        let input = MixerInput::new(
            format!("mixer-in-{i}"),
            &mixer,
            MixerInputType::Audio,
            0,
            2,
            1,
        )
        .expect("mixer input registers");
        let index = chain.add_unit(input.clone() as UnitRef);
        chain.expose_input(index, 0).expect("chain input exposed");
        inputs.push(input);
    }

    let output = MixerOutput::new("mixer-out", &mixer, 16);
    let out_index = chain.add_unit(output as UnitRef);

    let renderer = TestRenderer::new(
        "renderer",
        FRAME,
        Duration::from_millis(5),
        HeapPool::new(32, 4096),
    );
    let renderer_index = chain.add_unit(renderer.clone() as UnitRef);
    chain
        .plug_units(out_index, 0, renderer_index, 0)
        .expect("mixer output plugs into renderer");

    let proxy = StreamProxy::new("proxy", chain as UnitRef).expect("proxy wires up");
    MixerChain {
        proxy,
        renderer,
        mixer,
        inputs,
    }
}

/// Deliver packets one by one, retrying bounces until all are accepted.
fn feed_all(proxy: &StreamProxy, connector: ConnectorId, packets: Vec<StreamPacket>) {
    for packet in packets {
        let deadline = std::time::Instant::now() + LONG;
        loop {
            let accepted = proxy
                .deliver_packets(connector, std::slice::from_ref(&packet))
                .expect("connector exists");
            if accepted == 1 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "chain refused data for too long"
            );
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

fn stream_opening(pool: &Arc<HeapPool>, t0: StreamTime) -> Vec<StreamPacket> {
    let mut packets = Vec::new();
    let mut first = data_packet(pool, FRAME_BYTES).expect("source pool has blocks");
    first.flags |= PacketFlags::SEGMENT_START
        | PacketFlags::SEGMENT_START_NOTIFICATION
        | PacketFlags::GROUP_START
        | PacketFlags::GROUP_START_NOTIFICATION
        | PacketFlags::START_TIME_VALID;
    first.segment_number = 0;
    first.group_number = 0;
    first.start_time = t0;
    packets.push(first);
    for _ in 0..8 {
        packets.push(data_packet(pool, FRAME_BYTES).expect("source pool has blocks"));
    }
    packets
}

#[test]
fn cold_start_forward_renders_at_the_right_time() {
    let chain = mixer_chain(1);
    let events = chain.proxy.events();
    let source_pool = HeapPool::new(64, 64);

    chain
        .proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );
    assert_eq!(chain.proxy.state(), StreamState::Ready);

    let t0 = StreamTime::from_secs(2);
    feed_all(&chain.proxy, 0, stream_opening(&source_pool, t0));
    assert!(
        wait_for(&events, LONG, |m| matches!(m, UpstreamMessage::StartPossible)).is_some(),
        "one frame of data makes the chain startable"
    );

    chain
        .proxy
        .send_command(StreamCommand::Do {
            speed: Speed::UNITY,
        })
        .expect("do accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Do, LONG),
        Some(Ok(()))
    );
    assert_eq!(chain.proxy.state(), StreamState::Streaming);

    // The renderer eventually receives a timed frame whose start time is
    // within one mixer frame of the source's first timestamp.
    let deadline = std::time::Instant::now() + LONG;
    loop {
        let times = chain.renderer.start_times();
        if let Some(first) = times.first() {
            assert!(
                (*first - t0).abs() <= FRAME,
                "first rendered time {first} too far from {t0}"
            );
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no timed frame rendered");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn starvation_is_reported_once_per_gap() {
    let chain = mixer_chain(2);
    let events = chain.proxy.events();
    let source_pool = HeapPool::new(256, 64);

    chain
        .proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );

    // Input 0 gets plenty, input 1 only two frames worth of data.
    let t0 = StreamTime::from_secs(1);
    feed_all(&chain.proxy, 0, stream_opening(&source_pool, t0));
    let mut plenty = Vec::new();
    for _ in 0..40 {
        plenty.push(data_packet(&source_pool, FRAME_BYTES).expect("blocks left"));
    }
    feed_all(&chain.proxy, 0, plenty);
    feed_all(&chain.proxy, 1, stream_opening(&source_pool, t0));

    chain
        .proxy
        .send_command(StreamCommand::Do {
            speed: Speed::UNITY,
        })
        .expect("do accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Do, LONG),
        Some(Ok(()))
    );

    // Input 1 drains first and reports starvation exactly once.
    assert!(
        wait_for(&events, LONG, |m| matches!(m, UpstreamMessage::Starving)).is_some(),
        "starved input reports"
    );
    let frames_at_starvation = chain
        .renderer
        .frame_count
        .load(std::sync::atomic::Ordering::SeqCst);
    let extra = drain_matching(&events, Duration::from_millis(100), |m| {
        matches!(m, UpstreamMessage::Starving)
    });
    assert!(
        extra.is_empty(),
        "no repeated starving while the gap persists: {extra:?}"
    );
    // Frames keep flowing on the output while one input starves.
    assert!(
        chain
            .renderer
            .frame_count
            .load(std::sync::atomic::Ordering::SeqCst)
            > frames_at_starvation,
        "mixing must continue through a starvation"
    );

    // Feeding the starved input resumes mixing; the next gap reports again.
    let mut refill = Vec::new();
    for _ in 0..2 {
        refill.push(data_packet(&source_pool, FRAME_BYTES).expect("blocks left"));
    }
    feed_all(&chain.proxy, 1, refill);
    assert!(
        wait_for(&events, LONG, |m| matches!(m, UpstreamMessage::Starving)).is_some(),
        "the next starvation reports again"
    );
}

#[test]
fn replicator_combines_boundary_messages() {
    let chain = ChainUnit::new("fanout");
    let replicator = StreamReplicator::new("replicator", 3, 4, ForwardMode::Default);
    let rep_index = chain.add_unit(replicator.clone() as UnitRef);
    chain.expose_input(rep_index, 0).expect("chain input exposed");

    let mut sinks = Vec::new();
    for i in 0..3 {
        let sink = EchoSink::new(&format!("sink-{i}"));
        let index = chain.add_unit(sink.clone() as UnitRef);
        chain
            .plug_units(rep_index, 1 + i, index, 0)
            .expect("replicator output plugs");
        sinks.push(sink);
    }

    let proxy = StreamProxy::new("proxy", chain as UnitRef).expect("proxy wires up");
    let events = proxy.events();

    proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );
    // Start possible requires all three outputs; it must come once.
    assert!(
        wait_for(&events, LONG, |m| matches!(m, UpstreamMessage::StartPossible)).is_some()
    );

    let mut packet = StreamPacket::new();
    packet.flags = PacketFlags::GROUP_START
        | PacketFlags::GROUP_END
        | PacketFlags::GROUP_START_NOTIFICATION
        | PacketFlags::GROUP_END_NOTIFICATION;
    packet.group_number = 5;
    assert_eq!(proxy.deliver_packets(0, &[packet]), Ok(1));

    // Group start forwards on the first report, group end after all three.
    let start = wait_for(&events, LONG, |m| {
        matches!(m, UpstreamMessage::GroupStart { group: 5, .. })
    });
    assert!(start.is_some(), "exactly one group start expected");
    let end = wait_for(&events, LONG, |m| {
        matches!(m, UpstreamMessage::GroupEnd { group: 5, .. })
    });
    assert!(end.is_some(), "exactly one group end expected");

    let duplicates = drain_matching(&events, Duration::from_millis(100), |m| {
        matches!(
            m,
            UpstreamMessage::GroupStart { .. } | UpstreamMessage::GroupEnd { .. }
        )
    });
    assert!(duplicates.is_empty(), "boundaries must not repeat: {duplicates:?}");

    for sink in &sinks {
        assert_eq!(
            sink.packets.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "every output receives the replicated packet"
        );
    }
}

#[test]
fn inactive_link_target_drops_data_but_keeps_messages() {
    // Receiving chain, left idle.
    let link_output = LinkOutput::new("link-out", 1, TickDuration::ZERO);
    let receiving = ChainUnit::new("receiving");
    let out_index = receiving.add_unit(link_output.clone() as UnitRef);
    let sink = EchoSink::new("receiving-sink");
    let sink_index = receiving.add_unit(sink.clone() as UnitRef);
    receiving
        .plug_units(out_index, 0, sink_index, 0)
        .expect("link output plugs into sink");
    let _receiving_proxy =
        StreamProxy::new("receiving-proxy", receiving as UnitRef).expect("proxy wires up");

    // Producing chain.
    let link_input = LinkInput::new("link-in", &link_output).expect("link pair registers");
    let producing = ChainUnit::new("producing");
    let in_index = producing.add_unit(link_input as UnitRef);
    producing
        .expose_input(in_index, 0)
        .expect("chain input exposed");
    let proxy = StreamProxy::new("producing-proxy", producing as UnitRef).expect("proxy wires up");
    let events = proxy.events();

    proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );
    proxy
        .send_command(StreamCommand::Do {
            speed: Speed::UNITY,
        })
        .expect("do accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Do, LONG),
        Some(Ok(()))
    );

    let source_pool = HeapPool::new(16, 64);
    for i in 0..10u16 {
        let mut packet = data_packet(&source_pool, 32).expect("blocks left");
        if i % 4 == 0 {
            packet.flags |= PacketFlags::SEGMENT_START | PacketFlags::SEGMENT_START_NOTIFICATION;
            packet.segment_number = i / 4;
        }
        assert_eq!(proxy.deliver_packets(0, &[packet]), Ok(1));
    }

    // Three segment starts were synthesized on the producing chain.
    for _ in 0..3 {
        assert!(
            wait_for(&events, LONG, |m| matches!(m, UpstreamMessage::SegmentStart { .. }))
                .is_some()
        );
    }
    // Nothing crossed into the idle receiving chain.
    assert_eq!(sink.packets.load(std::sync::atomic::Ordering::SeqCst), 0);

    // Every payload block found its way back to the source pool.
    let deadline = std::time::Instant::now() + LONG;
    while source_pool.free_blocks() != source_pool.total_blocks() {
        assert!(std::time::Instant::now() < deadline, "pool blocks leaked");
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn flush_resets_the_chain_for_a_restart() {
    let chain = mixer_chain(1);
    let events = chain.proxy.events();
    let source_pool = HeapPool::new(64, 64);

    chain
        .proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );
    feed_all(
        &chain.proxy,
        0,
        stream_opening(&source_pool, StreamTime::from_secs(1)),
    );
    chain
        .proxy
        .send_command(StreamCommand::Do {
            speed: Speed::UNITY,
        })
        .expect("do accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Do, LONG),
        Some(Ok(()))
    );

    // Flush out of streaming: back to idle in bounded time.
    chain
        .proxy
        .send_command(StreamCommand::Flush {
            mode: FlushMode::Reset,
        })
        .expect("flush accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Flush, LONG),
        Some(Ok(()))
    );
    assert_eq!(chain.proxy.state(), StreamState::Idle);

    // A second flush in idle is a completed no-op.
    chain
        .proxy
        .send_command(StreamCommand::Flush {
            mode: FlushMode::Reset,
        })
        .expect("idle flush accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Flush, LONG),
        Some(Ok(()))
    );
    assert_eq!(chain.proxy.state(), StreamState::Idle);

    // The chain starts again from scratch.
    chain
        .proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("restart begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );
    feed_all(
        &chain.proxy,
        0,
        stream_opening(&source_pool, StreamTime::from_secs(30)),
    );
    chain
        .proxy
        .send_command(StreamCommand::Do {
            speed: Speed::UNITY,
        })
        .expect("restart do accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Do, LONG),
        Some(Ok(()))
    );
    assert_eq!(chain.proxy.state(), StreamState::Streaming);
}

#[test]
fn proxy_rejects_invalid_parameters() {
    let chain = mixer_chain(1);
    let events = chain.proxy.events();

    assert_eq!(
        chain.proxy.send_command(StreamCommand::Begin { direction: 0 }),
        Err(StreamError::InvalidDirection)
    );
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Err(StreamError::InvalidDirection))
    );

    // `do` without `begin` is a state error.
    assert_eq!(
        chain.proxy.send_command(StreamCommand::Do {
            speed: Speed::UNITY
        }),
        Err(StreamError::InvalidStateForCommand)
    );

    chain
        .proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );

    // Paused and reverse speeds do not fit a forward begin.
    assert_eq!(
        chain.proxy.send_command(StreamCommand::Do {
            speed: Speed::ZERO
        }),
        Err(StreamError::InvalidSpeed)
    );
    assert_eq!(
        chain.proxy.send_command(StreamCommand::Do {
            speed: Speed(-0x10000)
        }),
        Err(StreamError::InvalidSpeed)
    );
    assert_eq!(
        chain.proxy.send_command(StreamCommand::Step { frames: -2 }),
        Err(StreamError::InvalidStepCount)
    );

    // A repeated begin in the same direction completes without work.
    chain
        .proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("noop begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );
    assert_eq!(chain.proxy.state(), StreamState::Ready);
}

#[test]
fn terminator_echoes_requested_boundaries() {
    let chain = ChainUnit::new("terminated");
    let terminator = crate::terminator::TerminatorUnit::new("terminator");
    let index = chain.add_unit(terminator as UnitRef);
    chain.expose_input(index, 0).expect("chain input exposed");
    let proxy = StreamProxy::new("proxy", chain as UnitRef).expect("proxy wires up");
    let events = proxy.events();

    proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    // A terminated chain immediately fakes readiness to start.
    assert!(
        wait_for(&events, LONG, |m| matches!(m, UpstreamMessage::StartPossible)).is_some()
    );
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );

    let mut packet = StreamPacket::new();
    packet.flags = PacketFlags::SEGMENT_START
        | PacketFlags::SEGMENT_START_NOTIFICATION
        | PacketFlags::GROUP_START
        | PacketFlags::GROUP_END
        | PacketFlags::GROUP_END_NOTIFICATION
        | PacketFlags::SEGMENT_END
        | PacketFlags::SEGMENT_END_NOTIFICATION;
    packet.segment_number = 2;
    packet.group_number = 7;
    assert_eq!(proxy.deliver_packets(0, &[packet]), Ok(1));

    assert!(
        wait_for(&events, LONG, |m| matches!(
            m,
            UpstreamMessage::SegmentStart { segment: 2 }
        ))
        .is_some()
    );
    assert!(
        wait_for(&events, LONG, |m| matches!(
            m,
            UpstreamMessage::GroupEnd { group: 7, .. }
        ))
        .is_some()
    );
    assert!(
        wait_for(&events, LONG, |m| matches!(
            m,
            UpstreamMessage::SegmentEnd { segment: 2 }
        ))
        .is_some()
    );
}

#[test]
fn chain_outputs_deliver_to_the_application() {
    // A single-output replicator in pass-through message mode bridges the
    // application input to an application-visible chain output.
    let chain = ChainUnit::new("loopback");
    let replicator = StreamReplicator::new("tap", 1, 4, ForwardMode::All);
    let index = chain.add_unit(replicator as UnitRef);
    let in_id = chain.expose_input(index, 0).expect("chain input exposed");
    let out_id = chain
        .expose_output(index, 1, 8)
        .expect("chain output exposed");
    assert_eq!((in_id, out_id), (0, 1));

    let proxy = StreamProxy::new("proxy", chain as UnitRef).expect("proxy wires up");
    let events = proxy.events();
    assert_eq!((proxy.num_outputs(), proxy.num_inputs()), (1, 1));

    // The application owns the pool for the chain's output side.
    let pool = HeapPool::new(8, 256);
    proxy
        .provide_allocator(1, pool.clone())
        .expect("allocator travels upstream");
    assert!(proxy.request_allocator(0).is_ok(), "allocator arrives at the chain input");

    proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );

    let source_pool = HeapPool::new(4, 64);
    let mut packet = data_packet(&source_pool, 48).expect("blocks left");
    packet.flags |= PacketFlags::GROUP_START | PacketFlags::GROUP_END;
    packet.group_number = 3;
    assert_eq!(proxy.deliver_packets(0, &[packet]), Ok(1));

    let arrival = wait_for(&events, LONG, |m| {
        matches!(m, UpstreamMessage::PacketArrival { .. })
    });
    assert!(matches!(
        arrival,
        Some(UpstreamMessage::PacketArrival { connector: 1, .. })
    ));

    let mut dest = [StreamPacket::new()];
    assert_eq!(proxy.get_packets(1, &mut dest), Ok(1));
    assert_eq!(dest[0].group_number, 3);
    assert_eq!(dest[0].data_size(), 48);
    assert!(dest[0].flags.contains(PacketFlags::GROUP_START | PacketFlags::GROUP_END));
}

#[test]
fn diagnostics_sees_running_mixers() {
    crate::diagnostics::init();
    let chain = mixer_chain(1);
    let events = chain.proxy.events();

    chain
        .proxy
        .send_command(StreamCommand::Begin { direction: 1 })
        .expect("begin accepted");
    assert_eq!(
        wait_for_completion(&events, CommandKind::Begin, LONG),
        Some(Ok(()))
    );

    // Silence frames count as mixed frames as soon as the output runs.
    let deadline = std::time::Instant::now() + LONG;
    loop {
        let mixed = crate::diagnostics::snapshot()
            .iter()
            .find(|(name, _)| name == "mixer")
            .map(|(_, stats)| stats.frames_mixed)
            .unwrap_or(0);
        if mixed > 0 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "no frames mixed");
        std::thread::sleep(Duration::from_millis(5));
    }
    crate::diagnostics::shutdown();
}
