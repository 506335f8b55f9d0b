//! Blockwise transfer against a live agent, with the far side of the round
//! scripted frame by frame: a fake sender feeding a receiving agent, and a
//! fake receiver pacing a sending agent.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use uuid::Uuid;

use meshmeter::agent::{AgentHandle, AgentServer, AgentStatus};
use meshmeter::config::Config;
use meshmeter::mesh::{
    loopback::{LoopbackLink, LoopbackMesh},
    BlockDisposition, FrameMeta, MeshCode, MeshEvent, MeshFrame, MeshLink, MeterCommand, NodeAddr,
};
use meshmeter::modem::{sim, DeviceState};

const BLOCK: u32 = 32;
const TOTAL: u32 = 4 * BLOCK;

fn test_config() -> Config {
    let mut cfg = Config::default();
    cfg.agent.upload_interval_secs = 0;
    cfg.agent.discover_on_start = false;
    cfg.mesh.mode = "loopback".to_string();
    cfg.modem.mode = "sim".to_string();
    cfg.modem.publish_timeout_ms = 500;
    cfg.modem.sync_watchdog_secs = 60;
    cfg.transfer.block_size = BLOCK as u16;
    cfg.transfer.total_chunks = 4;
    cfg.transfer.chunk_timeout_ms = 300;
    cfg.transfer.negotiation_timeout_ms = 2_000;
    cfg
}

fn fast_sim() -> sim::SimProfile {
    sim::SimProfile {
        boot_delay: Duration::from_millis(20),
        connect_delay: Duration::from_millis(20),
        publish_delay: Duration::from_millis(30),
        ..sim::SimProfile::default()
    }
}

fn dead_sim() -> sim::SimProfile {
    sim::SimProfile {
        auto_boot: false,
        ..fast_sim()
    }
}

fn spawn_agent(hub: &LoopbackMesh, id: u32, profile: sim::SimProfile) -> AgentHandle {
    let local = NodeAddr(id);
    let (link, events) = hub.endpoint(local);
    let (port, lines) = sim::spawn(profile);
    let (server, handle) = AgentServer::with_parts(
        test_config(),
        local,
        link,
        events,
        port,
        lines,
        DeviceState::Off,
    );
    tokio::spawn(server.run());
    handle
}

async fn wait_status<F>(handle: &AgentHandle, what: &str, pred: F) -> AgentStatus
where
    F: Fn(&AgentStatus) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(15);
    loop {
        let status = handle.status().await.expect("agent task alive");
        if pred(&status) {
            return status;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for {}; last status {:?}",
            what,
            status
        );
        sleep(Duration::from_millis(10)).await;
    }
}

async fn next_frame(events: &mut mpsc::UnboundedReceiver<MeshEvent>) -> MeshFrame {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("hub closed");
        match event {
            MeshEvent::Frame(frame) => return frame,
            MeshEvent::Role(_) => continue,
        }
    }
}

/// Boot an idle receiving agent and ask it to take our measurement.
async fn open_round(
    peer: NodeAddr,
    agent_addr: NodeAddr,
    link: &Arc<LoopbackLink>,
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
) {
    link.send(MeshFrame::Request {
        meta: FrameMeta {
            source: peer,
            message_id: 100,
        },
        dest: agent_addr,
        command: MeterCommand::UploadMeasurement,
    })
    .expect("hub send");
    let answer = next_frame(events).await;
    let MeshFrame::Response { code, .. } = answer else {
        panic!("expected the upload verdict, got {:?}", answer);
    };
    assert_eq!(code, MeshCode::Changed, "idle agent should take the upload");
}

fn block(
    peer: NodeAddr,
    dest: NodeAddr,
    round: Uuid,
    message_id: u16,
    position: u32,
    more: bool,
) -> MeshFrame {
    let data: Vec<u8> = (0..BLOCK).map(|i| b'0' + ((position + i) % 10) as u8).collect();
    MeshFrame::Block {
        meta: FrameMeta {
            source: peer,
            message_id,
        },
        dest,
        round,
        position,
        total_len: TOTAL,
        more,
        data,
    }
}

async fn next_result(
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
) -> (Uuid, u32, BlockDisposition) {
    let frame = next_frame(events).await;
    let MeshFrame::BlockResult {
        round,
        position,
        disposition,
        ..
    } = frame
    else {
        panic!("expected a block result, got {:?}", frame);
    };
    (round, position, disposition)
}

/// Send one block, resending while the agent's bridge reports busy.
async fn deliver(
    link: &Arc<LoopbackLink>,
    events: &mut mpsc::UnboundedReceiver<MeshEvent>,
    frame: &MeshFrame,
) -> (u32, BlockDisposition) {
    for _ in 0..10 {
        link.send(frame.clone()).expect("hub send");
        let (_, position, disposition) = next_result(events).await;
        if disposition != BlockDisposition::Retry {
            return (position, disposition);
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("agent kept asking for retries");
}

#[tokio::test]
async fn scripted_sender_completes_a_round() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x61);
    let agent = spawn_agent(&hub, 0x61, fast_sim());
    let peer = NodeAddr(0x62);
    let (peer_link, mut peer_events) = hub.endpoint(peer);

    wait_status(&agent, "modem idle", |s| s.device_state == DeviceState::Idle).await;
    sleep(Duration::from_millis(150)).await;
    open_round(peer, agent_addr, &peer_link, &mut peer_events).await;

    let round = Uuid::new_v4();
    for index in 0..4u32 {
        let position = index * BLOCK;
        let more = index < 3;
        let frame = block(peer, agent_addr, round, 200 + index as u16, position, more);
        let (acked, disposition) = deliver(&peer_link, &mut peer_events, &frame).await;
        assert_eq!(disposition, BlockDisposition::Accepted);
        assert_eq!(acked, position);
    }

    let done = wait_status(&agent, "round complete", |s| {
        !s.serving && s.device_state == DeviceState::Idle
    })
    .await;
    assert!(done.metrics.rounds_completed >= 1);
}

#[tokio::test]
async fn stray_block_draws_an_abort() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x63);
    let agent = spawn_agent(&hub, 0x63, fast_sim());
    let peer = NodeAddr(0x64);
    let (peer_link, mut peer_events) = hub.endpoint(peer);

    wait_status(&agent, "modem idle", |s| s.device_state == DeviceState::Idle).await;

    let round = Uuid::new_v4();
    peer_link
        .send(block(peer, agent_addr, round, 300, 0, true))
        .expect("hub send");
    let (echoed, position, disposition) = next_result(&mut peer_events).await;
    assert_eq!(disposition, BlockDisposition::Abort);
    assert_eq!(echoed, round);
    assert_eq!(position, 0);

    let status = agent.status().await.expect("agent task alive");
    assert!(!status.serving, "a stray block must not open a round");
}

#[tokio::test]
async fn duplicate_block_is_reacked_without_republishing() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x65);
    let agent = spawn_agent(&hub, 0x65, fast_sim());
    let peer = NodeAddr(0x66);
    let (peer_link, mut peer_events) = hub.endpoint(peer);

    wait_status(&agent, "modem idle", |s| s.device_state == DeviceState::Idle).await;
    sleep(Duration::from_millis(150)).await;
    open_round(peer, agent_addr, &peer_link, &mut peer_events).await;

    let round = Uuid::new_v4();
    let first = block(peer, agent_addr, round, 400, 0, true);
    let (acked, disposition) = deliver(&peer_link, &mut peer_events, &first).await;
    assert_eq!((acked, disposition), (0, BlockDisposition::Accepted));

    // A lost verdict makes the sender repeat the chunk; the answer comes
    // straight from the transfer state, bridge busy or not.
    peer_link.send(first.clone()).expect("hub send");
    let (_, acked, disposition) = next_result(&mut peer_events).await;
    assert_eq!((acked, disposition), (0, BlockDisposition::Accepted));

    let last = block(peer, agent_addr, round, 401, BLOCK, false);
    let (acked, disposition) = deliver(&peer_link, &mut peer_events, &last).await;
    assert_eq!((acked, disposition), (BLOCK, BlockDisposition::Accepted));

    wait_status(&agent, "round complete", |s| {
        !s.serving && s.device_state == DeviceState::Idle
    })
    .await;
}

#[tokio::test]
async fn out_of_order_block_aborts_the_round() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x67);
    let agent = spawn_agent(&hub, 0x67, fast_sim());
    let peer = NodeAddr(0x68);
    let (peer_link, mut peer_events) = hub.endpoint(peer);

    wait_status(&agent, "modem idle", |s| s.device_state == DeviceState::Idle).await;
    sleep(Duration::from_millis(150)).await;
    open_round(peer, agent_addr, &peer_link, &mut peer_events).await;

    let round = Uuid::new_v4();
    let first = block(peer, agent_addr, round, 500, 0, true);
    let (_, disposition) = deliver(&peer_link, &mut peer_events, &first).await;
    assert_eq!(disposition, BlockDisposition::Accepted);

    // Skipping ahead is unrecoverable; the round is torn down at once.
    peer_link
        .send(block(peer, agent_addr, round, 501, 3 * BLOCK, true))
        .expect("hub send");
    let (_, position, disposition) = next_result(&mut peer_events).await;
    assert_eq!(disposition, BlockDisposition::Abort);
    assert_eq!(position, 3 * BLOCK);

    wait_status(&agent, "round torn down", |s| {
        !s.serving && s.device_state == DeviceState::Idle
    })
    .await;
}

#[tokio::test]
async fn second_offer_mid_round_is_rejected() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x71);
    let agent = spawn_agent(&hub, 0x71, fast_sim());
    let sender = NodeAddr(0x72);
    let (sender_link, mut sender_events) = hub.endpoint(sender);
    let rival = NodeAddr(0x73);
    let (rival_link, mut rival_events) = hub.endpoint(rival);

    wait_status(&agent, "modem idle", |s| s.device_state == DeviceState::Idle).await;
    sleep(Duration::from_millis(150)).await;
    open_round(sender, agent_addr, &sender_link, &mut sender_events).await;

    let round = Uuid::new_v4();
    let first = block(sender, agent_addr, round, 900, 0, true);
    let (_, disposition) = deliver(&sender_link, &mut sender_events, &first).await;
    assert_eq!(disposition, BlockDisposition::Accepted);

    // A rival asking mid-round is turned away without touching the transfer.
    rival_link
        .send(MeshFrame::Request {
            meta: FrameMeta {
                source: rival,
                message_id: 910,
            },
            dest: agent_addr,
            command: MeterCommand::UploadMeasurement,
        })
        .expect("hub send");
    let refusal = next_frame(&mut rival_events).await;
    let MeshFrame::Response { code, .. } = refusal else {
        panic!("expected a refusal, got {:?}", refusal);
    };
    assert_eq!(code, MeshCode::ServiceUnavailable);

    // The original round is untouched and runs to completion.
    for index in 1..4u32 {
        let position = index * BLOCK;
        let more = index < 3;
        let frame = block(sender, agent_addr, round, 901 + index as u16, position, more);
        let (acked, disposition) = deliver(&sender_link, &mut sender_events, &frame).await;
        assert_eq!((acked, disposition), (position, BlockDisposition::Accepted));
    }
    wait_status(&agent, "round complete", |s| {
        !s.serving && s.device_state == DeviceState::Idle
    })
    .await;
}

#[tokio::test]
async fn stalled_sender_is_dropped_after_the_inactivity_window() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x69);
    let agent = spawn_agent(&hub, 0x69, fast_sim());
    let peer = NodeAddr(0x6a);
    let (peer_link, mut peer_events) = hub.endpoint(peer);

    wait_status(&agent, "modem idle", |s| s.device_state == DeviceState::Idle).await;
    sleep(Duration::from_millis(150)).await;
    open_round(peer, agent_addr, &peer_link, &mut peer_events).await;

    let round = Uuid::new_v4();
    let first = block(peer, agent_addr, round, 600, 0, true);
    let (_, disposition) = deliver(&peer_link, &mut peer_events, &first).await;
    assert_eq!(disposition, BlockDisposition::Accepted);

    // Then say nothing. The receiver's inactivity window is sized past the
    // sender's whole retransmit budget, so this takes a little while.
    wait_status(&agent, "stalled round dropped", |s| {
        !s.serving && s.device_state == DeviceState::Idle
    })
    .await;

    // The drop is silent; no verdict is sent for a round that went away.
    assert!(
        peer_events.try_recv().is_err(),
        "expected no further frames after the drop"
    );
}

#[tokio::test]
async fn slow_bridge_asks_for_a_retry() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x6b);
    let slow = sim::SimProfile {
        publish_delay: Duration::from_millis(400),
        ..fast_sim()
    };
    let agent = spawn_agent(&hub, 0x6b, slow);
    let peer = NodeAddr(0x6c);
    let (peer_link, mut peer_events) = hub.endpoint(peer);

    wait_status(&agent, "modem idle", |s| s.device_state == DeviceState::Idle).await;
    sleep(Duration::from_millis(150)).await;
    open_round(peer, agent_addr, &peer_link, &mut peer_events).await;

    let round = Uuid::new_v4();
    peer_link
        .send(block(peer, agent_addr, round, 700, 0, true))
        .expect("hub send");
    let (_, position, disposition) = next_result(&mut peer_events).await;
    assert_eq!((position, disposition), (0, BlockDisposition::Accepted));

    // The bridge now publishes for 400ms; the next chunk cannot be taken.
    peer_link
        .send(block(peer, agent_addr, round, 701, BLOCK, true))
        .expect("hub send");
    let (_, position, disposition) = next_result(&mut peer_events).await;
    assert_eq!((position, disposition), (BLOCK, BlockDisposition::Retry));

    // Once the publish is through, the same chunk goes in.
    sleep(Duration::from_millis(500)).await;
    peer_link
        .send(block(peer, agent_addr, round, 702, BLOCK, true))
        .expect("hub send");
    let (_, position, disposition) = next_result(&mut peer_events).await;
    assert_eq!((position, disposition), (BLOCK, BlockDisposition::Accepted));

    agent.shutdown();
}

#[tokio::test]
async fn sender_holds_the_chunk_until_the_retry_timer() {
    let hub = LoopbackMesh::new();
    let agent_addr = NodeAddr(0x6d);
    let agent = spawn_agent(&hub, 0x6d, dead_sim());
    let peer = NodeAddr(0x6e);
    let (peer_link, mut peer_events) = hub.endpoint(peer);

    // Volunteer as the serving peer and accept the agent's offer.
    peer_link
        .send(MeshFrame::Request {
            meta: FrameMeta {
                source: peer,
                message_id: 800,
            },
            dest: agent_addr,
            command: MeterCommand::ReportState(DeviceState::Idle),
        })
        .expect("hub send");
    let _ack = next_frame(&mut peer_events).await;
    let offer = next_frame(&mut peer_events).await;
    let MeshFrame::Request { meta, command, .. } = &offer else {
        panic!("expected an upload offer, got {:?}", offer);
    };
    assert_eq!(*command, MeterCommand::UploadMeasurement);
    peer_link
        .send(MeshFrame::Response {
            meta: FrameMeta {
                source: peer,
                message_id: 801,
            },
            dest: agent_addr,
            in_reply_to: meta.message_id,
            code: MeshCode::Changed,
        })
        .expect("hub send");

    let first = next_frame(&mut peer_events).await;
    let MeshFrame::Block {
        round,
        position,
        more,
        data,
        total_len,
        ..
    } = &first
    else {
        panic!("expected the first chunk, got {:?}", first);
    };
    assert_eq!(*position, 0);
    assert!(*more);
    assert_eq!(*total_len, TOTAL);
    assert_eq!(data.len(), BLOCK as usize);
    let round = *round;

    // Report busy: the agent must hold the chunk quietly until its
    // retransmit timer fires, not hammer the mesh.
    peer_link
        .send(MeshFrame::BlockResult {
            meta: FrameMeta {
                source: peer,
                message_id: 802,
            },
            dest: agent_addr,
            round,
            position: 0,
            disposition: BlockDisposition::Retry,
        })
        .expect("hub send");
    assert!(
        tokio::time::timeout(Duration::from_millis(150), next_frame(&mut peer_events))
            .await
            .is_err(),
        "the chunk must wait for the retransmit timer"
    );
    let resent = next_frame(&mut peer_events).await;
    assert_eq!(resent, first, "the held chunk is resent unchanged");

    // From here, accept everything and let the round run out.
    let mut next_id = 803u16;
    let mut frame = resent;
    loop {
        let MeshFrame::Block { position, more, .. } = &frame else {
            panic!("expected a chunk, got {:?}", frame);
        };
        let (position, more) = (*position, *more);
        peer_link
            .send(MeshFrame::BlockResult {
                meta: FrameMeta {
                    source: peer,
                    message_id: next_id,
                },
                dest: agent_addr,
                round,
                position,
                disposition: BlockDisposition::Accepted,
            })
            .expect("hub send");
        next_id += 1;
        if !more {
            break;
        }
        frame = next_frame(&mut peer_events).await;
    }

    let done = wait_status(&agent, "upload finished", |s| !s.uploading).await;
    assert!(done.metrics.chunks_sent >= 4);
    assert!(done.metrics.chunk_retries >= 1);
}
