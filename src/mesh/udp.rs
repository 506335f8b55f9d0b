//! UDP mesh transport.
//!
//! Discover probes ride a multicast group; everything else is unicast to an
//! address learned from the source of inbound frames. There is no peer table
//! maintenance beyond that: a peer we have never heard from cannot be
//! addressed, and frames to it are dropped with a warning.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use super::{decode_frame, encode_frame, MeshEvent, MeshFrame, MeshLink, MeshRole, NodeAddr};

/// Largest datagram we ever expect; block frames stay well under this.
const RECV_BUFFER: usize = 2048;

pub struct UdpLink {
    local: NodeAddr,
    socket: UdpSocket,
    multicast: SocketAddrV4,
    peers: Mutex<HashMap<NodeAddr, SocketAddr>>,
}

/// Bind the socket, join the discover group and start the receive task.
/// The event channel opens with an `Attached` role event once the socket is
/// up; a UDP node never detaches.
pub async fn open(
    bind_addr: &str,
    port: u16,
    multicast_group: &str,
    local: NodeAddr,
) -> Result<(Arc<UdpLink>, mpsc::UnboundedReceiver<MeshEvent>)> {
    let bind: Ipv4Addr = bind_addr
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", bind_addr))?;
    let group: Ipv4Addr = multicast_group
        .parse()
        .with_context(|| format!("Invalid multicast group '{}'", multicast_group))?;
    if !group.is_multicast() {
        return Err(anyhow!("'{}' is not a multicast address", multicast_group));
    }

    let socket = UdpSocket::bind(SocketAddrV4::new(bind, port))
        .await
        .with_context(|| format!("Failed to bind mesh socket {}:{}", bind_addr, port))?;
    socket
        .join_multicast_v4(group, bind)
        .with_context(|| format!("Failed to join multicast group {}", group))?;
    // Own multicasts may echo back; the negotiation layer filters them.
    socket.set_multicast_loop_v4(true)?;
    let bound = socket.local_addr()?;
    info!(
        "Mesh socket bound on {} as node {}, discover group {}:{}",
        bound, local, group, port
    );

    let link = Arc::new(UdpLink {
        local,
        socket,
        multicast: SocketAddrV4::new(group, port),
        peers: Mutex::new(HashMap::new()),
    });

    let (tx, rx) = mpsc::unbounded_channel();
    let _ = tx.send(MeshEvent::Role(MeshRole::Attached));
    tokio::spawn(receive_loop(link.clone(), tx));
    Ok((link, rx))
}

async fn receive_loop(link: Arc<UdpLink>, events: mpsc::UnboundedSender<MeshEvent>) {
    let mut buf = vec![0u8; RECV_BUFFER];
    loop {
        match link.socket.recv_from(&mut buf).await {
            Ok((n, src)) => match decode_frame(&buf[..n]) {
                Some(frame) => {
                    link.learn_peer(frame.meta().source, src);
                    if events.send(MeshEvent::Frame(frame)).is_err() {
                        debug!("Mesh event receiver dropped; stopping receive loop");
                        return;
                    }
                }
                None => debug!("Dropping undecodable {}-byte datagram from {}", n, src),
            },
            Err(e) => {
                warn!("Mesh receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

impl UdpLink {
    fn learn_peer(&self, peer: NodeAddr, addr: SocketAddr) {
        if peer == self.local {
            return;
        }
        let mut peers = self.peers.lock().expect("peer map mutex poisoned");
        let known = peers.insert(peer, addr);
        if known != Some(addr) {
            debug!("Learned peer {} at {}", peer, addr);
        }
    }
}

impl MeshLink for UdpLink {
    fn local_addr(&self) -> NodeAddr {
        self.local
    }

    fn send(&self, frame: MeshFrame) -> Result<()> {
        let data = encode_frame(&frame)?;
        let dest = frame.dest();
        let target: SocketAddr = if dest.is_broadcast() {
            self.multicast.into()
        } else {
            let peers = self.peers.lock().expect("peer map mutex poisoned");
            match peers.get(&dest) {
                Some(addr) => *addr,
                None => {
                    warn!("No known address for peer {}; dropping {}", dest, frame.kind());
                    return Ok(());
                }
            }
        };
        match self.socket.try_send_to(&data, target) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                // datagram drop; upper layers retransmit where it matters
                debug!("Mesh socket busy; dropped {} to {}", frame.kind(), dest);
                Ok(())
            }
            Err(e) => Err(anyhow!("Mesh send to {} failed: {}", dest, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{FrameMeta, MeterCommand};

    #[tokio::test]
    async fn unicast_between_two_links() {
        let (a, _a_rx) = open("127.0.0.1", 0, "239.0.0.77", NodeAddr(0xa))
            .await
            .unwrap();
        let (b, mut b_rx) = open("127.0.0.1", 0, "239.0.0.77", NodeAddr(0xb))
            .await
            .unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), MeshEvent::Role(MeshRole::Attached));

        // teach A where B lives, as if B had sent something first
        let b_addr = b.socket.local_addr().unwrap();
        a.learn_peer(NodeAddr(0xb), b_addr);

        let frame = MeshFrame::Request {
            meta: FrameMeta {
                source: NodeAddr(0xa),
                message_id: 99,
            },
            dest: NodeAddr(0xb),
            command: MeterCommand::UploadMeasurement,
        };
        a.send(frame.clone()).unwrap();
        assert_eq!(b_rx.recv().await.unwrap(), MeshEvent::Frame(frame));

        // and B learned A's address from the inbound frame
        let learned = b.peers.lock().unwrap().get(&NodeAddr(0xa)).copied();
        assert_eq!(learned, Some(a.socket.local_addr().unwrap()));
    }

    #[tokio::test]
    async fn frames_to_unknown_peers_are_dropped() {
        let (a, _a_rx) = open("127.0.0.1", 0, "239.0.0.77", NodeAddr(0xa))
            .await
            .unwrap();
        let frame = MeshFrame::Request {
            meta: FrameMeta {
                source: NodeAddr(0xa),
                message_id: 1,
            },
            dest: NodeAddr(0xcc),
            command: MeterCommand::Discover,
        };
        // no address known; send succeeds but goes nowhere
        assert!(a.send(frame).is_ok());
    }
}
