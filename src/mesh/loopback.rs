//! In-process mesh hub for tests and single-box demos.
//!
//! Endpoints register with an address and get back a link plus an event
//! channel; the hub routes frames between them synchronously. Broadcasts are
//! delivered to every attached endpoint *including the sender*, reproducing
//! the multicast echo some radio transports exhibit, so loopback suppression
//! in the negotiation layer gets exercised. [`LoopbackMesh::set_attached`]
//! simulates a node falling off the mesh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::debug;
use tokio::sync::mpsc;

use super::{MeshEvent, MeshFrame, MeshLink, MeshRole, NodeAddr};

#[derive(Default)]
struct Registry {
    endpoints: HashMap<NodeAddr, Endpoint>,
}

struct Endpoint {
    events: mpsc::UnboundedSender<MeshEvent>,
    attached: bool,
}

/// The hub. Clone-free; hand out endpoints from one instance.
#[derive(Default)]
pub struct LoopbackMesh {
    registry: Arc<Mutex<Registry>>,
}

impl LoopbackMesh {
    pub fn new() -> Self {
        LoopbackMesh::default()
    }

    /// Register a node. The returned channel immediately carries an
    /// `Attached` role event, mirroring what the UDP transport reports once
    /// its socket is up.
    pub fn endpoint(&self, addr: NodeAddr) -> (Arc<LoopbackLink>, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(MeshEvent::Role(MeshRole::Attached));
        let mut registry = self.registry.lock().expect("loopback registry poisoned");
        registry.endpoints.insert(
            addr,
            Endpoint {
                events: tx,
                attached: true,
            },
        );
        let link = Arc::new(LoopbackLink {
            addr,
            registry: self.registry.clone(),
        });
        (link, rx)
    }

    /// Attach or detach a node. The node is told about the change; frames
    /// from or to a detached node are dropped by the hub.
    pub fn set_attached(&self, addr: NodeAddr, attached: bool) {
        let mut registry = self.registry.lock().expect("loopback registry poisoned");
        if let Some(endpoint) = registry.endpoints.get_mut(&addr) {
            endpoint.attached = attached;
            let role = if attached {
                MeshRole::Attached
            } else {
                MeshRole::Detached
            };
            let _ = endpoint.events.send(MeshEvent::Role(role));
        }
    }
}

/// One node's handle onto the hub.
pub struct LoopbackLink {
    addr: NodeAddr,
    registry: Arc<Mutex<Registry>>,
}

impl MeshLink for LoopbackLink {
    fn local_addr(&self) -> NodeAddr {
        self.addr
    }

    fn send(&self, frame: MeshFrame) -> Result<()> {
        let mut registry = self.registry.lock().expect("loopback registry poisoned");
        let sender_attached = registry
            .endpoints
            .get(&self.addr)
            .map(|e| e.attached)
            .unwrap_or(false);
        if !sender_attached {
            debug!("Loopback: {} detached; dropping {}", self.addr, frame.kind());
            return Ok(());
        }
        let dest = frame.dest();
        if dest.is_broadcast() {
            registry.endpoints.retain(|_, endpoint| {
                if !endpoint.attached {
                    return true;
                }
                // including the sender: multicast echoes back
                endpoint.events.send(MeshEvent::Frame(frame.clone())).is_ok()
            });
        } else {
            match registry.endpoints.get(&dest) {
                Some(endpoint) if endpoint.attached => {
                    if endpoint.events.send(MeshEvent::Frame(frame)).is_err() {
                        registry.endpoints.remove(&dest);
                    }
                }
                Some(_) => debug!("Loopback: {} detached; dropping frame from {}", dest, self.addr),
                None => debug!("Loopback: no endpoint {}; dropping frame", dest),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{FrameMeta, MeterCommand};

    fn request(source: NodeAddr, dest: NodeAddr, message_id: u16) -> MeshFrame {
        MeshFrame::Request {
            meta: FrameMeta { source, message_id },
            dest,
            command: MeterCommand::Discover,
        }
    }

    #[tokio::test]
    async fn broadcast_echoes_to_sender() {
        let hub = LoopbackMesh::new();
        let (a, mut a_rx) = hub.endpoint(NodeAddr(1));
        let (_b, mut b_rx) = hub.endpoint(NodeAddr(2));
        assert_eq!(a_rx.recv().await.unwrap(), MeshEvent::Role(MeshRole::Attached));
        assert_eq!(b_rx.recv().await.unwrap(), MeshEvent::Role(MeshRole::Attached));

        a.send(request(NodeAddr(1), NodeAddr::BROADCAST, 7)).unwrap();
        let at_b = b_rx.recv().await.unwrap();
        let at_a = a_rx.recv().await.unwrap();
        assert_eq!(at_b, MeshEvent::Frame(request(NodeAddr(1), NodeAddr::BROADCAST, 7)));
        assert_eq!(at_a, at_b);
    }

    #[tokio::test]
    async fn unicast_reaches_only_the_target() {
        let hub = LoopbackMesh::new();
        let (a, mut a_rx) = hub.endpoint(NodeAddr(1));
        let (_b, mut b_rx) = hub.endpoint(NodeAddr(2));
        let _ = a_rx.recv().await;
        let _ = b_rx.recv().await;

        a.send(request(NodeAddr(1), NodeAddr(2), 9)).unwrap();
        assert_eq!(
            b_rx.recv().await.unwrap(),
            MeshEvent::Frame(request(NodeAddr(1), NodeAddr(2), 9))
        );
        assert!(a_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn detached_endpoints_neither_send_nor_receive() {
        let hub = LoopbackMesh::new();
        let (a, mut a_rx) = hub.endpoint(NodeAddr(1));
        let (b, mut b_rx) = hub.endpoint(NodeAddr(2));
        let _ = a_rx.recv().await;
        let _ = b_rx.recv().await;

        hub.set_attached(NodeAddr(2), false);
        assert_eq!(b_rx.recv().await.unwrap(), MeshEvent::Role(MeshRole::Detached));

        a.send(request(NodeAddr(1), NodeAddr(2), 1)).unwrap();
        assert!(b_rx.try_recv().is_err());

        b.send(request(NodeAddr(2), NodeAddr(1), 2)).unwrap();
        assert!(a_rx.try_recv().is_err());

        hub.set_attached(NodeAddr(2), true);
        assert_eq!(b_rx.recv().await.unwrap(), MeshEvent::Role(MeshRole::Attached));
        a.send(request(NodeAddr(1), NodeAddr(2), 3)).unwrap();
        assert_eq!(
            b_rx.recv().await.unwrap(),
            MeshEvent::Frame(request(NodeAddr(1), NodeAddr(2), 3))
        );
    }
}
