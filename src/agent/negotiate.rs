//! Peer negotiation: who uploads this round?
//!
//! A pure state machine. It consumes inbound requests/responses and local
//! triggers, and emits [`Action`]s for the server to carry out; it never
//! touches the network or the modem itself, which keeps every transition
//! unit-testable without tasks or sockets.
//!
//! The exchange between two peers:
//!
//! ```text
//! node A (modem off)                 node B (modem idle)
//!    |--- DISCOVER (multicast) --------->|
//!    |<-- REPORT_STATE(idle) ------------|   new request, not a response
//!    |--- ack CHANGED ------------------>|
//!    |--- UPLOAD_MEASUREMENT ----------->|
//!    |<-- ack CHANGED -------------------|   B turns busy, A starts sending
//! ```
//!
//! Two cheap guards precede all request handling: a frame whose source is our
//! own address is dropped (multicast echoes back on most transports), and a
//! request carrying the same transport message id as the previous one is
//! dropped as a duplicate delivery. One remembered id, not a window.

use log::{debug, info, trace, warn};

use crate::mesh::{FrameMeta, MeshCode, MeterCommand, NodeAddr};
use crate::metrics;
use crate::modem::DeviceState;

/// What the server should do next. Emitted in order; frame-producing actions
/// carry the message id the engine assigned so replies can be matched later.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Answer the request we just processed.
    Respond {
        dest: NodeAddr,
        message_id: u16,
        in_reply_to: u16,
        code: MeshCode,
    },
    /// Issue a new request of our own.
    Request {
        dest: NodeAddr,
        message_id: u16,
        command: MeterCommand,
    },
    /// Serve an inbound measurement transfer from `peer`.
    BeginReceive { peer: NodeAddr },
    /// Push our measurement to `peer` in chunks.
    BeginSend { peer: NodeAddr },
    /// Push our measurement straight into the local modem bridge.
    BeginLocalPush,
}

/// An UPLOAD_MEASUREMENT offer awaiting the peer's verdict.
struct PendingOffer {
    peer: NodeAddr,
    message_id: u16,
}

pub struct Negotiator {
    local: NodeAddr,
    /// Transport id of the last request processed, for duplicate suppression.
    last_request_id: Option<u16>,
    next_message_id: u16,
    /// An upload round is currently this node's responsibility.
    uploading: bool,
    pending: Option<PendingOffer>,
}

impl Negotiator {
    pub fn new(local: NodeAddr) -> Self {
        Negotiator {
            local,
            last_request_id: None,
            next_message_id: rand::random(),
            uploading: false,
            pending: None,
        }
    }

    pub fn uploading(&self) -> bool {
        self.uploading
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Process one inbound request. `device_state` is the state of our own
    /// modem as it should be reported to peers.
    pub fn on_request(
        &mut self,
        meta: FrameMeta,
        command: MeterCommand,
        device_state: DeviceState,
    ) -> Vec<Action> {
        if meta.source == self.local {
            trace!("Dropping our own {} request echoed back", command.name());
            return Vec::new();
        }
        if self.last_request_id == Some(meta.message_id) {
            debug!(
                "Duplicate {} request {:#06x} from {}; already handled",
                command.name(),
                meta.message_id,
                meta.source
            );
            metrics::inc_requests_deduped();
            return Vec::new();
        }
        self.last_request_id = Some(meta.message_id);

        match command {
            MeterCommand::Discover => self.on_discover(meta, device_state),
            MeterCommand::ReportState(peer_state) => self.on_report_state(meta, peer_state),
            MeterCommand::UploadMeasurement => self.on_upload_measurement(meta, device_state),
        }
    }

    fn on_discover(&mut self, meta: FrameMeta, device_state: DeviceState) -> Vec<Action> {
        match device_state {
            DeviceState::Idle | DeviceState::Busy => {
                info!("Discover probe from {}; reporting {}", meta.source, device_state);
                let message_id = self.next_id();
                vec![Action::Request {
                    dest: meta.source,
                    message_id,
                    command: MeterCommand::ReportState(device_state),
                }]
            }
            DeviceState::Off | DeviceState::Unknown => {
                debug!(
                    "Discover probe from {} ignored; modem is {}",
                    meta.source, device_state
                );
                Vec::new()
            }
        }
    }

    fn on_report_state(&mut self, meta: FrameMeta, peer_state: DeviceState) -> Vec<Action> {
        info!("Peer {} reports its modem {}", meta.source, peer_state);
        let ack_id = self.next_id();
        let mut actions = vec![Action::Respond {
            dest: meta.source,
            message_id: ack_id,
            in_reply_to: meta.message_id,
            code: MeshCode::Changed,
        }];
        // The report is acknowledged before any follow-up request goes out,
        // keeping each exchange strictly request/response paired.
        if peer_state.can_serve() && !self.uploading {
            self.uploading = true;
            let message_id = self.next_id();
            self.pending = Some(PendingOffer {
                peer: meta.source,
                message_id,
            });
            info!("Offering our measurement to {}", meta.source);
            actions.push(Action::Request {
                dest: meta.source,
                message_id,
                command: MeterCommand::UploadMeasurement,
            });
        }
        actions
    }

    fn on_upload_measurement(&mut self, meta: FrameMeta, device_state: DeviceState) -> Vec<Action> {
        let message_id = self.next_id();
        if device_state.can_serve() {
            info!("Accepting measurement upload from {}", meta.source);
            vec![
                Action::BeginReceive { peer: meta.source },
                Action::Respond {
                    dest: meta.source,
                    message_id,
                    in_reply_to: meta.message_id,
                    code: MeshCode::Changed,
                },
            ]
        } else {
            info!(
                "Rejecting measurement upload from {}; modem is {}",
                meta.source, device_state
            );
            vec![Action::Respond {
                dest: meta.source,
                message_id,
                in_reply_to: meta.message_id,
                code: MeshCode::ServiceUnavailable,
            }]
        }
    }

    /// Process one inbound response. Only the verdict on our pending upload
    /// offer matters here; acknowledgements of state reports carry no
    /// follow-up and are merely logged.
    pub fn on_response(&mut self, meta: FrameMeta, in_reply_to: u16, code: MeshCode) -> Vec<Action> {
        let Some(pending) = &self.pending else {
            debug!("Response {:?} from {} with nothing pending", code, meta.source);
            return Vec::new();
        };
        if pending.message_id != in_reply_to || pending.peer != meta.source {
            debug!(
                "Response {:?} from {} does not match the pending offer",
                code, meta.source
            );
            return Vec::new();
        }
        let peer = pending.peer;
        self.pending = None;
        match code {
            MeshCode::Changed => {
                info!("Peer {} accepted our measurement; starting transfer", peer);
                vec![Action::BeginSend { peer }]
            }
            MeshCode::ServiceUnavailable => {
                info!("Peer {} is busy; waiting for the next round", peer);
                self.uploading = false;
                Vec::new()
            }
        }
    }

    /// The peer never answered the offer with this message id. Returns true
    /// if the offer was still outstanding, false for a stale timer.
    pub fn on_offer_timeout(&mut self, message_id: u16) -> bool {
        match &self.pending {
            Some(pending) if pending.message_id == message_id => {
                warn!(
                    "Peer {} never answered our upload offer; giving up this round",
                    pending.peer
                );
                self.pending = None;
                self.uploading = false;
                true
            }
            _ => false,
        }
    }

    /// Local upload trigger (timer or operator). `device_state` decides the
    /// route: an idle local modem takes the measurement directly, an absent
    /// one is searched for on the mesh.
    pub fn trigger_upload(&mut self, device_state: DeviceState) -> Vec<Action> {
        if self.uploading {
            debug!("Upload round already in progress; trigger ignored");
            return Vec::new();
        }
        match device_state {
            DeviceState::Idle => {
                info!("Own modem is idle; pushing measurement locally");
                self.uploading = true;
                vec![Action::BeginLocalPush]
            }
            DeviceState::Busy => {
                info!("Own modem is busy; skipping this round");
                Vec::new()
            }
            DeviceState::Off | DeviceState::Unknown => {
                info!("Own modem is {}; probing the mesh for one", device_state);
                let message_id = self.next_id();
                vec![Action::Request {
                    dest: NodeAddr::BROADCAST,
                    message_id,
                    command: MeterCommand::Discover,
                }]
            }
        }
    }

    /// Send a discover probe regardless of our own modem state.
    pub fn trigger_discovery(&mut self) -> Vec<Action> {
        info!("Sending discover probe");
        let message_id = self.next_id();
        vec![Action::Request {
            dest: NodeAddr::BROADCAST,
            message_id,
            command: MeterCommand::Discover,
        }]
    }

    /// The round this node was uploading in has terminated, successfully or
    /// not. Clears the intent flag so the next trigger or idle report can
    /// start a fresh round.
    pub fn upload_finished(&mut self) {
        self.uploading = false;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: NodeAddr = NodeAddr(0x0000_00aa);
    const PEER: NodeAddr = NodeAddr(0x0000_00bb);
    const OTHER: NodeAddr = NodeAddr(0x0000_00cc);

    fn meta(source: NodeAddr, message_id: u16) -> FrameMeta {
        FrameMeta { source, message_id }
    }

    fn offer_id(actions: &[Action]) -> u16 {
        actions
            .iter()
            .find_map(|a| match a {
                Action::Request {
                    message_id,
                    command: MeterCommand::UploadMeasurement,
                    ..
                } => Some(*message_id),
                _ => None,
            })
            .expect("no upload offer in actions")
    }

    #[test]
    fn discover_reports_own_state_when_usable() {
        let mut neg = Negotiator::new(LOCAL);

        let actions = neg.on_request(meta(PEER, 1), MeterCommand::Discover, DeviceState::Idle);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            Action::Request {
                dest: PEER,
                command: MeterCommand::ReportState(DeviceState::Idle),
                ..
            }
        ));

        let actions = neg.on_request(meta(PEER, 2), MeterCommand::Discover, DeviceState::Busy);
        assert!(matches!(
            actions[0],
            Action::Request {
                command: MeterCommand::ReportState(DeviceState::Busy),
                ..
            }
        ));
    }

    #[test]
    fn discover_ignored_without_a_modem() {
        let mut neg = Negotiator::new(LOCAL);
        assert!(neg
            .on_request(meta(PEER, 1), MeterCommand::Discover, DeviceState::Off)
            .is_empty());
        assert!(neg
            .on_request(meta(PEER, 2), MeterCommand::Discover, DeviceState::Unknown)
            .is_empty());
    }

    #[test]
    fn own_echo_is_dropped_without_consuming_the_id() {
        let mut neg = Negotiator::new(LOCAL);

        let actions = neg.on_request(meta(LOCAL, 7), MeterCommand::Discover, DeviceState::Idle);
        assert!(actions.is_empty());

        // The echoed id was not recorded, so a genuine request reusing it
        // still goes through.
        let actions = neg.on_request(meta(PEER, 7), MeterCommand::Discover, DeviceState::Idle);
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn duplicate_request_id_is_suppressed() {
        let mut neg = Negotiator::new(LOCAL);

        let first = neg.on_request(meta(PEER, 42), MeterCommand::Discover, DeviceState::Idle);
        assert_eq!(first.len(), 1);

        let second = neg.on_request(meta(PEER, 42), MeterCommand::Discover, DeviceState::Idle);
        assert!(second.is_empty());

        // A different id from the same peer is fresh again.
        let third = neg.on_request(meta(PEER, 43), MeterCommand::Discover, DeviceState::Idle);
        assert_eq!(third.len(), 1);
    }

    #[test]
    fn idle_report_is_acked_before_the_offer() {
        let mut neg = Negotiator::new(LOCAL);

        let actions = neg.on_request(
            meta(PEER, 5),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        assert_eq!(actions.len(), 2);
        assert!(matches!(
            actions[0],
            Action::Respond {
                dest: PEER,
                in_reply_to: 5,
                code: MeshCode::Changed,
                ..
            }
        ));
        assert!(matches!(
            actions[1],
            Action::Request {
                dest: PEER,
                command: MeterCommand::UploadMeasurement,
                ..
            }
        ));
        assert!(neg.uploading());
    }

    #[test]
    fn busy_report_is_only_acked() {
        let mut neg = Negotiator::new(LOCAL);

        let actions = neg.on_request(
            meta(PEER, 5),
            MeterCommand::ReportState(DeviceState::Busy),
            DeviceState::Off,
        );
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            Action::Respond {
                code: MeshCode::Changed,
                ..
            }
        ));
        assert!(!neg.uploading());
    }

    #[test]
    fn only_one_offer_at_a_time() {
        let mut neg = Negotiator::new(LOCAL);

        let first = neg.on_request(
            meta(PEER, 5),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        assert_eq!(first.len(), 2);

        // A second idle report, from anyone, is acknowledged but gets no
        // competing offer while the first round is still ours.
        let second = neg.on_request(
            meta(OTHER, 6),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        assert_eq!(second.len(), 1);
        assert!(matches!(second[0], Action::Respond { .. }));
    }

    #[test]
    fn accepted_offer_starts_the_send() {
        let mut neg = Negotiator::new(LOCAL);
        let actions = neg.on_request(
            meta(PEER, 5),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        let id = offer_id(&actions);

        let follow_up = neg.on_response(meta(PEER, 90), id, MeshCode::Changed);
        assert_eq!(follow_up, vec![Action::BeginSend { peer: PEER }]);
        assert!(neg.uploading());
    }

    #[test]
    fn rejected_offer_clears_the_intent() {
        let mut neg = Negotiator::new(LOCAL);
        let actions = neg.on_request(
            meta(PEER, 5),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        let id = offer_id(&actions);

        let follow_up = neg.on_response(meta(PEER, 90), id, MeshCode::ServiceUnavailable);
        assert!(follow_up.is_empty());
        assert!(!neg.uploading());

        // The next idle report can start a fresh round.
        let retry = neg.on_request(
            meta(OTHER, 6),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        assert_eq!(retry.len(), 2);
    }

    #[test]
    fn mismatched_responses_are_ignored() {
        let mut neg = Negotiator::new(LOCAL);
        let actions = neg.on_request(
            meta(PEER, 5),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        let id = offer_id(&actions);

        // Wrong reply id, then right id from the wrong node.
        assert!(neg
            .on_response(meta(PEER, 90), id.wrapping_add(1), MeshCode::Changed)
            .is_empty());
        assert!(neg
            .on_response(meta(OTHER, 91), id, MeshCode::Changed)
            .is_empty());

        // The genuine verdict still resolves the offer.
        let follow_up = neg.on_response(meta(PEER, 92), id, MeshCode::Changed);
        assert_eq!(follow_up, vec![Action::BeginSend { peer: PEER }]);
    }

    #[test]
    fn upload_request_accepted_only_when_idle() {
        let mut neg = Negotiator::new(LOCAL);

        let accepted = neg.on_request(
            meta(PEER, 1),
            MeterCommand::UploadMeasurement,
            DeviceState::Idle,
        );
        assert_eq!(accepted.len(), 2);
        assert_eq!(accepted[0], Action::BeginReceive { peer: PEER });
        assert!(matches!(
            accepted[1],
            Action::Respond {
                code: MeshCode::Changed,
                ..
            }
        ));

        for state in [DeviceState::Busy, DeviceState::Off, DeviceState::Unknown] {
            let mut neg = Negotiator::new(LOCAL);
            let rejected = neg.on_request(meta(PEER, 1), MeterCommand::UploadMeasurement, state);
            assert_eq!(rejected.len(), 1, "state {state} should reject");
            assert!(matches!(
                rejected[0],
                Action::Respond {
                    code: MeshCode::ServiceUnavailable,
                    ..
                }
            ));
        }
    }

    #[test]
    fn trigger_routes_by_own_modem_state() {
        let mut neg = Negotiator::new(LOCAL);
        assert_eq!(
            neg.trigger_upload(DeviceState::Idle),
            vec![Action::BeginLocalPush]
        );
        assert!(neg.uploading());
        // A second trigger during the round is a no-op.
        assert!(neg.trigger_upload(DeviceState::Idle).is_empty());

        let mut neg = Negotiator::new(LOCAL);
        assert!(neg.trigger_upload(DeviceState::Busy).is_empty());
        assert!(!neg.uploading());

        let mut neg = Negotiator::new(LOCAL);
        let actions = neg.trigger_upload(DeviceState::Off);
        assert_eq!(actions.len(), 1);
        assert!(matches!(
            actions[0],
            Action::Request {
                dest: NodeAddr::BROADCAST,
                command: MeterCommand::Discover,
                ..
            }
        ));
        // Probing alone does not commit us to a round.
        assert!(!neg.uploading());
    }

    #[test]
    fn offer_timeout_clears_the_intent() {
        let mut neg = Negotiator::new(LOCAL);
        let actions = neg.on_request(
            meta(PEER, 5),
            MeterCommand::ReportState(DeviceState::Idle),
            DeviceState::Off,
        );
        let id = offer_id(&actions);

        assert!(!neg.on_offer_timeout(id.wrapping_add(1)), "stale timer");
        assert!(neg.uploading());

        assert!(neg.on_offer_timeout(id));
        assert!(!neg.uploading());
        assert!(!neg.on_offer_timeout(id), "second firing is stale");
    }

    #[test]
    fn finished_round_allows_the_next_one() {
        let mut neg = Negotiator::new(LOCAL);
        neg.trigger_upload(DeviceState::Idle);
        assert!(neg.uploading());

        neg.upload_finished();
        assert!(!neg.uploading());
        assert_eq!(
            neg.trigger_upload(DeviceState::Idle),
            vec![Action::BeginLocalPush]
        );
    }
}
