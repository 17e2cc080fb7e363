//! Forwarding rules between the two halves of a pairing.
//!
//! Every event names its counterpart. A host's `shell/data` goes to the viewer
//! in `clientId`. A viewer's `shell/create` or `shell/data` goes to the host
//! in `instanceId`. The frame is forwarded exactly as received. With no live
//! counterpart the frame is dropped: nobody is listening right now.
//!
//! A closing connection removes its identifier unconditionally. When a host
//! reconnects before its old socket is torn down, the old socket's close
//! unregisters the new connection too, and the host stays unreachable until
//! it reconnects again. Connection serials make the race visible in the logs.

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::classify::{Peer, Role};
use super::registry::Registry;
use crate::connection::{ConnectionHandle, Frame};
use crate::event::{DecodeError, Event};

/// What happened to one inbound frame
#[derive(Debug)]
pub enum Delivery {
    Forwarded,
    /// The frame was not a recognized event.
    Undecodable(DecodeError),
    /// A recognized event that this role does not send, such as a host's `shell/create`.
    Ignored(&'static str),
    NoCounterpart,
    /// The counterpart was found but did not accept the frame.
    CounterpartUnavailable,
}

pub struct Relay {
    registry: Arc<Registry>,
}

impl Relay {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Registers a freshly classified connection under its identifier.
    pub fn join(&self, peer: &Peer, handle: ConnectionHandle) {
        let serial = handle.serial();
        if let Some(previous) = self.registry.register(peer.role, &peer.id, handle) {
            info!(
                "Replaced {} connection {} for {} with connection {}",
                peer.role,
                previous.serial(),
                peer.id,
                serial
            );
        }
        info!(
            "{} connected: {} (hosts: {}, viewers: {})",
            peer.role,
            peer.id,
            self.registry.len(Role::Host),
            self.registry.len(Role::Viewer)
        );
    }

    /// Drops the registry entry for a closed connection. Safe to repeat.
    ///
    /// The entry goes even if it now belongs to a newer connection.
    pub fn leave(&self, peer: &Peer, handle: &ConnectionHandle) {
        if let Some(current) = self.registry.lookup(peer.role, &peer.id) {
            if !current.same_connection(handle) {
                warn!(
                    "Closing {} connection {} for {} also unregisters connection {}",
                    peer.role,
                    handle.serial(),
                    peer.id,
                    current.serial()
                );
            }
        }
        self.registry.remove(peer.role, &peer.id);
        let lifetime = Utc::now().signed_duration_since(handle.connected_at());
        info!(
            "{} disconnected: {} after {}s",
            peer.role,
            peer.id,
            lifetime.num_seconds()
        );
    }

    /// Routes one text frame received from a connection of role `from`.
    pub fn route(&self, from: Role, raw: &str) -> Delivery {
        let event = match Event::decode(raw.as_bytes()) {
            Ok(event) => event,
            Err(e) => {
                debug!("Dropping frame from {}: {}", from, e);
                return Delivery::Undecodable(e);
            }
        };

        let (target_role, target_id) = match (from, &event) {
            (Role::Host, Event::ShellData { client_id, .. }) => (Role::Viewer, client_id.as_str()),
            (
                Role::Viewer,
                Event::ShellCreate { instance_id, .. } | Event::ShellData { instance_id, .. },
            ) => (Role::Host, instance_id.as_str()),
            (Role::Host, Event::ShellCreate { .. }) => {
                debug!("Ignoring {} sent by a host", event.kind());
                return Delivery::Ignored(event.kind());
            }
        };

        let Some(target) = self.registry.lookup(target_role, target_id) else {
            debug!(
                "No {} registered as {}, dropping {}",
                target_role,
                target_id,
                event.kind()
            );
            return Delivery::NoCounterpart;
        };

        if target.send(Frame::Text(raw.to_owned())) {
            Delivery::Forwarded
        } else {
            debug!("{} {} is not accepting frames", target_role, target_id);
            Delivery::CounterpartUnavailable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ReadyState;
    use tokio::sync::mpsc;

    fn peer(role: Role, id: &str) -> Peer {
        Peer {
            role,
            id: id.to_owned(),
            via_subprotocol: false,
        }
    }

    fn joined(relay: &Relay, role: Role, id: &str) -> (ConnectionHandle, mpsc::Receiver<Frame>) {
        let (handle, rx) = ConnectionHandle::open(16);
        relay.join(&peer(role, id), handle.clone());
        (handle, rx)
    }

    #[test]
    fn create_and_data_round_trip() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (_host, mut host_rx) = joined(&relay, Role::Host, "inst-1");
        let (_viewer, mut viewer_rx) = joined(&relay, Role::Viewer, "cli-1");

        let create = r#"{"type":"shell/create","instanceId":"inst-1"}"#;
        assert!(matches!(relay.route(Role::Viewer, create), Delivery::Forwarded));
        assert_eq!(host_rx.try_recv().unwrap(), Frame::Text(create.to_owned()));

        let data = r#"{"type":"shell/data","instanceId":"inst-1","clientId":"cli-1","data":"hello"}"#;
        assert!(matches!(relay.route(Role::Host, data), Delivery::Forwarded));
        let Frame::Text(received) = viewer_rx.try_recv().unwrap() else {
            panic!("expected a text frame");
        };
        assert_eq!(
            Event::decode(received.as_bytes()).unwrap(),
            Event::shell_data("inst-1", "cli-1", "hello")
        );

        assert!(host_rx.try_recv().is_err());
        assert!(viewer_rx.try_recv().is_err());
    }

    #[test]
    fn viewer_data_goes_to_named_host() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (_h1, mut rx1) = joined(&relay, Role::Host, "inst-1");
        let (_h2, mut rx2) = joined(&relay, Role::Host, "inst-2");

        let data = Event::shell_data("inst-2", "cli-1", "ls\r").encode();
        assert!(matches!(relay.route(Role::Viewer, &data), Delivery::Forwarded));
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap(), Frame::Text(data));
    }

    #[test]
    fn absent_counterpart_drops_silently() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (_host, mut host_rx) = joined(&relay, Role::Host, "inst-1");

        let data = Event::shell_data("inst-1", "nobody", "x").encode();
        assert!(matches!(relay.route(Role::Host, &data), Delivery::NoCounterpart));
        assert!(host_rx.try_recv().is_err());
        assert_eq!(relay.registry().len(Role::Viewer), 0);
        assert_eq!(relay.registry().len(Role::Host), 1);
    }

    #[test]
    fn host_cannot_create_shells() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (_viewer, mut viewer_rx) = joined(&relay, Role::Viewer, "cli-1");

        let create = Event::shell_create("inst-1", Some("cli-1".into())).encode();
        assert!(matches!(
            relay.route(Role::Host, &create),
            Delivery::Ignored("shell/create")
        ));
        assert!(viewer_rx.try_recv().is_err());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (_host, mut host_rx) = joined(&relay, Role::Host, "inst-1");

        for raw in ["{", "[]", r#"{"type":"shell/exec","instanceId":"inst-1"}"#] {
            assert!(matches!(
                relay.route(Role::Viewer, raw),
                Delivery::Undecodable(_)
            ));
        }
        assert!(host_rx.try_recv().is_err());
    }

    #[test]
    fn send_to_closing_counterpart_is_a_no_op() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (host, mut host_rx) = joined(&relay, Role::Host, "inst-1");
        host.set_state(ReadyState::Closing);

        let create = Event::shell_create("inst-1", None).encode();
        assert!(matches!(
            relay.route(Role::Viewer, &create),
            Delivery::CounterpartUnavailable
        ));
        assert!(host_rx.try_recv().is_err());
    }

    #[test]
    fn leave_twice_is_harmless() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (viewer, _rx) = joined(&relay, Role::Viewer, "cli-1");
        let (_other, _rx2) = joined(&relay, Role::Viewer, "cli-2");
        let who = peer(Role::Viewer, "cli-1");

        relay.leave(&who, &viewer);
        relay.leave(&who, &viewer);

        assert!(relay.registry().lookup(Role::Viewer, "cli-1").is_none());
        assert!(relay.registry().lookup(Role::Viewer, "cli-2").is_some());
    }

    #[test]
    fn stale_close_unregisters_the_replacement() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (old, _old_rx) = joined(&relay, Role::Host, "inst-1");
        let (new, _new_rx) = joined(&relay, Role::Host, "inst-1");
        assert!(
            relay
                .registry()
                .lookup(Role::Host, "inst-1")
                .unwrap()
                .same_connection(&new)
        );

        relay.leave(&peer(Role::Host, "inst-1"), &old);

        assert!(relay.registry().lookup(Role::Host, "inst-1").is_none());
        let (_viewer, _rx) = joined(&relay, Role::Viewer, "cli-1");
        assert!(matches!(
            relay.route(
                Role::Viewer,
                &Event::shell_create("inst-1", Some("cli-1".into())).encode()
            ),
            Delivery::NoCounterpart
        ));
    }

    #[test]
    fn never_registered_leave_is_harmless() {
        let relay = Relay::new(Arc::new(Registry::new()));
        let (stray, _rx) = ConnectionHandle::open(1);
        relay.leave(&peer(Role::Host, "ghost"), &stray);
        assert!(relay.registry().is_empty());
    }
}
