//! Per-connection handshake state machine
//!
//! ```text
//! Uninitialized ──connect──▶ Connected ──handshake──▶ HandShaking ──ack──▶ Ready
//!                                  any non-terminal state ──▶ Lost | Disconnected | Error
//! ```
//!
//! The same machine runs on both ends. The *server* role is the proxy side of
//! a client connection; the *client* role is what a GUI runs (and what the
//! tests use to drive the proxy).

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use qc_protocol::HandShake;

/// Identifies one accepted client for the lifetime of the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connected,
    HandShaking,
    Ready,
    /// The transport failed while reading
    Lost,
    Disconnected,
    /// Protocol failure
    Error,
}

impl ConnectionState {
    /// `Lost`, `Disconnected` and `Error` are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Lost | Self::Disconnected | Self::Error)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Connected => "connected",
            Self::HandShaking => "handshaking",
            Self::Ready => "ready",
            Self::Lost => "lost",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Which end of the handshake this connection plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

#[derive(Debug, Clone)]
pub struct Connection {
    role: Role,
    state: ConnectionState,
    local_identity: BTreeMap<String, String>,
    peer_identity: BTreeMap<String, String>,
}

impl Connection {
    pub fn new(role: Role, local_identity: BTreeMap<String, String>) -> Self {
        Self {
            role,
            state: ConnectionState::Uninitialized,
            local_identity,
            peer_identity: BTreeMap::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identity received from the peer during the handshake
    pub fn peer_identity(&self) -> &BTreeMap<String, String> {
        &self.peer_identity
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_identity.get("id").map(String::as_str)
    }

    pub fn is_ready(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::HandShaking | ConnectionState::Ready
        )
    }

    /// Transport established; returns whether the state changed
    pub fn connect(&mut self) -> bool {
        if self.state != ConnectionState::Uninitialized {
            warn!(state = %self.state, "Connect on an already used connection ignored");
            return false;
        }
        self.transition(ConnectionState::Connected);
        true
    }

    /// Start (or restart) the handshake
    ///
    /// Only valid from `Connected` or `Ready`; returns the info handshake to send.
    pub fn send_handshake(&mut self) -> Option<HandShake> {
        match self.state {
            ConnectionState::Connected | ConnectionState::Ready => {
                self.transition(ConnectionState::HandShaking);
                Some(HandShake::with_info(self.local_identity.clone()))
            }
            state => {
                warn!(%state, "Cannot start a handshake in this state");
                None
            }
        }
    }

    /// Apply a received handshake and return the reply to send, if any
    pub fn on_handshake(&mut self, handshake: &HandShake) -> Option<HandShake> {
        if !self.is_connected() {
            warn!(state = %self.state, "Handshake on a connection that is not connected ignored");
            return None;
        }

        match (self.role, self.state) {
            (Role::Server, ConnectionState::HandShaking) => {
                if handshake.ack {
                    self.transition(ConnectionState::Ready);
                } else {
                    warn!("Handshake without acknowledgment while handshaking");
                }
                None
            }
            (Role::Server, _) => {
                if !handshake.is_info() {
                    warn!("Handshake without peer identity ignored");
                    return None;
                }
                self.peer_identity = handshake.info.clone();
                self.transition(ConnectionState::HandShaking);
                Some(HandShake::info_ack(self.local_identity.clone()))
            }
            (Role::Client, ConnectionState::HandShaking) => {
                if !handshake.is_info() {
                    warn!("Handshake reply without peer identity ignored");
                    return None;
                }
                self.peer_identity = handshake.info.clone();
                self.transition(ConnectionState::Ready);
                Some(HandShake::ack())
            }
            (Role::Client, state) => {
                warn!(%state, "Unsolicited handshake ignored");
                None
            }
        }
    }

    /// Transport closed; idempotent
    pub fn disconnect(&mut self) -> bool {
        self.terminate(ConnectionState::Disconnected)
    }

    /// Transport read failure
    pub fn lose(&mut self) -> bool {
        self.terminate(ConnectionState::Lost)
    }

    /// Protocol failure
    pub fn fail(&mut self) -> bool {
        self.terminate(ConnectionState::Error)
    }

    fn terminate(&mut self, state: ConnectionState) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.transition(state);
        true
    }

    fn transition(&mut self, state: ConnectionState) {
        debug!(role = ?self.role, from = %self.state, to = %state, "Connection state changed");
        self.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn identity(id: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("id".to_string(), id.to_string())])
    }

    fn connected(role: Role, id: &str) -> Connection {
        let mut connection = Connection::new(role, identity(id));
        assert!(connection.connect());
        connection
    }

    #[test]
    fn test_full_handshake_scenario() {
        let mut client = connected(Role::Client, "gui");
        let mut server = connected(Role::Server, "qcProxy");

        let hello = client.send_handshake().unwrap();
        assert_eq!(client.state(), ConnectionState::HandShaking);
        assert!(hello.is_info() && !hello.ack);

        let reply = server.on_handshake(&hello).unwrap();
        assert_eq!(server.state(), ConnectionState::HandShaking);
        assert_eq!(server.peer_id(), Some("gui"));
        assert!(reply.ack && reply.is_info());

        let ack = client.on_handshake(&reply).unwrap();
        assert!(client.is_ready());
        assert_eq!(client.peer_id(), Some("qcProxy"));
        assert_eq!(ack, HandShake::ack());

        assert!(server.on_handshake(&ack).is_none());
        assert!(server.is_ready());
    }

    #[test]
    fn test_server_stays_without_ack() {
        let mut server = connected(Role::Server, "qcProxy");
        server.on_handshake(&HandShake::with_info(identity("gui")));

        assert!(server.on_handshake(&HandShake::with_info(identity("gui"))).is_none());
        assert_eq!(server.state(), ConnectionState::HandShaking);
    }

    #[test]
    fn test_ready_server_accepts_rehandshake() {
        let mut server = connected(Role::Server, "qcProxy");
        server.on_handshake(&HandShake::with_info(identity("gui")));
        server.on_handshake(&HandShake::ack());
        assert!(server.is_ready());

        let reply = server.on_handshake(&HandShake::with_info(identity("gui2")));
        assert!(reply.is_some());
        assert_eq!(server.state(), ConnectionState::HandShaking);
        assert_eq!(server.peer_id(), Some("gui2"));
    }

    #[test]
    fn test_client_ignores_unsolicited_handshake() {
        let mut client = connected(Role::Client, "gui");
        assert!(client
            .on_handshake(&HandShake::info_ack(identity("qcProxy")))
            .is_none());
        assert_eq!(client.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_handshake_before_connect_is_ignored() {
        let mut server = Connection::new(Role::Server, identity("qcProxy"));
        assert!(server.on_handshake(&HandShake::with_info(identity("gui"))).is_none());
        assert!(server.send_handshake().is_none());
        assert_eq!(server.state(), ConnectionState::Uninitialized);
    }

    #[rstest]
    #[case::disconnect(Connection::disconnect as fn(&mut Connection) -> bool, ConnectionState::Disconnected)]
    #[case::lose(Connection::lose as fn(&mut Connection) -> bool, ConnectionState::Lost)]
    #[case::fail(Connection::fail as fn(&mut Connection) -> bool, ConnectionState::Error)]
    fn test_terminal_transitions(
        #[case] terminate: fn(&mut Connection) -> bool,
        #[case] expected: ConnectionState,
    ) {
        let mut connection = connected(Role::Server, "qcProxy");
        assert!(terminate(&mut connection));
        assert_eq!(connection.state(), expected);
        assert!(!connection.is_connected());

        // Terminal states never change again
        assert!(!connection.disconnect());
        assert!(!connection.fail());
        assert_eq!(connection.state(), expected);
    }

    #[test]
    fn test_connect_twice() {
        let mut connection = connected(Role::Client, "gui");
        assert!(!connection.connect());
        assert_eq!(connection.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_client_id_display() {
        assert_eq!(ClientId(7).to_string(), "client-7");
    }
}
