//! The replication session state machine.
//!
//! [`step`] maps `(role, phase, input)` to the next phase and the side
//! effects the session driver must perform. It does no I/O, so every
//! ordering rule of the protocol can be tested directly.
//!
//! ```text
//! Disconnected -> Connecting -> Authenticated -> Syncing <-> Idle
//!                                                   |          |
//!                                                   v          v
//!                                             Disconnecting -> Disconnected
//! ```

use crate::error::ReplicationError;
use crate::message::MessageType;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Opens the connection and sends `Connect`.
    Initiator,
    /// Accepts connections and authenticates them.
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Disconnected,
    Connecting,
    Authenticated,
    /// An outbound window is in flight.
    Syncing,
    Idle,
    /// Draining the current window before disconnecting.
    Disconnecting,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticated => "authenticated",
            Self::Syncing => "syncing",
            Self::Idle => "idle",
            Self::Disconnecting => "disconnecting",
        }
    }

    /// Past the handshake and still open.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            Self::Authenticated | Self::Syncing | Self::Idle | Self::Disconnecting
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    ConnectRequested,
    Received(MessageType),
    AuthSucceeded,
    AuthFailed(String),
    SyncRequested,
    /// The outbound window had nothing to send.
    WindowEmpty,
    AckTimedOut,
    RetriesExhausted,
    DisconnectRequested,
    DisconnectNow,
    TransportFailed(String),
    Malformed(String),
    /// A local failure (storage) that ends the session.
    Faulted(ReplicationError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    SendConnect,
    Authenticate,
    SendConnectAck,
    SendError(ReplicationError),
    ApplyConnectAck,
    NotifyConnected,
    StartWindow,
    /// Remember to start another window once the current one commits.
    DeferSync,
    SendNextChunk,
    ResendChunk,
    CommitWindow,
    ApplyFeed,
    CloseInboundWindow,
    SendDisconnect,
    CloseTransport,
    NotifyStopped,
    Fail(ReplicationError),
    /// Surface the `Error` message just received.
    RaiseRemote,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: Phase,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: Phase, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(phase: Phase, effects: Vec<Effect>) -> Self {
        Self {
            next: phase,
            effects,
        }
    }

    fn abort(error: ReplicationError) -> Self {
        Self::to(
            Phase::Disconnected,
            vec![
                Effect::SendError(error.clone()),
                Effect::CloseTransport,
                Effect::Fail(error),
            ],
        )
    }
}

/// Compute the transition for `input` in `phase`.
pub fn step(role: Role, phase: Phase, input: &Input) -> Transition {
    use Effect::*;
    use Phase::*;

    match input {
        // ----- forced exits, valid everywhere -----
        Input::DisconnectNow => {
            if phase == Disconnected {
                Transition::stay(Disconnected, vec![CloseTransport])
            } else {
                Transition::to(Disconnected, vec![CloseTransport, NotifyStopped])
            }
        }
        Input::TransportFailed(reason) => Transition::to(
            Disconnected,
            vec![
                CloseTransport,
                Fail(ReplicationError::Transport(reason.clone())),
            ],
        ),
        Input::Malformed(reason) => {
            Transition::abort(ReplicationError::Malformed(reason.clone()))
        }
        Input::Faulted(error) => Transition::abort(error.clone()),
        Input::RetriesExhausted => Transition::to(
            Disconnected,
            vec![
                CloseTransport,
                Fail(ReplicationError::Timeout(
                    "batch acknowledgement retries exhausted".into(),
                )),
            ],
        ),

        // ----- handshake -----
        Input::ConnectRequested => match (role, phase) {
            (Role::Initiator, Disconnected) => Transition::to(Connecting, vec![SendConnect]),
            _ => Transition::stay(
                phase,
                vec![Fail(ReplicationError::InvalidState(format!(
                    "cannot connect while {}",
                    phase
                )))],
            ),
        },
        Input::AuthSucceeded => match (role, phase) {
            (Role::Acceptor, Connecting) => {
                Transition::to(Authenticated, vec![SendConnectAck, NotifyConnected])
            }
            _ => Transition::abort(ReplicationError::Protocol(
                "unexpected authentication result".into(),
            )),
        },
        Input::AuthFailed(reason) => {
            Transition::abort(ReplicationError::Unauthorized(reason.clone()))
        }

        // ----- outbound windows -----
        Input::SyncRequested => match phase {
            Authenticated | Idle => Transition::to(Syncing, vec![StartWindow]),
            Syncing => Transition::stay(Syncing, vec![DeferSync]),
            _ => Transition::stay(phase, vec![]),
        },
        Input::WindowEmpty => match phase {
            Syncing => Transition::to(Idle, vec![CommitWindow]),
            Disconnecting => Transition::to(
                Disconnected,
                vec![CommitWindow, SendDisconnect, CloseTransport, NotifyStopped],
            ),
            _ => Transition::stay(phase, vec![]),
        },
        Input::AckTimedOut => match phase {
            Connecting => Transition::to(
                Disconnected,
                vec![
                    CloseTransport,
                    Fail(ReplicationError::Timeout("no reply to connect".into())),
                ],
            ),
            Syncing | Disconnecting => Transition::stay(phase, vec![ResendChunk]),
            _ => Transition::stay(phase, vec![]),
        },

        // ----- disconnect -----
        Input::DisconnectRequested => match phase {
            Disconnected => Transition::stay(Disconnected, vec![CloseTransport]),
            Disconnecting => Transition::stay(Disconnecting, vec![]),
            Connecting => Transition::to(Disconnected, vec![CloseTransport, NotifyStopped]),
            Syncing => Transition::to(Disconnecting, vec![]),
            Authenticated | Idle => Transition::to(
                Disconnected,
                vec![SendDisconnect, CloseTransport, NotifyStopped],
            ),
        },

        Input::Received(message_type) => received(role, phase, *message_type),
    }
}

fn received(role: Role, phase: Phase, message_type: MessageType) -> Transition {
    use Effect::*;
    use Phase::*;

    match message_type {
        MessageType::Error => Transition::to(Disconnected, vec![CloseTransport, RaiseRemote]),
        MessageType::Disconnect => {
            Transition::to(Disconnected, vec![CloseTransport, NotifyStopped])
        }

        MessageType::Connect => match (role, phase) {
            (Role::Acceptor, Disconnected) => Transition::to(Connecting, vec![Authenticate]),
            _ => Transition::abort(ReplicationError::Protocol(format!(
                "unexpected connect while {}",
                phase
            ))),
        },
        MessageType::ConnectAck => match (role, phase) {
            (Role::Initiator, Connecting) => {
                Transition::to(Authenticated, vec![ApplyConnectAck, NotifyConnected])
            }
            _ if !phase.is_connected() => unauthorized(message_type),
            _ => Transition::abort(ReplicationError::Protocol(format!(
                "unexpected connect ack while {}",
                phase
            ))),
        },

        // Anything else needs an authenticated session.
        _ if !phase.is_connected() => unauthorized(message_type),

        MessageType::BatchChangeStart | MessageType::BatchChangeContinue => {
            Transition::stay(phase, vec![ApplyFeed])
        }
        MessageType::BatchChangeEnd => Transition::stay(phase, vec![CloseInboundWindow]),

        MessageType::BatchAck => match phase {
            Syncing | Disconnecting => Transition::stay(phase, vec![SendNextChunk]),
            // Duplicate ack for a window already committed.
            _ => Transition::stay(phase, vec![]),
        },
        MessageType::BatchEndAck => match phase {
            Syncing => Transition::to(Idle, vec![CommitWindow]),
            Disconnecting => Transition::to(
                Disconnected,
                vec![CommitWindow, SendDisconnect, CloseTransport, NotifyStopped],
            ),
            _ => Transition::stay(phase, vec![]),
        },
    }
}

fn unauthorized(message_type: MessageType) -> Transition {
    Transition::abort(ReplicationError::Unauthorized(format!(
        "{} received before connect",
        message_type
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use Effect::*;
    use Phase::*;

    fn recv(t: MessageType) -> Input {
        Input::Received(t)
    }

    #[test]
    fn test_initiator_handshake() {
        let t = step(Role::Initiator, Disconnected, &Input::ConnectRequested);
        assert_eq!(t.next, Connecting);
        assert_eq!(t.effects, vec![SendConnect]);

        let t = step(Role::Initiator, Connecting, &recv(MessageType::ConnectAck));
        assert_eq!(t.next, Authenticated);
        assert_eq!(t.effects, vec![ApplyConnectAck, NotifyConnected]);
    }

    #[test]
    fn test_acceptor_handshake() {
        let t = step(Role::Acceptor, Disconnected, &recv(MessageType::Connect));
        assert_eq!(t.next, Connecting);
        assert_eq!(t.effects, vec![Authenticate]);

        let t = step(Role::Acceptor, Connecting, &Input::AuthSucceeded);
        assert_eq!(t.next, Authenticated);
        assert_eq!(t.effects, vec![SendConnectAck, NotifyConnected]);
    }

    #[test]
    fn test_auth_failure_tears_down() {
        let t = step(Role::Acceptor, Connecting, &Input::AuthFailed("bad".into()));
        assert_eq!(t.next, Disconnected);
        assert!(t.effects.contains(&CloseTransport));
        assert!(matches!(
            t.effects.last(),
            Some(Fail(ReplicationError::Unauthorized(_)))
        ));
    }

    #[test]
    fn test_message_before_connect_is_unauthorized() {
        for t in [
            MessageType::BatchChangeStart,
            MessageType::BatchAck,
            MessageType::BatchChangeEnd,
        ] {
            let tr = step(Role::Acceptor, Disconnected, &recv(t));
            assert_eq!(tr.next, Disconnected);
            assert!(matches!(
                &tr.effects[0],
                SendError(ReplicationError::Unauthorized(_))
            ));
        }
        let tr = step(Role::Acceptor, Connecting, &recv(MessageType::BatchChangeStart));
        assert!(matches!(
            &tr.effects[0],
            SendError(ReplicationError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_outbound_window_cycle() {
        let t = step(Role::Initiator, Authenticated, &Input::SyncRequested);
        assert_eq!((t.next, t.effects), (Syncing, vec![StartWindow]));

        let t = step(Role::Initiator, Syncing, &recv(MessageType::BatchAck));
        assert_eq!((t.next, t.effects), (Syncing, vec![SendNextChunk]));

        let t = step(Role::Initiator, Syncing, &Input::SyncRequested);
        assert_eq!((t.next, t.effects), (Syncing, vec![DeferSync]));

        let t = step(Role::Initiator, Syncing, &recv(MessageType::BatchEndAck));
        assert_eq!((t.next, t.effects), (Idle, vec![CommitWindow]));

        let t = step(Role::Initiator, Idle, &Input::SyncRequested);
        assert_eq!(t.next, Syncing);

        let t = step(Role::Initiator, Syncing, &Input::WindowEmpty);
        assert_eq!((t.next, t.effects), (Idle, vec![CommitWindow]));
    }

    #[test]
    fn test_inbound_batches_do_not_change_phase() {
        for phase in [Authenticated, Syncing, Idle, Disconnecting] {
            let t = step(Role::Acceptor, phase, &recv(MessageType::BatchChangeStart));
            assert_eq!((t.next, t.effects), (phase, vec![ApplyFeed]));
            let t = step(Role::Acceptor, phase, &recv(MessageType::BatchChangeEnd));
            assert_eq!((t.next, t.effects), (phase, vec![CloseInboundWindow]));
        }
    }

    #[test]
    fn test_timeouts() {
        let t = step(Role::Initiator, Syncing, &Input::AckTimedOut);
        assert_eq!((t.next, t.effects), (Syncing, vec![ResendChunk]));

        let t = step(Role::Initiator, Syncing, &Input::RetriesExhausted);
        assert_eq!(t.next, Disconnected);
        assert!(matches!(
            t.effects.last(),
            Some(Fail(ReplicationError::Timeout(_)))
        ));

        let t = step(Role::Initiator, Connecting, &Input::AckTimedOut);
        assert_eq!(t.next, Disconnected);
    }

    #[test]
    fn test_graceful_disconnect_drains_window() {
        let t = step(Role::Initiator, Syncing, &Input::DisconnectRequested);
        assert_eq!((t.next, t.effects), (Disconnecting, vec![]));

        let t = step(Role::Initiator, Disconnecting, &Input::SyncRequested);
        assert!(t.effects.is_empty());

        let t = step(Role::Initiator, Disconnecting, &recv(MessageType::BatchEndAck));
        assert_eq!(t.next, Disconnected);
        assert_eq!(
            t.effects,
            vec![CommitWindow, SendDisconnect, CloseTransport, NotifyStopped]
        );

        let t = step(Role::Initiator, Idle, &Input::DisconnectRequested);
        assert_eq!(t.next, Disconnected);
        assert_eq!(t.effects, vec![SendDisconnect, CloseTransport, NotifyStopped]);
    }

    #[test]
    fn test_disconnect_now_from_any_phase() {
        for phase in [Connecting, Authenticated, Syncing, Idle, Disconnecting] {
            let t = step(Role::Initiator, phase, &Input::DisconnectNow);
            assert_eq!(t.next, Disconnected);
            assert_eq!(t.effects, vec![CloseTransport, NotifyStopped]);
        }
    }

    #[test]
    fn test_remote_error_and_transport_failure() {
        let t = step(Role::Initiator, Idle, &recv(MessageType::Error));
        assert_eq!((t.next, t.effects), (Disconnected, vec![CloseTransport, RaiseRemote]));

        let t = step(Role::Initiator, Syncing, &Input::TransportFailed("eof".into()));
        assert_eq!(t.next, Disconnected);
        assert!(matches!(
            t.effects.last(),
            Some(Fail(ReplicationError::Transport(_)))
        ));

        let t = step(Role::Acceptor, Idle, &Input::Malformed("bad frame".into()));
        assert!(matches!(
            &t.effects[0],
            SendError(ReplicationError::Malformed(_))
        ));
    }

    #[test]
    fn test_stray_acks_are_ignored_when_idle() {
        let t = step(Role::Initiator, Idle, &recv(MessageType::BatchAck));
        assert_eq!((t.next, t.effects), (Idle, vec![]));
        let t = step(Role::Initiator, Idle, &recv(MessageType::BatchEndAck));
        assert_eq!((t.next, t.effects), (Idle, vec![]));
    }

    #[test]
    fn test_second_connect_is_protocol_error() {
        let t = step(Role::Acceptor, Idle, &recv(MessageType::Connect));
        assert_eq!(t.next, Disconnected);
        assert!(matches!(
            &t.effects[0],
            SendError(ReplicationError::Protocol(_))
        ));
    }
}
