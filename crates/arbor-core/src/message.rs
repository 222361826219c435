//! Protocol messages
//!
//! Every message travels as one frame on an established connection. The
//! GHS messages (`Connect` through `ChangeCore`) are consumed only by the
//! engine; `Hello` is settled by the connection layer before anything
//! reaches the engine's queue.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Identifier, PeerId, Weight};

/// Fragment-search phase of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    #[default]
    Sleeping,
    /// Searching for the fragment's minimum outgoing edge
    Find,
    /// Search settled; waiting for Connect/Initiate
    Found,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NodeState::Sleeping => "sleeping",
            NodeState::Find => "find",
            NodeState::Found => "found",
        };
        write!(f, "{}", s)
    }
}

/// Role a connection announces in its first frame
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionRole {
    Server,
    Client,
}

/// Ordinary chat/activity payload flooded along the tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    pub origin: PeerId,
    pub payload: String,
}

impl Activity {
    pub fn new(origin: PeerId, payload: impl Into<String>) -> Self {
        Activity {
            origin,
            payload: payload.into(),
        }
    }
}

/// Wire message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// First frame of every connection
    Hello { role: ConnectionRole },
    /// Announces identity and link lag
    Handshake { peer: PeerId, lag: u64 },
    /// Acknowledges a handshake with the agreed link weight
    HandshakeAck { peer: PeerId, lag: u64 },
    /// Ask a sleeping node to start the tree construction
    WakeUp,
    Connect { level: u32 },
    Initiate {
        level: u32,
        fragment: Identifier,
        state: NodeState,
    },
    Test { level: u32, fragment: Identifier },
    Accept { sender: PeerId },
    Reject { sender: PeerId },
    Report { weight: Weight },
    ChangeCore,
    Activity(Activity),
}

impl Message {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Handshake { .. } => "handshake",
            Message::HandshakeAck { .. } => "handshake_ack",
            Message::WakeUp => "wake_up",
            Message::Connect { .. } => "connect",
            Message::Initiate { .. } => "initiate",
            Message::Test { .. } => "test",
            Message::Accept { .. } => "accept",
            Message::Reject { .. } => "reject",
            Message::Report { .. } => "report",
            Message::ChangeCore => "change_core",
            Message::Activity(_) => "activity",
        }
    }

    /// Is this one of the tree-construction messages?
    pub fn is_ghs(&self) -> bool {
        matches!(
            self,
            Message::Connect { .. }
                | Message::Initiate { .. }
                | Message::Test { .. }
                | Message::Accept { .. }
                | Message::Reject { .. }
                | Message::Report { .. }
                | Message::ChangeCore
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EdgeWeight;

    #[test]
    fn test_message_tagging() {
        let json = serde_json::to_string(&Message::Connect { level: 2 }).unwrap();
        assert_eq!(json, r#"{"type":"connect","level":2}"#);

        let json = serde_json::to_string(&Message::ChangeCore).unwrap();
        assert_eq!(json, r#"{"type":"change_core"}"#);
    }

    #[test]
    fn test_report_infinite_is_null() {
        let json = serde_json::to_string(&Message::Report {
            weight: Weight::Infinite,
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"report","weight":null}"#);
    }

    #[test]
    fn test_initiate_decodes() {
        let fragment = Identifier::new(PeerId::new(3), PeerId::new(1));
        let msg = Message::Initiate {
            level: 1,
            fragment,
            state: NodeState::Find,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""state":"find""#));

        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_activity_and_report_finite() {
        let activity = Message::Activity(Activity::new(PeerId::new(9), "hi"));
        let json = serde_json::to_string(&activity).unwrap();
        assert_eq!(json, r#"{"type":"activity","origin":9,"payload":"hi"}"#);

        let weight = Weight::Finite(EdgeWeight::new(
            20,
            Identifier::new(PeerId::new(1), PeerId::new(2)),
        ));
        let report: Message =
            serde_json::from_str(&serde_json::to_string(&Message::Report { weight }).unwrap())
                .unwrap();
        assert_eq!(report, Message::Report { weight });
    }

    #[test]
    fn test_ghs_classification() {
        assert!(Message::ChangeCore.is_ghs());
        assert!(Message::Report {
            weight: Weight::Infinite
        }
        .is_ghs());
        assert!(!Message::WakeUp.is_ghs());
        assert!(!Message::Hello {
            role: ConnectionRole::Client
        }
        .is_ghs());
    }
}
