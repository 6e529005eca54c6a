//! Wire message types and their codec.
//!
//! Every frame body is `Header || Body`, serialized with fixed-width
//! little-endian integers: sequences and strings carry a `u64` count
//! prefix, the header is always 21 bytes. The header's `message_type`
//! selects one of three body shapes; anything else fails decoding and
//! the link that produced it is closed.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::crypto::Identity;

/// Frames (and therefore message payloads) above this are rejected.
pub const MAX_FRAME_LEN: u64 = 1 << 20;

pub const PROTOCOL_VERSION: Version = Version {
    major: 0,
    minor: 1,
    patch: 0,
};

fn wire_options() -> impl Options {
    bincode::options()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_LEN)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Relay = 1,
    ClientPath = 2,
    AgentInformation = 3,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> anyhow::Result<Self> {
        match value {
            1 => Ok(Self::Relay),
            2 => Ok(Self::ClientPath),
            3 => Ok(Self::AgentInformation),
            _ => Err(anyhow::anyhow!("unknown message type {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub message_type: u8,
    pub version: Version,
    pub discourse_id: u64,
}

impl Header {
    fn new(message_type: MessageType) -> Self {
        Self {
            message_type: message_type as u8,
            version: PROTOCOL_VERSION,
            discourse_id: rand::random(),
        }
    }
}

/// Versioned, otherwise opaque per-client metadata record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInformation {
    pub version: u64,
    pub payload: Vec<u8>,
}

impl AgentInformation {
    pub fn new(version: u64, payload: Vec<u8>) -> Self {
        Self { version, payload }
    }

    /// Strictly greater version; equality is stale.
    pub fn newer_than(&self, other: &Self) -> bool {
        self.version > other.version
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayBody {
    pub origin_identity: Identity,
    pub path: Vec<Identity>,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPathBody {
    pub client_path: Vec<Identity>,
    pub register: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInformationBody {
    pub client_identity: Identity,
    pub agent_information: AgentInformation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Relay(RelayBody),
    ClientPath(ClientPathBody),
    AgentInformation(AgentInformationBody),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub header: Header,
    pub body: MessageBody,
}

impl Message {
    pub fn relay(origin_identity: Identity, path: Vec<Identity>, payload: Vec<u8>) -> Self {
        Self {
            header: Header::new(MessageType::Relay),
            body: MessageBody::Relay(RelayBody {
                origin_identity,
                path,
                payload,
            }),
        }
    }

    pub fn client_path(client_path: Vec<Identity>, register: bool) -> Self {
        Self {
            header: Header::new(MessageType::ClientPath),
            body: MessageBody::ClientPath(ClientPathBody {
                client_path,
                register,
            }),
        }
    }

    pub fn agent_information(
        client_identity: Identity,
        agent_information: AgentInformation,
    ) -> Self {
        Self {
            header: Header::new(MessageType::AgentInformation),
            body: MessageBody::AgentInformation(AgentInformationBody {
                client_identity,
                agent_information,
            }),
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let mut buf = wire_options().serialize(&self.header)?;
        buf.extend(match &self.body {
            MessageBody::Relay(body) => wire_options().serialize(body)?,
            MessageBody::ClientPath(body) => wire_options().serialize(body)?,
            MessageBody::AgentInformation(body) => wire_options().serialize(body)?,
        });
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut reader = bytes;
        let header: Header = wire_options().deserialize_from(&mut reader)?;
        let body = match MessageType::try_from(header.message_type)? {
            MessageType::Relay => {
                MessageBody::Relay(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::ClientPath => {
                MessageBody::ClientPath(wire_options().deserialize_from(&mut reader)?)
            }
            MessageType::AgentInformation => {
                MessageBody::AgentInformation(wire_options().deserialize_from(&mut reader)?)
            }
        };
        anyhow::ensure!(reader.is_empty(), "trailing bytes after message body");
        Ok(Self { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_21_bytes() {
        let message = Message::client_path(Vec::new(), true);
        let bytes = message.encode().unwrap();
        // u8 type + three u32 version fields + u64 discourse id, then the body
        assert_eq!(bytes.len(), 21 + 8 + 1);
        assert_eq!(bytes[0], MessageType::ClientPath as u8);
        assert_eq!(&bytes[1..5], &[0, 0, 0, 0]);
        assert_eq!(&bytes[5..9], &[1, 0, 0, 0]);
        assert_eq!(&bytes[9..13], &[0, 0, 0, 0]);
        assert_eq!(&bytes[13..21], &message.header.discourse_id.to_le_bytes());
    }

    #[test]
    fn client_path_wire_layout_is_exact() {
        let mut message = Message::client_path(vec!["a".into(), "bc".into()], true);
        message.header.discourse_id = 7;
        let bytes = message.encode().unwrap();
        let mut expected = vec![2u8];
        expected.extend(0u32.to_le_bytes());
        expected.extend(1u32.to_le_bytes());
        expected.extend(0u32.to_le_bytes());
        expected.extend(7u64.to_le_bytes());
        expected.extend(2u64.to_le_bytes()); // path element count
        expected.extend(1u64.to_le_bytes());
        expected.extend(b"a");
        expected.extend(2u64.to_le_bytes());
        expected.extend(b"bc");
        expected.push(1); // register
        assert_eq!(bytes, expected);
    }

    #[test]
    fn bodies_round_trip() {
        for message in [
            Message::relay("origin".into(), vec!["a".into(), "b".into()], b"hi".to_vec()),
            Message::client_path(vec!["a".into()], false),
            Message::agent_information("a".into(), AgentInformation::new(3, b"meta".to_vec())),
        ] {
            let decoded = Message::decode(&message.encode().unwrap()).unwrap();
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn unknown_type_and_trailing_bytes_fail() {
        let mut bytes = Message::client_path(vec!["a".into()], true).encode().unwrap();
        bytes[0] = 9;
        assert!(Message::decode(&bytes).is_err());
        bytes[0] = 2;
        bytes.push(0);
        assert!(Message::decode(&bytes).is_err());
        assert!(Message::decode(&bytes[..bytes.len() - 2]).is_err());
    }

    #[test]
    fn agent_information_ordering() {
        let v3 = AgentInformation::new(3, Vec::new());
        let v5 = AgentInformation::new(5, Vec::new());
        assert!(v5.newer_than(&v3));
        assert!(!v3.newer_than(&v5));
        assert!(!v5.newer_than(&v5));
    }
}
