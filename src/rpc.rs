use crate::{
    keys::{HashImage, Preimage},
    params::{AliceHalf, CarolHalf},
    SessionId,
};
use bitcoin::{secp256k1::Signature, Txid};
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// The fixed method set, as it appears on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Status,
    Handshake,
    Negotiate,
    #[serde(rename = "tx0id_hx_tx2sig")]
    Tx0idHxTx2Sig,
    #[serde(rename = "sigtx3")]
    SigTx3,
    Phase2Ready,
    Secret,
    #[serde(rename = "sigtx4")]
    SigTx4,
    ConfirmTx4,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Status => "status",
            Method::Handshake => "handshake",
            Method::Negotiate => "negotiate",
            Method::Tx0idHxTx2Sig => "tx0id_hx_tx2sig",
            Method::SigTx3 => "sigtx3",
            Method::Phase2Ready => "phase2_ready",
            Method::Secret => "secret",
            Method::SigTx4 => "sigtx4",
            Method::ConfirmTx4 => "confirm_tx4",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Handshake {
    pub session_id: SessionId,
    pub cscs_version: u32,
    pub source_chain: String,
    pub destination_chain: String,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub amount: bitcoin::Amount,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub session_id: SessionId,
    pub cscs_version: u32,
}

/// Reply to `status`; pollable at any time, session-independent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusInfo {
    pub busy: bool,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub minimum_amount: bitcoin::Amount,
    /// Clamped to available funds; -1 when the server cannot serve at all.
    pub maximum_amount: i64,
    pub source_chain: String,
    pub destination_chain: String,
    pub cscs_version: u32,
}

/// A client request. Serialized as `{"method": ..., "params": ...}` so the
/// envelope stays plain JSON-RPC.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Status,
    Handshake(Handshake),
    Negotiate {
        session_id: SessionId,
        half: AliceHalf,
    },
    #[serde(rename = "tx0id_hx_tx2sig")]
    Tx0idHxTx2Sig {
        session_id: SessionId,
        #[serde(with = "crate::serde::txid")]
        tx0_txid: Txid,
        hash_image: HashImage,
        #[serde(with = "crate::serde::signature")]
        sig_TX2_alice: Signature,
    },
    #[serde(rename = "sigtx3")]
    SigTx3 {
        session_id: SessionId,
        #[serde(with = "crate::serde::signature")]
        sig_TX3_alice: Signature,
    },
    Phase2Ready {
        session_id: SessionId,
    },
    Secret {
        session_id: SessionId,
        secret: Preimage,
    },
    #[serde(rename = "sigtx4")]
    SigTx4 {
        session_id: SessionId,
        #[serde(with = "crate::serde::signature")]
        sig_TX4_alice: Signature,
        #[serde(with = "crate::serde::txid")]
        tx5_txid: Txid,
    },
    ConfirmTx4 {
        session_id: SessionId,
    },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Status => Method::Status,
            Request::Handshake(_) => Method::Handshake,
            Request::Negotiate { .. } => Method::Negotiate,
            Request::Tx0idHxTx2Sig { .. } => Method::Tx0idHxTx2Sig,
            Request::SigTx3 { .. } => Method::SigTx3,
            Request::Phase2Ready { .. } => Method::Phase2Ready,
            Request::Secret { .. } => Method::Secret,
            Request::SigTx4 { .. } => Method::SigTx4,
            Request::ConfirmTx4 { .. } => Method::ConfirmTx4,
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Request::Status => None,
            Request::Handshake(handshake) => Some(&handshake.session_id),
            Request::Negotiate { session_id, .. }
            | Request::Tx0idHxTx2Sig { session_id, .. }
            | Request::SigTx3 { session_id, .. }
            | Request::Phase2Ready { session_id }
            | Request::Secret { session_id, .. }
            | Request::SigTx4 { session_id, .. }
            | Request::ConfirmTx4 { session_id } => Some(session_id),
        }
    }
}

/// A server reply. `Ack(false)` is the protocol's universal refusal; any
/// caller receiving it must back out.
#[derive(Clone, Debug, Serialize, Deserialize, EnumAsInner)]
#[serde(rename_all = "snake_case")]
pub enum Response {
    Status(StatusInfo),
    Handshake(HandshakeAck),
    Negotiate(CarolHalf),
    Funding {
        #[serde(with = "crate::serde::txid")]
        tx1_txid: Txid,
        #[serde(with = "crate::serde::signature")]
        sig_TX3_carol: Signature,
    },
    Secret {
        #[serde(with = "crate::serde::signature")]
        sig_TX2_carol: Signature,
    },
    Ack(bool),
}

impl Response {
    pub fn refused() -> Self {
        Response::Ack(false)
    }

    pub fn is_refusal(&self) -> bool {
        matches!(self, Response::Ack(false))
    }
}

/// JSON-RPC 2.0 request envelope.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Envelope {
    pub jsonrpc: String,
    pub id: u64,
    #[serde(flatten)]
    pub request: Request,
}

impl Envelope {
    pub fn new(id: u64, request: Request) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            request,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub jsonrpc: String,
    pub id: u64,
    pub result: Response,
}

impl ReplyEnvelope {
    pub fn new(id: u64, result: Response) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
        }
    }
}

/// The client side of the transport. Implementations carry JSON over
/// HTTP(S); with TLS, peer verification must be on by default and require an
/// explicit opt-out, since disabling it exposes the endpoints to whoever
/// runs the wire (the protocol itself only ever loses liveness to such an
/// attacker, not funds).
#[async_trait::async_trait]
pub trait CallServer {
    async fn call(&mut self, request: Request) -> anyhow::Result<Response>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Amount;

    #[test]
    fn requests_use_wire_method_names() {
        let request = Request::Phase2Ready {
            session_id: SessionId::from("00ff"),
        };
        let json = serde_json::to_string(&Envelope::new(7, request)).unwrap();

        assert!(json.contains(r#""method":"phase2_ready""#), "{}", json);
        assert!(json.contains(r#""jsonrpc":"2.0""#));

        let request = Request::Secret {
            session_id: SessionId::from("00ff"),
            secret: Preimage::new_random(),
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""method":"secret""#), "{}", json);
    }

    #[test]
    fn envelope_round_trips() {
        let handshake = Handshake {
            session_id: SessionId::new_random(),
            cscs_version: crate::PROTOCOL_VERSION,
            source_chain: "BTC".to_string(),
            destination_chain: "BTC".to_string(),
            amount: Amount::from_sat(10_000_000),
        };
        let envelope = Envelope::new(1, Request::Handshake(handshake.clone()));

        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.id, 1);
        match parsed.request {
            Request::Handshake(parsed) => assert_eq!(parsed, handshake),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn refusal_round_trips() {
        let json = serde_json::to_string(&ReplyEnvelope::new(2, Response::refused())).unwrap();
        let parsed: ReplyEnvelope = serde_json::from_str(&json).unwrap();

        assert!(parsed.result.is_refusal());
    }
}
