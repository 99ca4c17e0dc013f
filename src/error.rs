use crate::{rpc::Method, signature::InvalidSignature};
use bitcoin::{Amount, Txid};
use std::time::Duration;

/// The counterparty broke the protocol. Never recoverable for the session.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("signature does not verify against the expected transaction")]
    InvalidSignature(#[from] InvalidSignature),
    #[error("preimage does not hash to the negotiated image")]
    BadPreimage,
    #[error("method {method} is not valid in state {state}")]
    UnexpectedMethod { method: Method, state: String },
    #[error("protocol version {theirs} is incompatible with ours ({ours})")]
    VersionMismatch { ours: u32, theirs: u32 },
    #[error("funding transaction {txid} does not pay the negotiated escrow")]
    WrongFunding { txid: Txid },
    #[error("counterparty refused {method}")]
    Refused { method: Method },
    #[error("malformed message: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ChainError {
    #[error("broadcast rejected: {0}")]
    BroadcastRejected(String),
    #[error("chain interface unreachable: {0}")]
    Unreachable(String),
    #[error("transaction {txid} fell back below {depth} confirmations")]
    Reorg { txid: Txid, depth: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum TimeoutError {
    #[error("deadline for state {state} expired")]
    StateDeadline { state: String },
    #[error("no response from server within {0:?}")]
    Rpc(Duration),
    #[error("block height {deadline} passed while waiting for {waiting_for}")]
    ChainDeadline { deadline: u32, waiting_for: String },
}

/// Policy violations caught at negotiation time, before any on-chain action.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("fee rate {rate} sat/kB exceeds the absurd-fee limit {limit}")]
    AbsurdFeeRate { rate: u64, limit: u64 },
    #[error("amount {amount} outside accepted range [{minimum}, {maximum}]")]
    AmountOutOfBounds {
        amount: Amount,
        minimum: Amount,
        maximum: Amount,
    },
    #[error("coinswap fee {fee} below minimum {minimum}")]
    FeeBelowMinimum { fee: Amount, minimum: Amount },
    #[error("timeouts must satisfy height {height} < L0 {L0} < L1 {L1} < L2 {L2}")]
    TimeoutsOutOfOrder {
        height: u32,
        L0: u32,
        L1: u32,
        L2: u32,
    },
    #[error("timeout gap {gap} outside accepted range [{minimum}, {maximum}]")]
    TimeoutGapOutOfBounds { gap: u32, minimum: u32, maximum: u32 },
    #[error("payout address is not the P2WPKH of the redeem key")]
    PayoutAddressMismatch,
    #[error("payout address is for the wrong network")]
    WrongNetwork,
}

/// Something is broken on our own side. Best-effort backout, then abort.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("wallet refused to sign: {0}")]
    WalletSigning(String),
    #[error("session could not be persisted: {0}")]
    Persistence(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Timeout(#[from] TimeoutError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fatal(#[from] FatalError),
}

impl From<InvalidSignature> for Error {
    fn from(from: InvalidSignature) -> Self {
        Error::Protocol(ProtocolError::from(from))
    }
}

impl Error {
    /// Transient chain failures are the only errors worth retrying; anything
    /// else converts into a backout.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Chain(ChainError::Unreachable(_)))
    }
}
