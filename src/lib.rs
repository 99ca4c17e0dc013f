#![warn(
    unused_extern_crates,
    missing_debug_implementations,
    rust_2018_idioms,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::fallible_impl_from,
    clippy::cast_precision_loss,
    clippy::cast_possible_wrap,
    clippy::dbg_macro
)]
#![cfg_attr(not(test), warn(clippy::unwrap_used))]
#![forbid(unsafe_code)]
#![allow(non_snake_case)]

pub(crate) mod serde;

mod alice;
mod backout;
mod carol;
mod config;
mod error;
mod fee;
mod hooks;
mod keys;
mod monitor;
mod params;
mod rpc;
mod server;
mod session;
mod signature;
mod traits;
mod transaction;

pub use ::bitcoin;
pub use alice::{Alice, SwapOutcome};
pub use carol::Carol;
pub use config::Config;
pub use error::{ChainError, ConfigError, Error, FatalError, ProtocolError, TimeoutError};
pub use fee::FeeEstimator;
pub use hooks::{Honest, Hooks};
pub use keys::{
    BackoutKeyPair, BackoutPublicKey, FundingKeyPair, FundingPublicKey, HashImage, PartyKeyPairs,
    Preimage, RedeemKeyPair, RedeemPublicKey,
};
pub use monitor::{Monitor, Watch, WatchEvent};
pub use params::{AliceHalf, CarolHalf, PartyKeys, PublicParameters, Timeouts, TxFees};
pub use rpc::{
    CallServer, Envelope, Handshake, HandshakeAck, Method, ReplyEnvelope, Request, Response,
    StatusInfo,
};
pub use server::Server;
pub use session::{Session, SessionStore};
pub use signature::verify_sig;
pub use traits::{
    BalanceByMixdepth, BlockHeight, BroadcastTransaction, EstimateFee, GetSpendingTransaction,
    GetTransaction, NewAddress, SelectUtxos, SignInput, TxInfo, Utxo,
};
pub use transaction::{extract_preimage, Escrow, FundingTransaction, SpendTransaction};

use ::serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol version exchanged during the handshake. Incompatible versions
/// refuse each other before anything touches the chain.
pub const PROTOCOL_VERSION: u32 = 1;

/// Outputs at or below the relay dust figure are unspendable in practice.
pub const BITCOIN_DUST_THRESHOLD: u64 = 2_730;

/// Change below this is folded into the transaction fee instead of creating
/// an output that costs more to sweep than it is worth.
pub const DUST_THRESHOLD: u64 = 10 * BITCOIN_DUST_THRESHOLD;

/// Role in a coinswap. Alice initiates and holds the secret; Carol serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Alice,
    Carol,
}

/// Identifies one protocol run between one Alice and one Carol, on the wire
/// and in the session store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new_random() -> Self {
        use rand::RngCore;

        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);

        Self(hex::encode(bytes))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(from: &str) -> Self {
        Self(from.to_string())
    }
}
