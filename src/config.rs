use bitcoin::{Amount, Network};
use std::{path::PathBuf, time::Duration};

/// Policy knobs for one participant process. The host application fills this
/// in from wherever it keeps configuration; nothing here reads files.
#[derive(Clone, Debug)]
pub struct Config {
    pub network: Network,
    /// How long to wait on the counterparty before giving up and backing out.
    pub default_server_timeout: Duration,
    /// Confirmations required on both funding transactions before the secret
    /// may travel.
    pub tx01_confirm_wait: u32,
    /// Confirmations at which a redeem counts as final.
    pub redeem_confirm_depth: u32,
    /// Fee target (blocks) for cooperative transactions.
    pub default_fee_target: usize,
    /// Fee target (blocks) for backout transactions; kept aggressive because
    /// some of them expire.
    pub backout_fee_target: usize,
    pub backout_fee_multiplier: f64,
    /// Fallback fee target when no better estimate is requested.
    pub tx_fees: usize,
    pub absurd_fee_per_kb: u64,
    pub minimum_amount: Amount,
    pub maximum_amount: Amount,
    pub minimum_coinswap_fee: Amount,
    pub maximum_concurrent_coinswaps: usize,
    /// Bounds on `L2 - L1` accepted at negotiation.
    pub min_timeout_gap: u32,
    pub max_timeout_gap: u32,
    /// Blocks of headroom kept between acting and a timeout becoming valid.
    pub timeout_safety: u32,
    /// Proposed timeout offsets from the current height (Alice side).
    pub l0_offset: u32,
    pub l1_offset: u32,
    pub l2_offset: u32,
    /// Chain poll cadence.
    pub poll_interval: Duration,
    pub source_chain: String,
    pub destination_chain: String,
    pub sessions_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: Network::Bitcoin,
            default_server_timeout: Duration::from_secs(60),
            tx01_confirm_wait: 2,
            redeem_confirm_depth: 2,
            default_fee_target: 2,
            backout_fee_target: 1,
            backout_fee_multiplier: 1.0,
            tx_fees: 3,
            absurd_fee_per_kb: 250_000,
            minimum_amount: Amount::from_sat(1_000_000),
            maximum_amount: Amount::from_sat(500_000_000),
            minimum_coinswap_fee: Amount::from_sat(100_000),
            maximum_concurrent_coinswaps: 3,
            min_timeout_gap: 10,
            max_timeout_gap: 300,
            timeout_safety: 6,
            l0_offset: 12,
            l1_offset: 50,
            l2_offset: 100,
            poll_interval: Duration::from_secs(30),
            source_chain: "BTC".to_string(),
            destination_chain: "BTC".to_string(),
            sessions_dir: PathBuf::from("sessions"),
        }
    }
}

impl Config {
    /// Regtest preset with a fast poll cadence and bounds loose enough for
    /// small test amounts.
    pub fn regtest(sessions_dir: PathBuf) -> Self {
        Self {
            network: Network::Regtest,
            poll_interval: Duration::from_secs(4),
            minimum_amount: Amount::from_sat(100_000),
            minimum_coinswap_fee: Amount::from_sat(10_000),
            timeout_safety: 2,
            min_timeout_gap: 4,
            l0_offset: 10,
            l1_offset: 20,
            l2_offset: 40,
            sessions_dir,
            ..Self::default()
        }
    }
}
