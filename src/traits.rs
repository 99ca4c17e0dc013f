//! Interfaces to the two external collaborators: the blockchain and the
//! wallet. One small trait per capability, so components only name what they
//! actually consume.

use bitcoin::{
    secp256k1::{PublicKey, Signature},
    Address, Amount, OutPoint, Script, SigHash, Transaction, Txid,
};

#[derive(Clone, Debug)]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub value: Amount,
    /// Needed to reconstruct the BIP143 script code when signing.
    pub script_pubkey: Script,
}

#[derive(Clone, Debug)]
pub struct TxInfo {
    pub transaction: Transaction,
    /// 0 while still in the mempool.
    pub confirmations: u32,
}

#[async_trait::async_trait]
pub trait BlockHeight {
    async fn block_height(&self) -> anyhow::Result<u32>;
}

#[async_trait::async_trait]
pub trait GetTransaction {
    /// `None` when the transaction is neither in the mempool nor in a block.
    async fn get_tx(&self, txid: Txid) -> anyhow::Result<Option<TxInfo>>;
}

#[async_trait::async_trait]
pub trait BroadcastTransaction {
    /// Broadcasting a transaction the node already knows is not an error;
    /// implementations return its txid as if newly submitted, which is what
    /// makes rebroadcast-after-restart idempotent.
    async fn broadcast(&self, transaction: Transaction) -> anyhow::Result<Txid>;
}

#[async_trait::async_trait]
pub trait EstimateFee {
    /// Estimated rate in sat/kB to confirm within `target_blocks`.
    async fn estimate_fee(&self, target_blocks: usize) -> anyhow::Result<u64>;
}

#[async_trait::async_trait]
pub trait GetSpendingTransaction {
    /// The transaction (mempool or chain) spending `outpoint`, if any.
    async fn spending_tx(&self, outpoint: OutPoint) -> anyhow::Result<Option<Transaction>>;
}

#[async_trait::async_trait]
pub trait NewAddress {
    async fn new_address(&self, account: u32, branch: u32) -> anyhow::Result<Address>;
}

#[async_trait::async_trait]
pub trait SelectUtxos {
    /// Reserve spendable outputs from `account` covering at least `amount`.
    async fn select_utxos(&self, account: u32, amount: Amount) -> anyhow::Result<Vec<Utxo>>;
}

#[async_trait::async_trait]
pub trait SignInput {
    /// Sign `sighash` with the key controlling `utxo`. The returned public
    /// key completes the P2WPKH witness.
    async fn sign_input(
        &self,
        utxo: &Utxo,
        sighash: SigHash,
    ) -> anyhow::Result<(PublicKey, Signature)>;
}

#[async_trait::async_trait]
pub trait BalanceByMixdepth {
    /// Confirmed balance per account, index = account.
    async fn balance_by_mixdepth(&self) -> anyhow::Result<Vec<Amount>>;
}
