//! In-memory chain, wallet and transport for driving both ends of a swap
//! inside one test process.

#![allow(dead_code)]

use anyhow::{anyhow, Context};
use bitcoin::{
    blockdata::{opcodes, script::Builder},
    hashes::Hash,
    secp256k1::{All, Message, PublicKey, Secp256k1, SecretKey, Signature},
    Address, Amount, Network, OutPoint, Script, SigHash, Transaction, TxIn, TxOut, Txid,
};
use njord::{
    BalanceByMixdepth, BlockHeight, BroadcastTransaction, CallServer, Envelope, EstimateFee,
    GetSpendingTransaction, GetTransaction, NewAddress, Request, Response, SelectUtxos, Server,
    SignInput, TxInfo, Utxo,
};
use rand::RngCore;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

pub const FEE_RATE: u64 = 20_000;

#[derive(Debug)]
struct ChainTx {
    transaction: Transaction,
    mined_at: Option<u32>,
}

#[derive(Debug)]
struct ChainState {
    height: u32,
    txs: HashMap<Txid, ChainTx>,
    spends: HashMap<OutPoint, Txid>,
    fee_rate: u64,
}

/// A regtest-flavoured chain: instant broadcast validation (double spends
/// and premature lock times are rejected), explicit mining.
#[derive(Clone, Debug)]
pub struct MockChain {
    inner: Arc<Mutex<ChainState>>,
}

impl MockChain {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ChainState {
                height: 100,
                txs: HashMap::new(),
                spends: HashMap::new(),
                fee_rate: FEE_RATE,
            })),
        }
    }

    pub fn height(&self) -> u32 {
        self.inner.lock().unwrap().height
    }

    /// Mine `blocks`; everything in the mempool lands in the first of them.
    pub fn mine(&self, blocks: u32) {
        let mut state = self.inner.lock().unwrap();
        for _ in 0..blocks {
            state.height += 1;
            let height = state.height;
            for tx in state.txs.values_mut() {
                if tx.mined_at.is_none() {
                    tx.mined_at = Some(height);
                }
            }
        }
    }

    pub fn tx_count(&self) -> usize {
        self.inner.lock().unwrap().txs.len()
    }

    pub fn spending_txid(&self, outpoint: OutPoint) -> Option<Txid> {
        self.inner.lock().unwrap().spends.get(&outpoint).copied()
    }

    pub fn get_transaction(&self, txid: Txid) -> Option<Transaction> {
        self.inner
            .lock()
            .unwrap()
            .txs
            .get(&txid)
            .map(|tx| tx.transaction.clone())
    }

    pub fn confirmations(&self, txid: Txid) -> u32 {
        let state = self.inner.lock().unwrap();
        state
            .txs
            .get(&txid)
            .and_then(|tx| tx.mined_at)
            .map(|mined| state.height - mined + 1)
            .unwrap_or(0)
    }

    fn accept(&self, transaction: Transaction) -> anyhow::Result<Txid> {
        let mut state = self.inner.lock().unwrap();
        let txid = transaction.txid();

        if state.txs.contains_key(&txid) {
            // rebroadcast of a known transaction
            return Ok(txid);
        }

        if transaction.lock_time != 0 && transaction.lock_time > state.height {
            return Err(anyhow!("non-final: lock time {}", transaction.lock_time));
        }

        for input in &transaction.input {
            if let Some(existing) = state.spends.get(&input.previous_output) {
                return Err(anyhow!(
                    "{} double-spends {} (already spent by {})",
                    txid,
                    input.previous_output,
                    existing
                ));
            }
        }

        for input in &transaction.input {
            state.spends.insert(input.previous_output, txid);
        }
        state.txs.insert(
            txid,
            ChainTx {
                transaction,
                mined_at: None,
            },
        );

        Ok(txid)
    }

    /// Inject a funding output that exists outside any wallet (test seeds).
    fn seed(&self, output: TxOut, nonce: u32) -> OutPoint {
        let transaction = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_inner([0xde; 32]),
                    vout: nonce,
                },
                script_sig: Script::new(),
                sequence: 0xFFFF_FFFF,
                witness: Vec::new(),
            }],
            output: vec![output],
        };
        let txid = transaction.txid();

        let mut state = self.inner.lock().unwrap();
        let height = state.height;
        state.txs.insert(
            txid,
            ChainTx {
                transaction,
                mined_at: Some(height),
            },
        );

        OutPoint { txid, vout: 0 }
    }
}

#[async_trait::async_trait]
impl BlockHeight for MockChain {
    async fn block_height(&self) -> anyhow::Result<u32> {
        Ok(self.height())
    }
}

#[async_trait::async_trait]
impl GetTransaction for MockChain {
    async fn get_tx(&self, txid: Txid) -> anyhow::Result<Option<TxInfo>> {
        let state = self.inner.lock().unwrap();
        Ok(state.txs.get(&txid).map(|tx| TxInfo {
            transaction: tx.transaction.clone(),
            confirmations: tx
                .mined_at
                .map(|mined| state.height - mined + 1)
                .unwrap_or(0),
        }))
    }
}

#[async_trait::async_trait]
impl BroadcastTransaction for MockChain {
    async fn broadcast(&self, transaction: Transaction) -> anyhow::Result<Txid> {
        self.accept(transaction)
    }
}

#[async_trait::async_trait]
impl EstimateFee for MockChain {
    async fn estimate_fee(&self, _target_blocks: usize) -> anyhow::Result<u64> {
        Ok(self.inner.lock().unwrap().fee_rate)
    }
}

#[async_trait::async_trait]
impl GetSpendingTransaction for MockChain {
    async fn spending_tx(&self, outpoint: OutPoint) -> anyhow::Result<Option<Transaction>> {
        let state = self.inner.lock().unwrap();
        Ok(state
            .spends
            .get(&outpoint)
            .and_then(|txid| state.txs.get(txid))
            .map(|tx| tx.transaction.clone()))
    }
}

struct WalletKey {
    secret_key: SecretKey,
    public_key: PublicKey,
    account: u32,
}

struct WalletState {
    keys: HashMap<Script, WalletKey>,
    seed_nonce: u32,
}

/// A throwaway wallet: fresh random keys per address, P2WPKH only, balance
/// derived by scanning the mock chain.
#[derive(Clone)]
pub struct MockWallet {
    inner: Arc<Mutex<WalletState>>,
    chain: MockChain,
    secp: Arc<Secp256k1<All>>,
}

impl MockWallet {
    pub fn new(chain: MockChain) -> Self {
        Self {
            inner: Arc::new(Mutex::new(WalletState {
                keys: HashMap::new(),
                seed_nonce: 0,
            })),
            chain,
            secp: Arc::new(Secp256k1::new()),
        }
    }

    /// Give the wallet a confirmed account-0 output of `amount`.
    pub fn fund(&self, amount: Amount) {
        let address = self.derive(0);
        let nonce = {
            let mut state = self.inner.lock().unwrap();
            state.seed_nonce += 1;
            state.seed_nonce
        };

        self.chain.seed(
            TxOut {
                value: amount.as_sat(),
                script_pubkey: address.script_pubkey(),
            },
            nonce,
        );
    }

    fn derive(&self, account: u32) -> Address {
        let secret_key = loop {
            let mut bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut bytes);
            if let Ok(secret_key) = SecretKey::from_slice(&bytes) {
                break secret_key;
            }
        };
        let public_key = PublicKey::from_secret_key(&self.secp, &secret_key);
        let address = Address::p2wpkh(
            &bitcoin::PublicKey {
                compressed: true,
                key: public_key,
            },
            Network::Regtest,
        );

        self.inner.lock().unwrap().keys.insert(
            address.script_pubkey(),
            WalletKey {
                secret_key,
                public_key,
                account,
            },
        );

        address
    }

    fn unspent(&self, account: Option<u32>) -> Vec<(Utxo, u32)> {
        let keys = self.inner.lock().unwrap();
        let state = self.chain.inner.lock().unwrap();

        let mut utxos = Vec::new();
        for (txid, tx) in &state.txs {
            if tx.mined_at.is_none() {
                continue;
            }
            for (vout, output) in tx.transaction.output.iter().enumerate() {
                let key = match keys.keys.get(&output.script_pubkey) {
                    Some(key) => key,
                    None => continue,
                };
                if let Some(wanted) = account {
                    if key.account != wanted {
                        continue;
                    }
                }

                #[allow(clippy::cast_possible_truncation)]
                let outpoint = OutPoint {
                    txid: *txid,
                    vout: vout as u32,
                };
                if state.spends.contains_key(&outpoint) {
                    continue;
                }

                utxos.push((
                    Utxo {
                        outpoint,
                        value: Amount::from_sat(output.value),
                        script_pubkey: output.script_pubkey.clone(),
                    },
                    key.account,
                ));
            }
        }

        utxos
    }

    pub fn balance(&self, account: u32) -> Amount {
        self.unspent(Some(account))
            .into_iter()
            .fold(Amount::from_sat(0), |acc, (utxo, _)| acc + utxo.value)
    }
}

#[async_trait::async_trait]
impl NewAddress for MockWallet {
    async fn new_address(&self, account: u32, _branch: u32) -> anyhow::Result<Address> {
        Ok(self.derive(account))
    }
}

#[async_trait::async_trait]
impl SelectUtxos for MockWallet {
    async fn select_utxos(&self, account: u32, amount: Amount) -> anyhow::Result<Vec<Utxo>> {
        let mut utxos = self.unspent(Some(account));
        utxos.sort_by_key(|(utxo, _)| std::cmp::Reverse(utxo.value));

        let mut selected = Vec::new();
        let mut total = Amount::from_sat(0);
        for (utxo, _) in utxos {
            total = total + utxo.value;
            selected.push(utxo);
            if total >= amount {
                return Ok(selected);
            }
        }

        Err(anyhow!("insufficient funds: {} < {}", total, amount))
    }
}

#[async_trait::async_trait]
impl SignInput for MockWallet {
    async fn sign_input(
        &self,
        utxo: &Utxo,
        sighash: SigHash,
    ) -> anyhow::Result<(PublicKey, Signature)> {
        let state = self.inner.lock().unwrap();
        let key = state
            .keys
            .get(&utxo.script_pubkey)
            .context("utxo does not belong to this wallet")?;

        let message = Message::from_slice(&sighash.into_inner())?;
        let signature = self.secp.sign(&message, &key.secret_key);

        Ok((key.public_key, signature))
    }
}

#[async_trait::async_trait]
impl BalanceByMixdepth for MockWallet {
    async fn balance_by_mixdepth(&self) -> anyhow::Result<Vec<Amount>> {
        Ok(vec![self.balance(0), self.balance(1)])
    }
}

pub type TestServer = Server<MockWallet, MockChain>;
pub type SharedServer = Arc<tokio::sync::Mutex<TestServer>>;

/// Client end of an in-memory connection to the server. Requests round-trip
/// through the JSON wire format, which keeps the envelope encoding honest.
pub struct Transport {
    server: SharedServer,
    next_id: AtomicU64,
}

impl Transport {
    pub fn new(server: SharedServer) -> Self {
        Self {
            server,
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait::async_trait]
impl CallServer for Transport {
    async fn call(&mut self, request: Request) -> anyhow::Result<Response> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = serde_json::to_string(&Envelope::new(id, request))
            .context("failed to encode request")?;

        let mut server = self.server.lock().await;
        let reply = server.handle_json(&body).await;
        drop(server);

        let reply: njord::ReplyEnvelope =
            serde_json::from_str(&reply).context("failed to decode reply")?;
        Ok(reply.result)
    }
}

/// A transport that drops the connection on one method, simulating a
/// counterparty that vanished mid-protocol.
pub struct FailOn<T> {
    pub inner: T,
    pub method: njord::Method,
}

#[async_trait::async_trait]
impl<T: CallServer + Send> CallServer for FailOn<T> {
    async fn call(&mut self, request: Request) -> anyhow::Result<Response> {
        if request.method() == self.method {
            return Err(anyhow!("connection reset by peer"));
        }

        self.inner.call(request).await
    }
}

/// Delegates to the real chain but stalls the first broadcast of the given
/// outpoint's spend forever, opening a deterministic crash window.
#[derive(Clone)]
pub struct StallSpend {
    pub inner: MockChain,
    pub outpoint: Arc<Mutex<Option<OutPoint>>>,
}

#[async_trait::async_trait]
impl BlockHeight for StallSpend {
    async fn block_height(&self) -> anyhow::Result<u32> {
        self.inner.block_height().await
    }
}

#[async_trait::async_trait]
impl GetTransaction for StallSpend {
    async fn get_tx(&self, txid: Txid) -> anyhow::Result<Option<TxInfo>> {
        self.inner.get_tx(txid).await
    }
}

#[async_trait::async_trait]
impl BroadcastTransaction for StallSpend {
    async fn broadcast(&self, transaction: Transaction) -> anyhow::Result<Txid> {
        let stall = {
            let target = self.outpoint.lock().unwrap();
            matches!(*target, Some(outpoint) if transaction
                .input
                .iter()
                .any(|input| input.previous_output == outpoint))
        };

        if stall {
            futures::future::pending::<()>().await;
        }

        self.inner.broadcast(transaction).await
    }
}

#[async_trait::async_trait]
impl EstimateFee for StallSpend {
    async fn estimate_fee(&self, target_blocks: usize) -> anyhow::Result<u64> {
        self.inner.estimate_fee(target_blocks).await
    }
}

#[async_trait::async_trait]
impl GetSpendingTransaction for StallSpend {
    async fn spending_tx(&self, outpoint: OutPoint) -> anyhow::Result<Option<Transaction>> {
        self.inner.spending_tx(outpoint).await
    }
}

/// A p2wpkh script for a key nobody holds; used where tests need an
/// unrelated destination.
pub fn unrelated_script() -> Script {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);

    Builder::new()
        .push_opcode(opcodes::all::OP_PUSHBYTES_0)
        .push_slice(&bytes)
        .into_script()
}
