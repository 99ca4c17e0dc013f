use crate::{
    backout::{self, Plan},
    config::Config,
    error::{ChainError, Error, FatalError, ProtocolError, TimeoutError},
    fee::FeeEstimator,
    hooks::{Honest, Hooks},
    keys::{PartyKeyPairs, Preimage},
    monitor::{Monitor, WatchEvent},
    params::{AliceHalf, PublicParameters, Timeouts, TxFees},
    rpc::{CallServer, Handshake, Request, Response},
    session::{Outcome, Session, SessionStore},
    traits::{
        BlockHeight, BroadcastTransaction, EstimateFee, GetSpendingTransaction, GetTransaction,
        NewAddress, SelectUtxos, SignInput, TxInfo,
    },
    transaction::{
        check_funding, extract_preimage, funding_vbytes, FundingTransaction, SpendTransaction,
        COOP_SPEND_VBYTES, SECRET_SPEND_VBYTES,
    },
    Role, SessionId, PROTOCOL_VERSION,
};
use bitcoin::{Address, Amount, OutPoint, PublicKey, Txid};

const MAX_TRANSIENT_RETRIES: u32 = 5;

#[derive(Clone, Debug)]
pub enum SwapOutcome {
    /// The cooperative redeem confirmed; the swap is done.
    Completed { redeem_txid: Txid },
    /// The session died. Whatever could be recovered on chain was.
    BackedOut {
        reason: String,
        claim_txid: Option<Txid>,
        refund_txid: Option<Txid>,
    },
}

/// The initiator. Drives the session through its ordered states, persisting
/// after every transition, and falls into the backout plan the moment
/// anything refuses, times out or fails validation.
#[derive(Debug)]
pub struct Alice<H = Honest> {
    session: Session,
    config: Config,
    store: SessionStore,
    monitor: Monitor,
    hooks: H,
}

impl Alice<Honest> {
    pub fn new(
        config: Config,
        store: SessionStore,
        amount: Amount,
        coinswap_fee: Amount,
    ) -> Result<Self, Error> {
        Self::with_hooks(config, store, amount, coinswap_fee, Honest)
    }
}

impl<H: Hooks> Alice<H> {
    pub fn with_hooks(
        config: Config,
        store: SessionStore,
        amount: Amount,
        coinswap_fee: Amount,
        hooks: H,
    ) -> Result<Self, Error> {
        let mut session = Session::new(SessionId::new_random(), Role::Alice, PROTOCOL_VERSION);

        let secret = Preimage::new_random();
        session.hash_image = Some(secret.hash());
        session.secret = Some(secret);
        session.keys = Some(PartyKeyPairs::new_random());
        session.amount_sat = Some(amount.as_sat());
        session.coinswap_fee_sat = Some(coinswap_fee.as_sat());

        store.persist(&session)?;
        tracing::info!(session_id = %session.id, "session initialised");

        let mut monitor = Monitor::new();
        monitor.set_hash_image(secret.hash());

        Ok(Self {
            session,
            config,
            store,
            monitor,
            hooks,
        })
    }

    /// Pick up an interrupted session from the log. `run` continues from the
    /// persisted state index; watches are re-registered and pending
    /// broadcasts re-sent, both of which are idempotent.
    pub fn resume(
        config: Config,
        store: SessionStore,
        id: &SessionId,
        hooks: H,
    ) -> Result<Self, Error> {
        let session = store.load(id)?;

        let mut monitor = Monitor::new();
        if let Some(hash_image) = session.hash_image {
            monitor.set_hash_image(hash_image);
        }

        tracing::info!(session_id = %session.id, state_index = session.state_index, "session resumed");

        Ok(Self {
            session,
            config,
            store,
            monitor,
            hooks,
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn state_index(&self) -> u32 {
        self.session.state_index
    }

    /// Run the swap to completion or backout. Cancellation-safe in the sense
    /// that a crash at any await point resumes from the persisted state.
    pub async fn run<T, W, C>(
        &mut self,
        transport: &mut T,
        wallet: &W,
        chain: &C,
    ) -> Result<SwapOutcome, FatalError>
    where
        T: CallServer,
        W: NewAddress + SelectUtxos + SignInput,
        C: BlockHeight
            + GetTransaction
            + BroadcastTransaction
            + EstimateFee
            + GetSpendingTransaction,
    {
        let mut transient_retries = 0u32;

        loop {
            match self.step(transport, wallet, chain).await {
                Ok(Some(outcome)) => return Ok(outcome),
                Ok(None) => transient_retries = 0,
                Err(error) if error.is_transient() && transient_retries < MAX_TRANSIENT_RETRIES => {
                    transient_retries += 1;
                    tracing::debug!(%error, retry = transient_retries, "transient chain failure");
                    tokio::time::delay_for(self.config.poll_interval).await;
                }
                Err(error) => return Ok(self.backout(error, transport, wallet, chain).await?),
            }
        }
    }

    /// One state transition. `Ok(None)` means the machine advanced and the
    /// driver should keep going.
    async fn step<T, W, C>(
        &mut self,
        transport: &mut T,
        wallet: &W,
        chain: &C,
    ) -> Result<Option<SwapOutcome>, Error>
    where
        T: CallServer,
        W: NewAddress + SelectUtxos + SignInput,
        C: BlockHeight
            + GetTransaction
            + BroadcastTransaction
            + EstimateFee
            + GetSpendingTransaction,
    {
        self.rewatch();

        match self.session.state_index {
            0 | 1 => {
                let mut message = Handshake {
                    session_id: self.session.id.clone(),
                    cscs_version: self.session.version,
                    source_chain: self.config.source_chain.clone(),
                    destination_chain: self.config.destination_chain.clone(),
                    amount: Amount::from_sat(self.session.amount_sat.unwrap_or(0)),
                };
                self.hooks.handshake(&mut message);

                self.persist_at(1)?;
                let response = self.call(transport, Request::Handshake(message)).await?;

                let ack = response
                    .into_handshake()
                    .map_err(|r| ProtocolError::Malformed(format!("{:?}", r)))?;
                if ack.cscs_version != self.session.version {
                    return Err(ProtocolError::VersionMismatch {
                        ours: self.session.version,
                        theirs: ack.cscs_version,
                    }
                    .into());
                }
                if ack.session_id != self.session.id {
                    return Err(ProtocolError::Malformed("ack for a foreign session".into()).into());
                }

                self.persist_at(2)?;
                Ok(None)
            }
            2 | 3 => {
                let half = match self.session.alice_half.clone() {
                    Some(half) => half,
                    None => {
                        let half = self.propose(chain).await?;
                        self.session.alice_half = Some(half.clone());
                        half
                    }
                };

                let mut half_out = half.clone();
                self.hooks.alice_half(&mut half_out);

                self.persist_at(3)?;
                let response = self
                    .call(
                        transport,
                        Request::Negotiate {
                            session_id: self.session.id.clone(),
                            half: half_out,
                        },
                    )
                    .await?;

                let carol_half = response
                    .into_negotiate()
                    .map_err(|r| ProtocolError::Malformed(format!("{:?}", r)))?;

                // The same validation Carol ran on us: both ends must agree
                // on what a sane merge looks like.
                let height = self.height(chain).await?;
                let params =
                    PublicParameters::negotiate(half, carol_half, &self.config, height)?;
                self.session.params = Some(params);

                self.persist_at(4)?;
                Ok(None)
            }
            4 => {
                let params = self.session.params().clone();
                let escrow = params.escrow_alice();
                let value = params.escrow_alice_value();
                let fee = params.fees.funding_alice;

                let utxos = wallet
                    .select_utxos(0, value + fee)
                    .await
                    .map_err(|e| FatalError::WalletSigning(e.to_string()))?;
                let change = wallet
                    .new_address(0, 1)
                    .await
                    .map_err(|e| FatalError::WalletSigning(e.to_string()))?;

                let mut funding = FundingTransaction::new(utxos, &escrow, value, &change, fee)
                    .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
                funding
                    .sign_inputs(wallet)
                    .await
                    .map_err(|e| FatalError::WalletSigning(e.to_string()))?;

                self.session.tx0_txid = Some(funding.txid());
                self.session.funding = Some(funding.transaction().clone());

                // Flushed before the broadcast: a crash right here resumes
                // with an idempotent rebroadcast.
                self.persist_at(5)?;

                chain
                    .broadcast(funding.transaction().clone())
                    .await
                    .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;
                tracing::info!(txid = %funding.txid(), "own funding broadcast");

                Ok(None)
            }
            5 | 6 => {
                // Idempotent: the node already knows the transaction after a
                // crash-restart between persist and broadcast.
                if let Some(funding) = self.session.funding.clone() {
                    chain
                        .broadcast(funding)
                        .await
                        .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;
                }

                let tx2 = self.tx2()?;
                let keys = self.keys();
                let sig_TX2_alice = tx2.sign_cooperative(&keys.fund);
                self.session.sig_TX2_alice = Some(sig_TX2_alice);

                let mut tx0_txid = self.session.tx0_txid.expect("funded at state 5");
                let mut hash_image = self.session.hash_image.expect("set at init");
                let mut sig = sig_TX2_alice;
                self.hooks
                    .funding_announcement(&mut tx0_txid, &mut hash_image, &mut sig);

                self.persist_at(6)?;
                let response = self
                    .call(
                        transport,
                        Request::Tx0idHxTx2Sig {
                            session_id: self.session.id.clone(),
                            tx0_txid,
                            hash_image,
                            sig_TX2_alice: sig,
                        },
                    )
                    .await?;

                let (tx1_txid, sig_TX3_carol) = match response {
                    Response::Funding {
                        tx1_txid,
                        sig_TX3_carol,
                    } => (tx1_txid, sig_TX3_carol),
                    other => {
                        return Err(
                            ProtocolError::Malformed(format!("{:?}", other)).into()
                        )
                    }
                };

                // The announced funding must exist and actually pay the
                // negotiated escrow before we sign anything against it.
                let params = self.session.params().clone();
                let info = self.get_tx_within_timeout(chain, tx1_txid).await?;
                if !check_funding(
                    &info.transaction,
                    &params.escrow_carol(),
                    params.escrow_carol_value(),
                ) {
                    return Err(ProtocolError::WrongFunding { txid: tx1_txid }.into());
                }

                self.session.tx1_txid = Some(tx1_txid);
                let tx3 = self.tx3()?;
                tx3.verify_cooperative_sig(params.carol_keys.fund, &sig_TX3_carol)?;
                self.session.sig_TX3_carol = Some(sig_TX3_carol);

                self.persist_at(7)?;
                Ok(None)
            }
            7 => {
                let tx3 = self.tx3()?;
                let keys = self.keys();
                let sig_TX3_alice = tx3.sign_cooperative(&keys.fund);
                self.session.sig_TX3_alice = Some(sig_TX3_alice);

                let mut sig = sig_TX3_alice;
                self.hooks.tx3_counter_signature(&mut sig);

                self.persist_at(8)?;
                let response = self
                    .call(
                        transport,
                        Request::SigTx3 {
                            session_id: self.session.id.clone(),
                            sig_TX3_alice: sig,
                        },
                    )
                    .await?;

                if !matches!(response, Response::Ack(true)) {
                    return Err(ProtocolError::Malformed(format!("{:?}", response)).into());
                }

                Ok(None)
            }
            8 => {
                self.await_phase2(transport, chain).await?;
                self.persist_at(9)?;
                Ok(None)
            }
            9 | 10 => {
                let mut secret = self.session.secret.expect("set at init");
                self.hooks.secret(&mut secret);

                // The reveal is the irrevocable step; the log must already
                // say we are past it.
                self.persist_at(10)?;
                let response = self
                    .call(
                        transport,
                        Request::Secret {
                            session_id: self.session.id.clone(),
                            secret,
                        },
                    )
                    .await?;

                let sig_TX2_carol = match response {
                    Response::Secret { sig_TX2_carol } => sig_TX2_carol,
                    other => {
                        return Err(ProtocolError::Malformed(format!("{:?}", other)).into())
                    }
                };

                let tx2 = self.tx2()?;
                tx2.verify_cooperative_sig(self.session.params().carol_keys.fund, &sig_TX2_carol)?;
                self.session.sig_TX2_carol = Some(sig_TX2_carol);

                self.persist_at(11)?;
                Ok(None)
            }
            11 => {
                let transaction = self.build_signed_redeem()?;
                self.session.redeem_txid = Some(transaction.txid());

                self.persist_at(12)?;

                chain
                    .broadcast(transaction)
                    .await
                    .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;
                tracing::info!(txid = ?self.session.redeem_txid, "cooperative redeem broadcast");

                Ok(None)
            }
            12 => {
                // Idempotent after a crash between the state-11 persist and
                // the broadcast actually reaching the network.
                let transaction = self.build_signed_redeem()?;
                let redeem_txid = transaction.txid();
                chain
                    .broadcast(transaction)
                    .await
                    .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;

                self.await_redeem(chain, redeem_txid).await?;

                // Our own income leg: Carol normally broadcasts it, but we
                // hold every ingredient, so a sleepy Carol does not stall us.
                self.push_own_payout(chain).await?;

                self.session.outcome = Some(Outcome::Completed);
                self.persist_at(13)?;
                tracing::info!(session_id = %self.session.id, "swap complete");

                Ok(Some(SwapOutcome::Completed { redeem_txid }))
            }
            _ => Ok(Some(SwapOutcome::Completed {
                redeem_txid: self.session.redeem_txid.expect("terminal state has a redeem"),
            })),
        }
    }

    /// Propose the shared parameters: our keys, payout, hash image, timeouts
    /// derived from the current height, and the fee schedule both sides will
    /// build against.
    async fn propose<C: BlockHeight + EstimateFee>(&self, chain: &C) -> Result<AliceHalf, Error> {
        let height = self.height(chain).await?;
        let estimator = FeeEstimator::new(chain, &self.config);

        let funding_fee = estimator.normal(funding_vbytes(2, 2)).await?;
        let redeem_fee = estimator.normal(COOP_SPEND_VBYTES).await?;
        let claim_fee = estimator.normal(SECRET_SPEND_VBYTES).await?;

        let keys = self.keys();
        let payout_address = payout_address(&keys, &self.config);

        Ok(AliceHalf {
            keys: keys.public(),
            payout_address,
            hash_image: self.session.hash_image.expect("set at init"),
            timeouts: Timeouts {
                L0: height + self.config.l0_offset,
                L1: height + self.config.l1_offset,
                L2: height + self.config.l2_offset,
            },
            amount: Amount::from_sat(self.session.amount_sat.unwrap_or(0)),
            coinswap_fee: Amount::from_sat(self.session.coinswap_fee_sat.unwrap_or(0)),
            fees: TxFees {
                funding_alice: funding_fee,
                funding_carol: funding_fee,
                redeem_escrow_alice: redeem_fee,
                redeem_escrow_carol: redeem_fee,
                claim_escrow_alice: claim_fee,
                claim_escrow_carol: claim_fee,
            },
        })
    }

    /// Wait until both fundings are deep enough and there is still safe
    /// distance to our own timeout, and the server agrees.
    async fn await_phase2<T, C>(&mut self, transport: &mut T, chain: &C) -> Result<(), Error>
    where
        T: CallServer,
        C: BlockHeight + GetTransaction + GetSpendingTransaction,
    {
        let params = self.session.params().clone();
        let tx0_txid = self.session.tx0_txid.expect("funded at state 5");
        let tx1_txid = self.session.tx1_txid.expect("verified at state 7");

        loop {
            self.check_events(chain).await?;

            let height = self.height(chain).await?;
            if height + self.config.timeout_safety >= params.timeouts.L1 {
                return Err(TimeoutError::ChainDeadline {
                    deadline: params.timeouts.L1,
                    waiting_for: "funding confirmations".to_string(),
                }
                .into());
            }

            let deep = |info: &Option<TxInfo>| {
                info.as_ref()
                    .map(|i| i.confirmations >= self.config.tx01_confirm_wait)
                    .unwrap_or(false)
            };
            let tx0 = self.get_tx(chain, tx0_txid).await?;
            let tx1 = self.get_tx(chain, tx1_txid).await?;

            if deep(&tx0) && deep(&tx1) {
                let response = self
                    .call(
                        transport,
                        Request::Phase2Ready {
                            session_id: self.session.id.clone(),
                        },
                    )
                    .await?;

                if matches!(response, Response::Ack(true)) {
                    return Ok(());
                }
            }

            tokio::time::delay_for(self.config.poll_interval).await;
        }
    }

    async fn await_redeem<C>(&mut self, chain: &C, redeem_txid: Txid) -> Result<(), Error>
    where
        C: BlockHeight + GetTransaction + GetSpendingTransaction + BroadcastTransaction,
    {
        let deadline = self.session.params().timeouts.L1;

        loop {
            self.check_events(chain).await?;

            if let Some(info) = self.get_tx(chain, redeem_txid).await? {
                if info.confirmations >= self.config.redeem_confirm_depth {
                    return Ok(());
                }
            }

            let height = self.height(chain).await?;
            if height >= deadline {
                return Err(TimeoutError::ChainDeadline {
                    deadline,
                    waiting_for: "cooperative redeem confirmation".to_string(),
                }
                .into());
            }

            tokio::time::delay_for(self.config.poll_interval).await;
        }
    }

    /// If Carol has not collected our payout for us, broadcast the fully
    /// signed income leg ourselves.
    async fn push_own_payout<C>(&self, chain: &C) -> Result<(), Error>
    where
        C: GetSpendingTransaction + BroadcastTransaction,
    {
        let tx1_txid = self.session.tx1_txid.expect("verified at state 7");
        let outpoint = OutPoint::new(tx1_txid, 0);

        let spent = chain
            .spending_tx(outpoint)
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;
        if spent.is_some() {
            return Ok(());
        }

        let tx3 = self.tx3()?;
        let keys = self.keys();
        let sig_alice = tx3.sign_cooperative(&keys.fund);
        let sig_carol = self.session.sig_TX3_carol.expect("verified at state 7");
        let secret = self.session.secret.expect("set at init");

        let transaction = tx3.add_cooperative_witness(&sig_carol, &sig_alice, &secret);
        tracing::info!(txid = %transaction.txid(), "pushing own payout");
        chain
            .broadcast(transaction)
            .await
            .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;

        Ok(())
    }

    /// Monitor tick. Deadline expiry and hostile spends surface as errors so
    /// the step loop converts them into a backout.
    async fn check_events<C>(&mut self, chain: &C) -> Result<(), Error>
    where
        C: BlockHeight + GetTransaction + GetSpendingTransaction,
    {
        let events = self
            .monitor
            .poll(chain)
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;

        for event in events {
            match event {
                WatchEvent::Confirmed { .. } => {}
                WatchEvent::PreimageRevealed { .. } => {
                    // We chose the preimage; nothing new here.
                }
                WatchEvent::Reorged { txid } => {
                    tracing::warn!(%txid, "reorg noticed, continuing to watch");
                }
                WatchEvent::TimedOut {
                    txid,
                    deadline_height,
                } => {
                    return Err(TimeoutError::ChainDeadline {
                        deadline: deadline_height,
                        waiting_for: format!("confirmation of {}", txid),
                    }
                    .into());
                }
                WatchEvent::UnexpectedSpend {
                    outpoint,
                    transaction,
                    ..
                } => {
                    return Err(ProtocolError::Malformed(format!(
                        "escrow {} spent by {} outside the protocol",
                        outpoint,
                        transaction.txid()
                    ))
                    .into());
                }
            }
        }

        Ok(())
    }

    async fn backout<T, W, C>(
        &mut self,
        error: Error,
        transport: &mut T,
        wallet: &W,
        chain: &C,
    ) -> Result<SwapOutcome, FatalError>
    where
        T: CallServer,
        W: NewAddress,
        C: BlockHeight
            + GetTransaction
            + BroadcastTransaction
            + EstimateFee
            + GetSpendingTransaction,
    {
        let reason = format!("{}", error);
        tracing::warn!(session_id = %self.session.id, %reason, "backing out");

        self.monitor.clear();
        self.session.backout_reason = Some(reason.clone());
        self.session.outcome = Some(Outcome::BackedOut);
        self.store.persist(&self.session)?;

        let mut claim_txid = None;
        let mut refund_txid = None;

        match backout::plan_for(Role::Alice, self.session.state_index) {
            Plan::Abort => {}
            Plan::Refund => {
                refund_txid = self.refund(wallet, chain).await;
                // The refund can only lose the output to a counterparty who
                // spent through the secret branch; that spend is the licence
                // to race the mirror claim on her escrow.
                if refund_txid.is_none() {
                    claim_txid = self.race_counterparty_claim(chain).await;
                }
            }
            Plan::ClaimThenRefund => {
                self.announce_secret_path(transport).await;
                claim_txid = self.claim(chain).await;
                if claim_txid.is_none() {
                    refund_txid = self.refund(wallet, chain).await;
                }
            }
        }

        self.store.persist(&self.session)?;

        Ok(SwapOutcome::BackedOut {
            reason,
            claim_txid,
            refund_txid,
        })
    }

    /// Only valid after the chain itself showed the counterparty spending
    /// our escrow through the secret branch: extract nothing, claim nothing,
    /// unless her spend carries the preimage.
    async fn race_counterparty_claim<C>(&mut self, chain: &C) -> Option<Txid>
    where
        C: BlockHeight + GetTransaction + BroadcastTransaction + EstimateFee + GetSpendingTransaction,
    {
        let tx0_txid = self.session.tx0_txid?;
        let hash_image = self.session.hash_image?;

        let spend = chain
            .spending_tx(OutPoint::new(tx0_txid, 0))
            .await
            .ok()??;
        extract_preimage(&spend, &hash_image)?;

        tracing::warn!(
            txid = %spend.txid(),
            "counterparty claimed through the secret branch, racing the mirror claim"
        );

        self.claim(chain).await
    }

    /// Claim Carol's escrow through the secret branch. We always know the
    /// preimage; the only questions are whether her funding exists and
    /// whether her timeout is still far enough away.
    async fn claim<C>(&mut self, chain: &C) -> Option<Txid>
    where
        C: BlockHeight + GetTransaction + BroadcastTransaction + EstimateFee,
    {
        let params = self.session.params.clone()?;
        let tx1_txid = self.session.tx1_txid?;
        let secret = self.session.secret?;
        let keys = self.session.keys.clone()?;

        let escrow = params.escrow_carol();
        let result = backout::claim_escrow(
            chain,
            &self.config,
            &escrow,
            OutPoint::new(tx1_txid, 0),
            params.escrow_carol_value(),
            &keys.backout,
            &secret,
            &params.alice_payout,
            Some(params.fees.claim_escrow_carol),
        )
        .await;

        match result {
            Ok(txid) => {
                self.session.redeem_txid = Some(txid);
                Some(txid)
            }
            Err(error) => {
                tracing::warn!(%error, "secret-branch claim failed");
                None
            }
        }
    }

    async fn refund<W, C>(&mut self, wallet: &W, chain: &C) -> Option<Txid>
    where
        W: NewAddress,
        C: BlockHeight
            + GetTransaction
            + BroadcastTransaction
            + EstimateFee
            + GetSpendingTransaction,
    {
        let params = self.session.params.clone()?;
        let tx0_txid = self.session.tx0_txid?;
        let keys = self.session.keys.clone()?;

        let destination = match wallet.new_address(1, 1).await {
            Ok(address) => address,
            Err(error) => {
                tracing::error!(%error, "wallet refused a refund address");
                return None;
            }
        };

        let escrow = params.escrow_alice();
        let result = backout::refund_escrow(
            chain,
            &self.config,
            &escrow,
            OutPoint::new(tx0_txid, 0),
            params.escrow_alice_value(),
            &keys.backout,
            &destination,
        )
        .await;

        match result {
            Ok(txid) => Some(txid),
            Err(error) => {
                tracing::warn!(%error, "timeout refund failed");
                None
            }
        }
    }

    /// Re-register every watch derivable from the session. Idempotent, so
    /// it runs at the top of each step; this is also what restores watches
    /// after a resume.
    fn rewatch(&mut self) {
        let params = match &self.session.params {
            Some(params) => params.clone(),
            None => return,
        };

        if let Some(tx0_txid) = self.session.tx0_txid {
            self.monitor
                .watch_tx(tx0_txid, self.config.tx01_confirm_wait, Some(params.timeouts.L0));

            let allowed = [self.tx2(), self.tx4()]
                .iter()
                .filter_map(|tx| tx.as_ref().ok().map(SpendTransaction::txid))
                .collect();
            self.monitor.watch_outpoint(OutPoint::new(tx0_txid, 0), allowed);
        }

        if let Some(tx1_txid) = self.session.tx1_txid {
            self.monitor
                .watch_tx(tx1_txid, self.config.tx01_confirm_wait, Some(params.timeouts.L0));

            let allowed = [self.tx3(), self.tx5()]
                .iter()
                .filter_map(|tx| tx.as_ref().ok().map(SpendTransaction::txid))
                .collect();
            self.monitor.watch_outpoint(OutPoint::new(tx1_txid, 0), allowed);
        }
    }

    /// Best-effort courtesy when settling through the secret branches: our
    /// co-signature over Carol's sweep of our escrow, plus the txid of our
    /// claim so her monitor recognises it as negotiated. A dead counterparty
    /// just means nobody is listening.
    async fn announce_secret_path<T: CallServer>(&mut self, transport: &mut T) {
        let announcement = (|| -> Result<Request, Error> {
            let keys = self.keys();
            let sig_TX4_alice = self.tx4()?.sign_cooperative(&keys.fund);
            self.session.sig_TX4_alice = Some(sig_TX4_alice);
            let tx5_txid = self.tx5()?.txid();
            self.session.tx5_txid = Some(tx5_txid);

            Ok(Request::SigTx4 {
                session_id: self.session.id.clone(),
                sig_TX4_alice,
                tx5_txid,
            })
        })();

        match announcement {
            Ok(request) => {
                if let Err(error) = self.call(transport, request).await {
                    tracing::debug!(%error, "secret-path announcement not delivered");
                }
            }
            Err(error) => tracing::debug!(%error, "secret-path announcement not available"),
        }
    }

    fn build_signed_redeem(&self) -> Result<bitcoin::Transaction, Error> {
        let tx2 = self.tx2()?;
        let sig_alice = self.session.sig_TX2_alice.expect("signed at state 6");
        let sig_carol = self.session.sig_TX2_carol.expect("stored at state 11");
        let secret = self.session.secret.expect("set at init");

        Ok(tx2.add_cooperative_witness(&sig_alice, &sig_carol, &secret))
    }

    fn tx2(&self) -> Result<SpendTransaction, Error> {
        let params = self.session.params();
        let tx0_txid = self.session.tx0_txid.expect("funded before TX2 exists");

        SpendTransaction::new(
            &params.escrow_alice(),
            OutPoint::new(tx0_txid, 0),
            params.escrow_alice_value(),
            &params.carol_payout,
            params.fees.redeem_escrow_alice,
            0,
        )
        .map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    fn tx3(&self) -> Result<SpendTransaction, Error> {
        let params = self.session.params();
        let tx1_txid = self.session.tx1_txid.expect("verified before TX3 exists");

        SpendTransaction::new(
            &params.escrow_carol(),
            OutPoint::new(tx1_txid, 0),
            params.escrow_carol_value(),
            &params.alice_payout,
            params.fees.redeem_escrow_carol,
            0,
        )
        .map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    fn tx4(&self) -> Result<SpendTransaction, Error> {
        let params = self.session.params();
        let tx0_txid = self.session.tx0_txid.expect("funded before TX4 exists");

        SpendTransaction::new(
            &params.escrow_alice(),
            OutPoint::new(tx0_txid, 0),
            params.escrow_alice_value(),
            &params.carol_payout,
            params.fees.claim_escrow_alice,
            0,
        )
        .map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    fn tx5(&self) -> Result<SpendTransaction, Error> {
        let params = self.session.params();
        let tx1_txid = self.session.tx1_txid.expect("verified before TX5 exists");

        SpendTransaction::new(
            &params.escrow_carol(),
            OutPoint::new(tx1_txid, 0),
            params.escrow_carol_value(),
            &params.alice_payout,
            params.fees.claim_escrow_carol,
            0,
        )
        .map_err(|e| ProtocolError::Malformed(e.to_string()).into())
    }

    async fn call<T: CallServer>(
        &self,
        transport: &mut T,
        request: Request,
    ) -> Result<Response, Error> {
        let method = request.method();
        let timeout = self.config.default_server_timeout;

        match tokio::time::timeout(timeout, transport.call(request)).await {
            Err(_) => Err(TimeoutError::Rpc(timeout).into()),
            Ok(Err(error)) => Err(ProtocolError::Malformed(error.to_string()).into()),
            Ok(Ok(response)) if response.is_refusal() => {
                Err(ProtocolError::Refused { method }.into())
            }
            Ok(Ok(response)) => Ok(response),
        }
    }

    async fn height<C: BlockHeight>(&self, chain: &C) -> Result<u32, Error> {
        chain
            .block_height()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()).into())
    }

    async fn get_tx<C: GetTransaction>(
        &self,
        chain: &C,
        txid: Txid,
    ) -> Result<Option<TxInfo>, Error> {
        chain
            .get_tx(txid)
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()).into())
    }

    /// A freshly announced funding may not have propagated yet; poll for a
    /// short while before declaring it bogus.
    async fn get_tx_within_timeout<C: GetTransaction>(
        &self,
        chain: &C,
        txid: Txid,
    ) -> Result<TxInfo, Error> {
        let attempts = 5u32;
        for _ in 0..attempts {
            if let Some(info) = self.get_tx(chain, txid).await? {
                return Ok(info);
            }

            tokio::time::delay_for(self.config.poll_interval).await;
        }

        Err(ProtocolError::WrongFunding { txid }.into())
    }

    fn keys(&self) -> PartyKeyPairs {
        self.session.keys.clone().expect("keys are set at init")
    }

    fn persist_at(&mut self, state_index: u32) -> Result<(), FatalError> {
        self.session.advance(state_index);
        self.store.persist(&self.session)
    }
}

pub(crate) fn payout_address(keys: &PartyKeyPairs, config: &Config) -> Address {
    Address::p2wpkh(
        &PublicKey {
            compressed: true,
            key: keys.redeem.public().into(),
        },
        config.network,
    )
}
