use crate::{
    alice::payout_address,
    backout::{self, Plan},
    config::Config,
    error::{ChainError, Error, FatalError, ProtocolError},
    fee::FeeEstimator,
    hooks::{Honest, Hooks},
    keys::{HashImage, PartyKeyPairs, Preimage},
    monitor::{Monitor, WatchEvent},
    params::{AliceHalf, CarolHalf, PublicParameters},
    rpc::{Handshake, HandshakeAck},
    session::{Outcome, Session, SessionStore},
    traits::{
        BlockHeight, BroadcastTransaction, EstimateFee, GetSpendingTransaction, GetTransaction,
        NewAddress, SelectUtxos, SignInput,
    },
    transaction::{
        check_funding, FundingTransaction, SpendTransaction, SECRET_SPEND_VBYTES,
        TIMEOUT_SPEND_VBYTES,
    },
    Role, SessionId, PROTOCOL_VERSION,
};
use bitcoin::{secp256k1::Signature, OutPoint, Txid};
use std::time::{SystemTime, UNIX_EPOCH};

// Carol's state indices. Hers is the mirror image of Alice's sequence,
// driven by inbound calls instead of outbound ones.
const AWAITING_NEGOTIATE: u32 = 0;
const NEGOTIATED: u32 = 1;
const FUNDED: u32 = 2;
const TX3_COSIGNED: u32 = 3;
const SECRET_KNOWN: u32 = 4;
const DONE: u32 = 5;

/// Incremental fee-escalation state for a punitive spend the poll loop is
/// pushing one attempt at a time.
#[derive(Debug, Default)]
struct PushState {
    bump: u32,
    attempts: Vec<Txid>,
}

/// One server-side session. All methods are entered serially by the server
/// loop; each inbound method is valid in exactly one state (repeats of the
/// previous call replay the recorded reply, which is what makes the wire
/// at-least-once safe).
#[derive(Debug)]
pub struct Carol<H = Honest> {
    session: Session,
    config: Config,
    store: SessionStore,
    monitor: Monitor,
    hooks: H,
    claim_push: PushState,
    refund_push: PushState,
    redeem_pending: bool,
}

impl<H: Hooks> Carol<H> {
    pub fn new(
        config: Config,
        store: SessionStore,
        handshake: &Handshake,
        hooks: H,
    ) -> Result<(Self, HandshakeAck), Error> {
        if handshake.cscs_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                ours: PROTOCOL_VERSION,
                theirs: handshake.cscs_version,
            }
            .into());
        }
        if handshake.source_chain != config.source_chain
            || handshake.destination_chain != config.destination_chain
        {
            return Err(ProtocolError::Malformed("unsupported chain pair".into()).into());
        }
        if handshake.amount < config.minimum_amount || handshake.amount > config.maximum_amount {
            return Err(crate::error::ConfigError::AmountOutOfBounds {
                amount: handshake.amount,
                minimum: config.minimum_amount,
                maximum: config.maximum_amount,
            }
            .into());
        }

        let mut session = Session::new(handshake.session_id.clone(), Role::Carol, PROTOCOL_VERSION);
        session.keys = Some(PartyKeyPairs::new_random());
        session.amount_sat = Some(handshake.amount.as_sat());
        store.persist(&session)?;

        let mut ack = HandshakeAck {
            session_id: session.id.clone(),
            cscs_version: PROTOCOL_VERSION,
        };
        hooks.handshake_ack(&mut ack);

        tracing::info!(session_id = %session.id, "server session initialised");

        Ok((
            Self {
                session,
                config,
                store,
                monitor: Monitor::new(),
                hooks,
                claim_push: PushState::default(),
                refund_push: PushState::default(),
                redeem_pending: false,
            },
            ack,
        ))
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn state_index(&self) -> u32 {
        self.session.state_index
    }

    pub fn is_live(&self) -> bool {
        self.session.outcome.is_none() && self.session.state_index < DONE
    }

    /// Replay the handshake ack for a duplicated handshake of the same
    /// session (the client may resend after a crash before our reply landed).
    pub fn replay_handshake(&self, handshake: &Handshake) -> Option<HandshakeAck> {
        if self.session.state_index == AWAITING_NEGOTIATE
            && self.session.amount_sat == Some(handshake.amount.as_sat())
        {
            return Some(HandshakeAck {
                session_id: self.session.id.clone(),
                cscs_version: PROTOCOL_VERSION,
            });
        }

        None
    }

    pub async fn negotiate<C: BlockHeight>(
        &mut self,
        chain: &C,
        half: AliceHalf,
    ) -> Result<CarolHalf, Error> {
        if self.session.state_index >= NEGOTIATED {
            // replay: identical proposal gets the identical answer
            if self.session.alice_half.as_ref() == Some(&half) {
                return Ok(self.carol_half());
            }
            return Err(self.unexpected(crate::rpc::Method::Negotiate));
        }

        if Some(half.amount.as_sat()) != self.session.amount_sat {
            return Err(ProtocolError::Malformed(
                "negotiated amount differs from handshake".into(),
            )
            .into());
        }

        let height = self.height(chain).await?;
        let carol_half = self.carol_half();
        let params =
            PublicParameters::negotiate(half.clone(), carol_half.clone(), &self.config, height)?;

        self.monitor.set_hash_image(params.hash_image);
        self.session.hash_image = Some(params.hash_image);
        self.session.alice_half = Some(half);
        self.session.params = Some(params);
        self.persist_at(NEGOTIATED)?;

        let mut out = carol_half;
        self.hooks.carol_half(&mut out);

        Ok(out)
    }

    /// Alice announced her funding. Verify it, fund our own side, and hand
    /// back our funding txid plus the co-signature on her payout leg.
    pub async fn on_funding<W, C>(
        &mut self,
        wallet: &W,
        chain: &C,
        tx0_txid: Txid,
        hash_image: HashImage,
        sig_TX2_alice: Signature,
    ) -> Result<(Txid, Signature), Error>
    where
        W: NewAddress + SelectUtxos + SignInput,
        C: GetTransaction + BroadcastTransaction,
    {
        if self.session.state_index >= FUNDED {
            if self.session.tx0_txid == Some(tx0_txid) {
                let tx1_txid = self.session.tx1_txid.expect("funded");
                let sig = self.session.sig_TX3_carol.expect("funded");
                return Ok((tx1_txid, sig));
            }
            return Err(self.unexpected(crate::rpc::Method::Tx0idHxTx2Sig));
        }
        if self.session.state_index < NEGOTIATED {
            return Err(self.unexpected(crate::rpc::Method::Tx0idHxTx2Sig));
        }

        let params = self.session.params().clone();

        if hash_image != params.hash_image {
            return Err(ProtocolError::Malformed("hash image changed after negotiation".into()).into());
        }

        let info = self
            .get_tx_within_timeout(chain, tx0_txid)
            .await?
            .ok_or(ProtocolError::WrongFunding { txid: tx0_txid })?;
        if !check_funding(
            &info.transaction,
            &params.escrow_alice(),
            params.escrow_alice_value(),
        ) {
            return Err(ProtocolError::WrongFunding { txid: tx0_txid }.into());
        }
        self.session.tx0_txid = Some(tx0_txid);

        // Her signature over her own escrow's redeem. It only becomes
        // spendable together with the preimage, so holding it early is safe
        // for her and essential for us.
        let tx2 = self.tx2()?;
        tx2.verify_cooperative_sig(params.alice_keys.fund, &sig_TX2_alice)?;
        self.session.sig_TX2_alice = Some(sig_TX2_alice);

        let escrow = params.escrow_carol();
        let value = params.escrow_carol_value();
        let fee = params.fees.funding_carol;

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

        self.session.tx1_txid = Some(funding.txid());
        self.session.funding = Some(funding.transaction().clone());

        let tx3 = self.tx3()?;
        let sig_TX3_carol = tx3.sign_cooperative(&self.keys().fund);
        self.session.sig_TX3_carol = Some(sig_TX3_carol);

        // Log first, then broadcast.
        self.persist_at(FUNDED)?;

        chain
            .broadcast(funding.transaction().clone())
            .await
            .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;
        tracing::info!(txid = %funding.txid(), "own funding broadcast");

        self.rewatch();

        let mut tx1_txid = funding.txid();
        let mut sig = sig_TX3_carol;
        self.hooks.funding_reply(&mut tx1_txid, &mut sig);

        Ok((tx1_txid, sig))
    }

    pub fn on_sigtx3(&mut self, sig_TX3_alice: Signature) -> Result<(), Error> {
        if self.session.state_index >= TX3_COSIGNED {
            if self.session.sig_TX3_alice == Some(sig_TX3_alice) {
                return Ok(());
            }
            return Err(self.unexpected(crate::rpc::Method::SigTx3));
        }
        if self.session.state_index < FUNDED {
            return Err(self.unexpected(crate::rpc::Method::SigTx3));
        }

        let tx3 = self.tx3()?;
        tx3.verify_cooperative_sig(self.session.params().alice_keys.fund, &sig_TX3_alice)?;
        self.session.sig_TX3_alice = Some(sig_TX3_alice);
        self.persist_at(TX3_COSIGNED)?;

        Ok(())
    }

    /// Readiness only; nothing advances here. Alice combines this with her
    /// own view of the chain.
    pub async fn phase2_ready<C>(&self, chain: &C) -> Result<bool, Error>
    where
        C: BlockHeight + GetTransaction,
    {
        if self.session.state_index < FUNDED {
            return Ok(false);
        }

        let params = self.session.params().clone();
        let height = self.height(chain).await?;
        if height + self.config.timeout_safety >= params.timeouts.L1 {
            return Ok(false);
        }

        for txid in &[self.session.tx0_txid, self.session.tx1_txid] {
            let deep = match txid {
                Some(txid) => chain
                    .get_tx(*txid)
                    .await
                    .map_err(|e| ChainError::Unreachable(e.to_string()))?
                    .map(|info| info.confirmations >= self.config.tx01_confirm_wait)
                    .unwrap_or(false),
                None => false,
            };
            if !deep {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// The reveal. After this both escrows are claimable by their intended
    /// owners; we answer with our co-signature on her escrow's redeem and
    /// broadcast her payout leg.
    pub async fn on_secret<C>(&mut self, chain: &C, secret: Preimage) -> Result<Signature, Error>
    where
        C: BroadcastTransaction,
    {
        if self.session.state_index >= SECRET_KNOWN {
            if self.session.secret == Some(secret) {
                return Ok(self.session.sig_TX2_carol.expect("signed at reveal"));
            }
            return Err(self.unexpected(crate::rpc::Method::Secret));
        }
        if self.session.state_index < TX3_COSIGNED {
            return Err(self.unexpected(crate::rpc::Method::Secret));
        }

        let params = self.session.params().clone();
        if secret.hash() != params.hash_image {
            // A fake preimage dooms the session: mark it for the timeout
            // path before refusing.
            self.mark_backed_out("received a preimage that does not hash to the image")?;
            return Err(ProtocolError::BadPreimage.into());
        }

        self.session.secret = Some(secret);

        let tx2 = self.tx2()?;
        let mut sig_TX2_carol = tx2.sign_cooperative(&self.keys().fund);
        self.hooks.secret_reply(&mut sig_TX2_carol);
        self.session.sig_TX2_carol = Some(sig_TX2_carol);

        let tx3 = self.tx3()?;
        self.session.redeem_txid = Some(tx3.txid());

        // Handing out the signature is irreversible; the log goes first.
        self.persist_at(SECRET_KNOWN)?;

        match self.build_redeem() {
            Ok(transaction) => {
                if let Err(error) = chain.broadcast(transaction).await {
                    tracing::warn!(%error, "payout broadcast refused, poll will retry");
                    self.redeem_pending = true;
                }
            }
            Err(error) => tracing::error!(%error, "payout leg could not be built"),
        }

        self.rewatch();

        Ok(sig_TX2_carol)
    }

    /// Alice's announcement that she settles through the secret path: her
    /// cooperative signature over our claim of her escrow, and the txid of
    /// her claim of ours so the monitor knows it is negotiated.
    pub fn on_sigtx4(&mut self, sig_TX4_alice: Signature, tx5_txid: Txid) -> Result<(), Error> {
        if self.session.state_index < FUNDED {
            return Err(self.unexpected(crate::rpc::Method::SigTx4));
        }
        if self.session.sig_TX4_alice == Some(sig_TX4_alice)
            && self.session.tx5_txid == Some(tx5_txid)
        {
            return Ok(());
        }

        let tx4 = self.tx4()?;
        tx4.verify_cooperative_sig(self.session.params().alice_keys.fund, &sig_TX4_alice)?;

        self.session.sig_TX4_alice = Some(sig_TX4_alice);
        self.session.tx5_txid = Some(tx5_txid);
        self.store.persist(&self.session)?;

        if let Some(tx1_txid) = self.session.tx1_txid {
            self.monitor.allow_spend(OutPoint::new(tx1_txid, 0), tx5_txid);
        }

        Ok(())
    }

    /// True once Alice's escrow has settled in our favor (her push of the
    /// redeem, or our claim) with at least one confirmation. A spend that
    /// does not pay our payout script, such as her timeout reclaim, is not
    /// a settlement.
    pub async fn confirm_tx4<C>(&self, chain: &C) -> Result<bool, Error>
    where
        C: GetTransaction + GetSpendingTransaction,
    {
        let tx0_txid = match self.session.tx0_txid {
            Some(txid) => txid,
            None => return Ok(false),
        };
        let params = match &self.session.params {
            Some(params) => params,
            None => return Ok(false),
        };

        let spend = chain
            .spending_tx(OutPoint::new(tx0_txid, 0))
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;

        match spend {
            Some(transaction) => {
                let pays_us = transaction
                    .output
                    .get(0)
                    .map(|output| output.script_pubkey == params.carol_payout.script_pubkey())
                    .unwrap_or(false);
                if !pays_us {
                    return Ok(false);
                }

                let confirmations = chain
                    .get_tx(transaction.txid())
                    .await
                    .map_err(|e| ChainError::Unreachable(e.to_string()))?
                    .map(|info| info.confirmations)
                    .unwrap_or(0);
                Ok(confirmations >= 1)
            }
            None => Ok(false),
        }
    }

    /// One tick of chain-driven work: watches, deadlines, pending
    /// broadcasts, punitive pushes, completion. The server calls this on its
    /// poll cadence; nothing here blocks beyond single chain queries.
    pub async fn poll<W, C>(&mut self, wallet: &W, chain: &C) -> Result<(), FatalError>
    where
        W: NewAddress,
        C: BlockHeight
            + GetTransaction
            + BroadcastTransaction
            + EstimateFee
            + GetSpendingTransaction,
    {
        if self.session.state_index >= DONE {
            return Ok(());
        }

        self.rewatch();

        let events = match self.monitor.poll(chain).await {
            Ok(events) => events,
            Err(error) => {
                tracing::debug!(%error, "monitor poll failed");
                return Ok(());
            }
        };
        for event in events {
            self.handle_event(event)?;
        }

        if self.session.outcome == Some(Outcome::BackedOut) {
            self.drive_backout(wallet, chain).await?;
            return Ok(());
        }

        // Wall-clock staleness: a silent counterparty converts into a
        // backout, with or without anything to reclaim.
        let stale = now().saturating_sub(self.session.updated_at)
            > self.config.default_server_timeout.as_secs();
        if stale && self.session.state_index < SECRET_KNOWN {
            self.mark_backed_out("no progress within the server timeout")?;
            return Ok(());
        }

        if self.session.state_index == SECRET_KNOWN {
            self.drive_settlement(chain).await?;
        }

        Ok(())
    }

    fn handle_event(&mut self, event: WatchEvent) -> Result<(), FatalError> {
        match event {
            WatchEvent::Confirmed { .. } => {}
            WatchEvent::PreimageRevealed { preimage, .. } => {
                // Alice settled through a secret branch (announced or not):
                // the preimage on chain is our licence to sweep her escrow.
                if self.session.secret.is_none() {
                    tracing::info!(session_id = %self.session.id, "adopting preimage from chain");
                    self.session.secret = Some(preimage);
                }
                if self.session.state_index < SECRET_KNOWN {
                    self.mark_backed_out("counterparty settled through the secret path")?;
                }
            }
            WatchEvent::Reorged { txid } => {
                tracing::warn!(%txid, "reorg noticed, continuing to watch");
            }
            WatchEvent::TimedOut { txid, .. } => {
                self.mark_backed_out(&format!("{} missed its confirmation deadline", txid))?;
            }
            WatchEvent::UnexpectedSpend {
                outpoint,
                transaction,
                preimage,
            } => {
                // A spend of our escrow that reveals the preimage is the
                // racing path: adopt the secret and claim her escrow.
                if let Some(preimage) = preimage {
                    tracing::warn!(
                        %outpoint,
                        txid = %transaction.txid(),
                        "preimage revealed on chain, racing the claim"
                    );
                    self.session.secret = Some(preimage);
                }
                self.mark_backed_out(&format!(
                    "escrow {} spent by {} outside the protocol",
                    outpoint,
                    transaction.txid()
                ))?;
            }
        }

        Ok(())
    }

    /// Backout work, one attempt per tick. With the preimage: claim Alice's
    /// escrow through the secret branch. Without it: reclaim our own funding
    /// once its timeout passes.
    async fn drive_backout<W, C>(&mut self, wallet: &W, chain: &C) -> Result<(), FatalError>
    where
        W: NewAddress,
        C: BlockHeight
            + GetTransaction
            + BroadcastTransaction
            + EstimateFee
            + GetSpendingTransaction,
    {
        match backout::plan_for(Role::Carol, self.session.state_index) {
            Plan::Abort => Ok(()),
            Plan::Refund if self.session.secret.is_some() => self.try_claim_once(chain).await,
            Plan::Refund => self.try_refund_once(wallet, chain).await,
            Plan::ClaimThenRefund => {
                // Claim what is claimable; fall back to our refund if her
                // escrow is already gone.
                if self.claim_target_available(chain).await {
                    self.try_claim_once(chain).await
                } else {
                    self.try_refund_once(wallet, chain).await
                }
            }
        }
    }

    /// Happy-path settlement after the reveal: keep the payout leg alive and
    /// make sure Alice's escrow ends up with us even if she never pushes the
    /// redeem herself.
    async fn drive_settlement<C>(&mut self, chain: &C) -> Result<(), FatalError>
    where
        C: BlockHeight
            + GetTransaction
            + BroadcastTransaction
            + EstimateFee
            + GetSpendingTransaction,
    {
        let params = self.session.params().clone();

        if self.redeem_pending {
            if let Ok(transaction) = self.build_redeem() {
                if chain.broadcast(transaction).await.is_ok() {
                    self.redeem_pending = false;
                }
            }
        }

        let height = match chain.block_height().await {
            Ok(height) => height,
            Err(_) => return Ok(()),
        };

        // If her escrow is still unspent while her refund window creeps
        // closer, stop waiting for her push and claim it ourselves.
        let escrow_a_unspent = self.claim_target_available(chain).await;
        if escrow_a_unspent && height + self.config.timeout_safety >= params.timeouts.L1 {
            self.try_claim_once(chain).await?;
        }

        let redeem_confirmed = match self.session.redeem_txid {
            Some(txid) => chain
                .get_tx(txid)
                .await
                .ok()
                .flatten()
                .map(|info| info.confirmations >= self.config.redeem_confirm_depth)
                .unwrap_or(false),
            None => false,
        };

        let incoming_settled = match self.confirm_tx4(chain).await {
            Ok(settled) => settled,
            Err(_) => false,
        };

        if redeem_confirmed && incoming_settled {
            self.session.outcome = Some(Outcome::Completed);
            self.persist_at(DONE)?;
            tracing::info!(session_id = %self.session.id, "swap complete");
        }

        Ok(())
    }

    async fn claim_target_available<C: GetSpendingTransaction>(&self, chain: &C) -> bool {
        match self.session.tx0_txid {
            Some(tx0_txid) => chain
                .spending_tx(OutPoint::new(tx0_txid, 0))
                .await
                .map(|spend| spend.is_none())
                .unwrap_or(false),
            None => false,
        }
    }

    /// One secret-branch claim attempt of Alice's escrow at the current fee
    /// bump.
    async fn try_claim_once<C>(&mut self, chain: &C) -> Result<(), FatalError>
    where
        C: BlockHeight + GetTransaction + BroadcastTransaction + EstimateFee,
    {
        let (params, secret, keys) = match (
            self.session.params.clone(),
            self.session.secret,
            self.session.keys.clone(),
        ) {
            (Some(params), Some(secret), Some(keys)) => (params, secret, keys),
            _ => return Ok(()),
        };
        let tx0_txid = match self.session.tx0_txid {
            Some(txid) => txid,
            None => return Ok(()),
        };

        for txid in &self.claim_push.attempts {
            if let Ok(Some(info)) = chain.get_tx(*txid).await {
                if info.confirmations >= 1 {
                    return Ok(());
                }
            }
        }

        let estimator = FeeEstimator::new(chain, &self.config);
        let fee = match estimator
            .backout(SECRET_SPEND_VBYTES, self.claim_push.bump)
            .await
        {
            Ok(fee) => fee,
            Err(_) => return Ok(()),
        };

        let spend = SpendTransaction::new(
            &params.escrow_alice(),
            OutPoint::new(tx0_txid, 0),
            params.escrow_alice_value(),
            &params.carol_payout,
            fee,
            0,
        );
        let spend = match spend {
            Ok(spend) => spend,
            Err(error) => {
                tracing::error!(%error, "claim could not be built");
                return Ok(());
            }
        };

        let sig = spend.sign_backout(&keys.backout);
        let transaction = spend.add_secret_witness(&sig, &secret);
        let txid = transaction.txid();

        match chain.broadcast(transaction).await {
            Ok(_) => {
                if !self.claim_push.attempts.contains(&txid) {
                    self.claim_push.attempts.push(txid);
                }
                // Our own fee-bumped attempts are negotiated spends as far
                // as the watch is concerned.
                self.monitor.allow_spend(OutPoint::new(tx0_txid, 0), txid);
                self.claim_push.bump = (self.claim_push.bump + 1).min(5);
                tracing::info!(%txid, "secret-branch claim broadcast");
            }
            Err(error) => tracing::debug!(%error, "claim broadcast refused"),
        }

        Ok(())
    }

    /// One timeout-branch refund attempt of our own funding; a no-op until
    /// the chain passes `L2`.
    async fn try_refund_once<W, C>(&mut self, wallet: &W, chain: &C) -> Result<(), FatalError>
    where
        W: NewAddress,
        C: BlockHeight + GetTransaction + BroadcastTransaction + EstimateFee,
    {
        let (params, keys) = match (self.session.params.clone(), self.session.keys.clone()) {
            (Some(params), Some(keys)) => (params, keys),
            _ => return Ok(()),
        };
        let tx1_txid = match self.session.tx1_txid {
            Some(txid) => txid,
            None => return Ok(()),
        };

        let height = match chain.block_height().await {
            Ok(height) => height,
            Err(_) => return Ok(()),
        };
        if height < params.timeouts.L2 {
            return Ok(());
        }

        for txid in &self.refund_push.attempts {
            if let Ok(Some(info)) = chain.get_tx(*txid).await {
                if info.confirmations >= 1 {
                    return Ok(());
                }
            }
        }

        let destination = match wallet.new_address(1, 1).await {
            Ok(address) => address,
            Err(error) => {
                tracing::error!(%error, "wallet refused a refund address");
                return Ok(());
            }
        };

        let estimator = FeeEstimator::new(chain, &self.config);
        let fee = match estimator
            .backout(TIMEOUT_SPEND_VBYTES, self.refund_push.bump)
            .await
        {
            Ok(fee) => fee,
            Err(_) => return Ok(()),
        };

        let escrow = params.escrow_carol();
        let spend = SpendTransaction::new(
            &escrow,
            OutPoint::new(tx1_txid, 0),
            params.escrow_carol_value(),
            &destination,
            fee,
            escrow.timeout,
        );
        let spend = match spend {
            Ok(spend) => spend,
            Err(error) => {
                tracing::error!(%error, "refund could not be built");
                return Ok(());
            }
        };

        let sig = spend.sign_backout(&keys.backout);
        let transaction = spend.add_timeout_witness(&sig);
        let txid = transaction.txid();

        match chain.broadcast(transaction).await {
            Ok(_) => {
                if !self.refund_push.attempts.contains(&txid) {
                    self.refund_push.attempts.push(txid);
                }
                self.monitor.allow_spend(OutPoint::new(tx1_txid, 0), txid);
                self.refund_push.bump = (self.refund_push.bump + 1).min(5);
                tracing::info!(%txid, "timeout refund broadcast");
            }
            Err(error) => tracing::debug!(%error, "refund broadcast refused"),
        }

        Ok(())
    }

    fn build_redeem(&self) -> Result<bitcoin::Transaction, Error> {
        let tx3 = self.tx3()?;
        let sig_alice = self
            .session
            .sig_TX3_alice
            .ok_or_else(|| ProtocolError::Malformed("payout leg not co-signed".into()))?;
        let sig_carol = self.session.sig_TX3_carol.expect("signed when funding");
        let secret = self
            .session
            .secret
            .ok_or_else(|| ProtocolError::Malformed("secret not yet revealed".into()))?;

        Ok(tx3.add_cooperative_witness(&sig_carol, &sig_alice, &secret))
    }

    fn mark_backed_out(&mut self, reason: &str) -> Result<(), FatalError> {
        if self.session.outcome == Some(Outcome::BackedOut) {
            return Ok(());
        }

        tracing::warn!(session_id = %self.session.id, %reason, "backing out");
        self.session.outcome = Some(Outcome::BackedOut);
        self.session.backout_reason = Some(reason.to_string());
        self.store.persist(&self.session)
    }

    fn unexpected(&mut self, method: crate::rpc::Method) -> Error {
        let state = format!("{}", self.session.state_index);
        // An out-of-order call is itself a protocol failure for the session.
        let _ = self.mark_backed_out(&format!("unexpected {} in state {}", method, state));

        ProtocolError::UnexpectedMethod { method, state }.into()
    }

    fn carol_half(&self) -> CarolHalf {
        let keys = self.keys();

        CarolHalf {
            keys: keys.public(),
            payout_address: payout_address(&keys, &self.config),
        }
    }

    fn tx2(&self) -> Result<SpendTransaction, Error> {
        let params = self.session.params();
        let tx0_txid = self.session.tx0_txid.expect("verified before TX2 exists");

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
        let tx1_txid = self.session.tx1_txid.expect("funded before TX3 exists");

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
        let tx0_txid = self.session.tx0_txid.expect("verified before TX4 exists");

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
            self.monitor
                .watch_outpoint(OutPoint::new(tx0_txid, 0), allowed);
        }

        if let Some(tx1_txid) = self.session.tx1_txid {
            self.monitor
                .watch_tx(tx1_txid, self.config.tx01_confirm_wait, Some(params.timeouts.L0));

            let mut allowed: Vec<Txid> = [self.tx3()]
                .iter()
                .filter_map(|tx| tx.as_ref().ok().map(SpendTransaction::txid))
                .collect();
            if let Some(tx5_txid) = self.session.tx5_txid {
                allowed.push(tx5_txid);
            }
            self.monitor
                .watch_outpoint(OutPoint::new(tx1_txid, 0), allowed);
        }
    }

    async fn get_tx_within_timeout<C: GetTransaction>(
        &self,
        chain: &C,
        txid: Txid,
    ) -> Result<Option<crate::traits::TxInfo>, Error> {
        for _ in 0..5u32 {
            let info = chain
                .get_tx(txid)
                .await
                .map_err(|e| ChainError::Unreachable(e.to_string()))?;
            if info.is_some() {
                return Ok(info);
            }

            tokio::time::delay_for(self.config.poll_interval).await;
        }

        Ok(None)
    }

    async fn height<C: BlockHeight>(&self, chain: &C) -> Result<u32, Error> {
        chain
            .block_height()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()).into())
    }

    fn keys(&self) -> PartyKeyPairs {
        self.session.keys.clone().expect("keys are set at init")
    }

    fn persist_at(&mut self, state_index: u32) -> Result<(), FatalError> {
        self.session.advance(state_index);
        self.store.persist(&self.session)
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
