//! The non-cooperative recovery paths. Every state index maps to a
//! deterministic plan; the drivers execute these helpers once their machine
//! stops advancing.
//!
//! Cooperative redeems carry a fee fixed at negotiation time and cannot be
//! re-signed unilaterally, so a stuck one is only ever rebroadcast. The
//! punitive branches are single-signer: those are rebuilt at an escalating
//! backout fee every poll until they confirm.

use crate::{
    config::Config,
    error::{ChainError, Error, TimeoutError},
    fee::FeeEstimator,
    keys::{BackoutKeyPair, Preimage},
    traits::{
        BlockHeight, BroadcastTransaction, EstimateFee, GetSpendingTransaction, GetTransaction,
    },
    transaction::{Escrow, SpendTransaction, SECRET_SPEND_VBYTES, TIMEOUT_SPEND_VBYTES},
    Role,
};
use bitcoin::{Address, Amount, OutPoint, Txid};

const MAX_FEE_BUMPS: u32 = 5;

/// What a party does when its session dies at a given state index.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Plan {
    /// Nothing on chain yet: drop the session.
    Abort,
    /// Own funding is out; reclaim it through the timeout branch.
    Refund,
    /// The counterparty's escrow is claimable (we hold or learned the
    /// preimage): claim it first, then refund our own if it is still ours.
    ClaimThenRefund,
}

pub fn plan_for(role: Role, state_index: u32) -> Plan {
    match role {
        // Alice broadcasts TX0 at 5. Holding the preimage does not by itself
        // entitle her to Carol's escrow: a reveal Carol refused leaves the
        // swap unagreed, and the recovery is her own timeout branch. The
        // claim only becomes hers at 11, once Carol's countersignature on
        // the redeem is verified in hand. (A counterparty seen spending
        // through the secret branch re-opens the claim from the refund path,
        // whatever the index.)
        Role::Alice => match state_index {
            0..=4 => Plan::Abort,
            5..=10 => Plan::Refund,
            _ => Plan::ClaimThenRefund,
        },
        // Carol funds at her index 2 and holds the preimage from 4 on. In
        // her refund states she claims only if the chain showed her the
        // preimage, which is itself the counterparty settling through the
        // secret branch.
        Role::Carol => match state_index {
            0..=1 => Plan::Abort,
            2..=3 => Plan::Refund,
            _ => Plan::ClaimThenRefund,
        },
    }
}

pub(crate) async fn await_height<C: BlockHeight>(
    chain: &C,
    target: u32,
    poll: std::time::Duration,
) -> anyhow::Result<u32> {
    loop {
        let height = chain.block_height().await?;
        if height >= target {
            return Ok(height);
        }

        tokio::time::delay_for(poll).await;
    }
}

/// Reclaim our own escrow through the timeout branch. Blocks until the
/// timeout height, then rebuilds the refund at an escalating backout fee
/// every poll until one attempt confirms.
pub(crate) async fn refund_escrow<C>(
    chain: &C,
    config: &Config,
    escrow: &Escrow,
    outpoint: OutPoint,
    value: Amount,
    key: &BackoutKeyPair,
    destination: &Address,
) -> Result<Txid, Error>
where
    C: BlockHeight + GetTransaction + BroadcastTransaction + EstimateFee + GetSpendingTransaction,
{
    await_height(chain, escrow.timeout, config.poll_interval)
        .await
        .map_err(|e| ChainError::Unreachable(e.to_string()))?;

    tracing::info!(timeout = escrow.timeout, "timeout branch open, reclaiming escrow");

    let estimator = FeeEstimator::new(chain, config);
    let mut attempts: Vec<Txid> = Vec::new();
    let mut bump = 0;

    loop {
        let fee = estimator.backout(TIMEOUT_SPEND_VBYTES, bump).await?;
        let spend = SpendTransaction::new(escrow, outpoint, value, destination, fee, escrow.timeout)
            .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;
        let sig = spend.sign_backout(key);
        let transaction = spend.add_timeout_witness(&sig);
        let txid = transaction.txid();

        match chain.broadcast(transaction).await {
            Ok(_) => {
                if !attempts.contains(&txid) {
                    attempts.push(txid);
                }
            }
            // A replacement can race an earlier attempt into a block; only
            // fail if nothing of ours is pending either.
            Err(e) if attempts.is_empty() => {
                return Err(ChainError::BroadcastRejected(e.to_string()).into())
            }
            Err(e) => tracing::debug!(error = %e, "refund rebroadcast refused"),
        }

        tokio::time::delay_for(config.poll_interval).await;

        for txid in &attempts {
            if let Some(info) = chain
                .get_tx(*txid)
                .await
                .map_err(|e| ChainError::Unreachable(e.to_string()))?
            {
                if info.confirmations >= 1 {
                    tracing::info!(%txid, "escrow refunded");
                    return Ok(*txid);
                }
            }
        }

        // A spend that is not one of our attempts means the counterparty
        // took the output first; the caller decides what that implies.
        if let Some(spend) = chain
            .spending_tx(outpoint)
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?
        {
            let txid = spend.txid();
            if !attempts.contains(&txid) {
                return Err(ChainError::BroadcastRejected(format!(
                    "{} already spent by {}",
                    outpoint, txid
                ))
                .into());
            }
        }

        bump = (bump + 1).min(MAX_FEE_BUMPS);
    }
}

/// Claim the counterparty's escrow through the secret branch. Gives up when
/// the chain passes the escrow timeout without a confirmation, because from
/// there the counterparty's refund is racing us.
pub(crate) async fn claim_escrow<C>(
    chain: &C,
    config: &Config,
    escrow: &Escrow,
    outpoint: OutPoint,
    value: Amount,
    key: &BackoutKeyPair,
    preimage: &Preimage,
    destination: &Address,
    initial_fee: Option<Amount>,
) -> Result<Txid, Error>
where
    C: BlockHeight + GetTransaction + BroadcastTransaction + EstimateFee,
{
    let estimator = FeeEstimator::new(chain, config);
    let mut attempts: Vec<Txid> = Vec::new();
    let mut bump = 0;

    loop {
        // The first attempt may be pinned to the negotiated fee so its txid
        // matches what the counterparty was told to expect.
        let fee = match (bump, initial_fee) {
            (0, Some(fee)) => fee,
            _ => estimator.backout(SECRET_SPEND_VBYTES, bump).await?,
        };
        let spend = SpendTransaction::new(escrow, outpoint, value, destination, fee, 0)
            .map_err(|e| ChainError::BroadcastRejected(e.to_string()))?;
        let sig = spend.sign_backout(key);
        let transaction = spend.add_secret_witness(&sig, preimage);
        let txid = transaction.txid();

        match chain.broadcast(transaction).await {
            Ok(_) => {
                if !attempts.contains(&txid) {
                    attempts.push(txid);
                }
            }
            Err(e) if attempts.is_empty() => {
                return Err(ChainError::BroadcastRejected(e.to_string()).into())
            }
            Err(e) => tracing::debug!(error = %e, "claim rebroadcast refused"),
        }

        tokio::time::delay_for(config.poll_interval).await;

        for txid in &attempts {
            if let Some(info) = chain
                .get_tx(*txid)
                .await
                .map_err(|e| ChainError::Unreachable(e.to_string()))?
            {
                if info.confirmations >= 1 {
                    tracing::info!(%txid, "escrow claimed with the preimage");
                    return Ok(*txid);
                }
            }
        }

        let height = chain
            .block_height()
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;
        if height >= escrow.timeout {
            return Err(TimeoutError::ChainDeadline {
                deadline: escrow.timeout,
                waiting_for: "secret-branch claim confirmation".to_string(),
            }
            .into());
        }

        bump = (bump + 1).min(MAX_FEE_BUMPS);
    }
}
