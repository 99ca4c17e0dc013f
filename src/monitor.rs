use crate::{
    keys::{HashImage, Preimage},
    traits::{BlockHeight, GetSpendingTransaction, GetTransaction},
    transaction::extract_preimage,
};
use bitcoin::{OutPoint, Transaction, Txid};

/// A confirmation watch: resolves once `txid` reaches `min_confs`, or times
/// out once the chain passes `deadline_height` first.
#[derive(Clone, Debug)]
pub struct Watch {
    pub txid: Txid,
    pub min_confs: u32,
    pub deadline_height: Option<u32>,
    confirmed: bool,
    deadline_fired: bool,
}

#[derive(Clone, Debug)]
struct OutpointWatch {
    outpoint: OutPoint,
    /// Spends the protocol negotiated; anything else is hostile or leaks the
    /// counterparty's preimage.
    allowed: Vec<Txid>,
    reported: bool,
    preimage_reported: bool,
}

#[derive(Clone, Debug)]
pub enum WatchEvent {
    Confirmed {
        txid: Txid,
    },
    TimedOut {
        txid: Txid,
        deadline_height: u32,
    },
    /// A previously confirmed watch dropped below its depth.
    Reorged {
        txid: Txid,
    },
    /// An escrow outpoint was spent by a transaction outside the negotiated
    /// set. If its witness carries the preimage, it is attached so the
    /// victim can race its own secret-branch claim.
    UnexpectedSpend {
        outpoint: OutPoint,
        transaction: Transaction,
        preimage: Option<Preimage>,
    },
    /// Some spend of a watched outpoint (negotiated or not) put the preimage
    /// on chain.
    PreimageRevealed {
        outpoint: OutPoint,
        preimage: Preimage,
    },
}

/// The chain monitor. The driver calls `poll` on its cadence; each call
/// inspects the chain once and yields every event that became true since the
/// last call. Watches are idempotent: re-registering a txid after a restart
/// is a no-op.
#[derive(Debug, Default)]
pub struct Monitor {
    watches: Vec<Watch>,
    outpoints: Vec<OutpointWatch>,
    hash_image: Option<HashImage>,
}

impl Monitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_hash_image(&mut self, hash_image: HashImage) {
        self.hash_image = Some(hash_image);
    }

    pub fn watch_tx(&mut self, txid: Txid, min_confs: u32, deadline_height: Option<u32>) {
        if self.watches.iter().any(|w| w.txid == txid) {
            return;
        }

        self.watches.push(Watch {
            txid,
            min_confs,
            deadline_height,
            confirmed: false,
            deadline_fired: false,
        });
    }

    pub fn watch_outpoint(&mut self, outpoint: OutPoint, allowed: Vec<Txid>) {
        if let Some(existing) = self.outpoints.iter_mut().find(|w| w.outpoint == outpoint) {
            for txid in allowed {
                if !existing.allowed.contains(&txid) {
                    existing.allowed.push(txid);
                }
            }
            return;
        }

        self.outpoints.push(OutpointWatch {
            outpoint,
            allowed,
            reported: false,
            preimage_reported: false,
        });
    }

    /// Whitelist another negotiated spend after the watch was created
    /// (e.g. a claim txid announced mid-protocol).
    pub fn allow_spend(&mut self, outpoint: OutPoint, txid: Txid) {
        if let Some(watch) = self.outpoints.iter_mut().find(|w| w.outpoint == outpoint) {
            if !watch.allowed.contains(&txid) {
                watch.allowed.push(txid);
            }
        }
    }

    /// Cancellation replaces cooperative watches with whatever the backout
    /// path registers next.
    pub fn clear(&mut self) {
        self.watches.clear();
        self.outpoints.clear();
    }

    pub async fn poll<C>(&mut self, chain: &C) -> anyhow::Result<Vec<WatchEvent>>
    where
        C: BlockHeight + GetTransaction + GetSpendingTransaction,
    {
        let height = chain.block_height().await?;
        let mut events = Vec::new();

        for watch in &mut self.watches {
            let confirmations = chain
                .get_tx(watch.txid)
                .await?
                .map(|info| info.confirmations)
                .unwrap_or(0);

            if watch.confirmed {
                if confirmations < watch.min_confs {
                    watch.confirmed = false;
                    tracing::warn!(txid = %watch.txid, "confirmed transaction fell out of the chain");
                    events.push(WatchEvent::Reorged { txid: watch.txid });
                }
                continue;
            }

            if confirmations >= watch.min_confs {
                watch.confirmed = true;
                tracing::debug!(txid = %watch.txid, confirmations, "watch confirmed");
                events.push(WatchEvent::Confirmed { txid: watch.txid });
            } else if let Some(deadline) = watch.deadline_height {
                if height >= deadline && !watch.deadline_fired {
                    watch.deadline_fired = true;
                    tracing::warn!(txid = %watch.txid, deadline, "watch deadline expired");
                    events.push(WatchEvent::TimedOut {
                        txid: watch.txid,
                        deadline_height: deadline,
                    });
                }
            }
        }

        for watch in &mut self.outpoints {
            if watch.reported && watch.preimage_reported {
                continue;
            }

            if let Some(transaction) = chain.spending_tx(watch.outpoint).await? {
                let preimage = self
                    .hash_image
                    .as_ref()
                    .and_then(|image| extract_preimage(&transaction, image));

                if let Some(preimage) = preimage {
                    if !watch.preimage_reported {
                        watch.preimage_reported = true;
                        tracing::debug!(outpoint = %watch.outpoint, "preimage revealed on chain");
                        events.push(WatchEvent::PreimageRevealed {
                            outpoint: watch.outpoint,
                            preimage,
                        });
                    }
                }

                if watch.allowed.contains(&transaction.txid()) || watch.reported {
                    continue;
                }

                watch.reported = true;
                tracing::warn!(
                    outpoint = %watch.outpoint,
                    txid = %transaction.txid(),
                    preimage_revealed = preimage.is_some(),
                    "escrow spent outside the negotiated set"
                );
                events.push(WatchEvent::UnexpectedSpend {
                    outpoint: watch.outpoint,
                    transaction,
                    preimage,
                });
            }
        }

        Ok(events)
    }
}
