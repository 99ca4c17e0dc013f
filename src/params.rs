use crate::{
    config::Config,
    error::ConfigError,
    keys::{BackoutPublicKey, FundingPublicKey, HashImage, RedeemPublicKey},
    transaction::Escrow,
};
use bitcoin::{Address, Amount, PublicKey};
use serde::{Deserialize, Serialize};

/// The public halves of one party's three swap keys.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartyKeys {
    pub fund: FundingPublicKey,
    pub redeem: RedeemPublicKey,
    pub backout: BackoutPublicKey,
}

/// Absolute block heights. `L0` bounds funding confirmation, `L1` opens
/// Alice's refund of her escrow, `L2 > L1` opens Carol's.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    pub L0: u32,
    pub L1: u32,
    pub L2: u32,
}

/// Fees for the negotiated transactions, fixed by Alice at proposal time so
/// that both sides construct byte-identical spends to sign.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TxFees {
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub funding_alice: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub funding_carol: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub redeem_escrow_alice: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub redeem_escrow_carol: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub claim_escrow_alice: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub claim_escrow_carol: Amount,
}

/// Alice's contribution to the shared parameters: her keys and payout
/// address plus everything she proposes (hash image, timeouts, amounts,
/// fees).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AliceHalf {
    pub keys: PartyKeys,
    #[serde(with = "crate::serde::address")]
    pub payout_address: Address,
    pub hash_image: HashImage,
    pub timeouts: Timeouts,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub amount: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub coinswap_fee: Amount,
    pub fees: TxFees,
}

/// Carol's contribution: keys and payout address. Everything proposable she
/// either accepts or refuses wholesale.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CarolHalf {
    pub keys: PartyKeys,
    #[serde(with = "crate::serde::address")]
    pub payout_address: Address,
}

/// The negotiated, shared view of one swap. Both participants hold an
/// identical copy once `negotiate` succeeds on each side.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublicParameters {
    pub alice_keys: PartyKeys,
    pub carol_keys: PartyKeys,
    #[serde(with = "crate::serde::address")]
    pub alice_payout: Address,
    #[serde(with = "crate::serde::address")]
    pub carol_payout: Address,
    pub hash_image: HashImage,
    pub timeouts: Timeouts,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub amount: Amount,
    #[serde(with = "bitcoin::util::amount::serde::as_sat")]
    pub coinswap_fee: Amount,
    pub fees: TxFees,
}

impl PublicParameters {
    /// Merge the two halves, enforcing policy. Carol calls this against her
    /// own bounds when Alice proposes; Alice calls it with the same checks
    /// when Carol's half arrives, so both reject the same pathologies.
    pub fn negotiate(
        alice: AliceHalf,
        carol: CarolHalf,
        config: &Config,
        current_height: u32,
    ) -> Result<Self, ConfigError> {
        let Timeouts { L0, L1, L2 } = alice.timeouts;

        if !(current_height < L0 && L0 < L1 && L1 < L2) {
            return Err(ConfigError::TimeoutsOutOfOrder {
                height: current_height,
                L0,
                L1,
                L2,
            });
        }

        let gap = L2 - L1;
        let minimum_gap = config
            .min_timeout_gap
            .max(config.tx01_confirm_wait + config.timeout_safety);
        if gap < minimum_gap || gap > config.max_timeout_gap {
            return Err(ConfigError::TimeoutGapOutOfBounds {
                gap,
                minimum: minimum_gap,
                maximum: config.max_timeout_gap,
            });
        }

        if alice.amount < config.minimum_amount || alice.amount > config.maximum_amount {
            return Err(ConfigError::AmountOutOfBounds {
                amount: alice.amount,
                minimum: config.minimum_amount,
                maximum: config.maximum_amount,
            });
        }

        if alice.coinswap_fee < config.minimum_coinswap_fee {
            return Err(ConfigError::FeeBelowMinimum {
                fee: alice.coinswap_fee,
                minimum: config.minimum_coinswap_fee,
            });
        }

        for fee in &[
            alice.fees.funding_alice,
            alice.fees.funding_carol,
            alice.fees.redeem_escrow_alice,
            alice.fees.redeem_escrow_carol,
            alice.fees.claim_escrow_alice,
            alice.fees.claim_escrow_carol,
        ] {
            // A spend is ~200 vbytes; anything past the absurd rate for a
            // full kB is a proposal we refuse to co-sign.
            if fee.as_sat() > config.absurd_fee_per_kb {
                return Err(ConfigError::AbsurdFeeRate {
                    rate: fee.as_sat(),
                    limit: config.absurd_fee_per_kb,
                });
            }
        }

        check_payout_address(&alice.payout_address, alice.keys.redeem, config)?;
        check_payout_address(&carol.payout_address, carol.keys.redeem, config)?;

        Ok(Self {
            alice_keys: alice.keys,
            carol_keys: carol.keys,
            alice_payout: alice.payout_address,
            carol_payout: carol.payout_address,
            hash_image: alice.hash_image,
            timeouts: alice.timeouts,
            amount: alice.amount,
            coinswap_fee: alice.coinswap_fee,
            fees: alice.fees,
        })
    }

    /// Total locked into Alice's escrow: the swap amount plus the coinswap
    /// fee she pays Carol.
    pub fn escrow_alice_value(&self) -> Amount {
        self.amount + self.coinswap_fee
    }

    pub fn escrow_carol_value(&self) -> Amount {
        self.amount
    }

    /// The escrow funded by Alice. Cooperative branch pays Carol, secret
    /// branch claimable by Carol with the preimage, timeout branch returns to
    /// Alice after `L1`.
    pub fn escrow_alice(&self) -> Escrow {
        Escrow {
            fund_funder: self.alice_keys.fund,
            fund_other: self.carol_keys.fund,
            claim: self.carol_keys.backout,
            refund: self.alice_keys.backout,
            hash_image: self.hash_image,
            timeout: self.timeouts.L1,
        }
    }

    /// The escrow funded by Carol: the mirror image, with timeout `L2`.
    pub fn escrow_carol(&self) -> Escrow {
        Escrow {
            fund_funder: self.carol_keys.fund,
            fund_other: self.alice_keys.fund,
            claim: self.alice_keys.backout,
            refund: self.carol_keys.backout,
            hash_image: self.hash_image,
            timeout: self.timeouts.L2,
        }
    }
}

fn check_payout_address(
    address: &Address,
    redeem: RedeemPublicKey,
    config: &Config,
) -> Result<(), ConfigError> {
    if address.network != config.network {
        return Err(ConfigError::WrongNetwork);
    }

    let expected = Address::p2wpkh(
        &PublicKey {
            compressed: true,
            key: redeem.into(),
        },
        config.network,
    );

    if *address != expected {
        return Err(ConfigError::PayoutAddressMismatch);
    }

    Ok(())
}
