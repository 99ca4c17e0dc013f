use crate::{
    config::Config,
    error::{ChainError, ConfigError, Error},
    traits::EstimateFee,
};
use bitcoin::Amount;

/// Wraps the chain's fee estimator with the policy knobs: targets, the
/// backout multiplier and the absurd-rate cut-off.
#[derive(Debug)]
pub struct FeeEstimator<'a, C> {
    chain: &'a C,
    config: &'a Config,
}

impl<'a, C: EstimateFee> FeeEstimator<'a, C> {
    pub fn new(chain: &'a C, config: &'a Config) -> Self {
        Self { chain, config }
    }

    /// Fee for a cooperative transaction of `vbytes` at the default target.
    pub async fn normal(&self, vbytes: usize) -> Result<Amount, Error> {
        let rate = self.rate(self.config.default_fee_target).await?;

        Ok(fee_from_rate(vbytes, rate))
    }

    /// Fee for a backout transaction. `bump` starts at 0 and increases each
    /// time a previous attempt failed to confirm, escalating linearly.
    pub async fn backout(&self, vbytes: usize, bump: u32) -> Result<Amount, Error> {
        let rate = self.rate(self.config.backout_fee_target).await?;

        #[allow(clippy::cast_precision_loss, clippy::cast_sign_loss)]
        let scaled =
            (rate as f64 * self.config.backout_fee_multiplier * f64::from(bump + 1)) as u64;

        // The escalated rate is still subject to the absurd cut-off.
        let capped = scaled.min(self.config.absurd_fee_per_kb);

        Ok(fee_from_rate(vbytes, capped))
    }

    async fn rate(&self, target_blocks: usize) -> Result<u64, Error> {
        let rate = self
            .chain
            .estimate_fee(target_blocks)
            .await
            .map_err(|e| ChainError::Unreachable(e.to_string()))?;

        if rate > self.config.absurd_fee_per_kb {
            return Err(ConfigError::AbsurdFeeRate {
                rate,
                limit: self.config.absurd_fee_per_kb,
            }
            .into());
        }

        Ok(rate)
    }
}

/// `ceil(vbytes × rate / 1000)`, rate in sat/kB.
fn fee_from_rate(vbytes: usize, rate_per_kb: u64) -> Amount {
    Amount::from_sat((vbytes as u64 * rate_per_kb + 999) / 1000)
}
