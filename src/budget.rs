use bitcoin::{Amount, ScriptBuf, Sequence, absolute::LockTime};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::{
    assembler::{Coin, DUST_FLOOR, Draft, Fee, Intent, OUTPUT_VSIZE, assemble},
    error::ConstructionError,
};

pub const MAX_BLOCK_WEIGHT: u64 = 4_000_000;
pub const MAX_STANDARD_TX_WEIGHT: u64 = 400_000;
pub const WITNESS_SCALE_FACTOR: u64 = 4;

/// Dust fan-out transaction spending one wallet coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillerShape {
    pub shards: u64,
    /// Measured virtual size including the wallet's input.
    pub vsize: u64,
}

impl FillerShape {
    pub fn weight(&self) -> u64 {
        self.vsize * WITNESS_SCALE_FACTOR
    }
}

/// 396,236 WU, just under the standardness limit.
pub const CONGESTION: FillerShape = FillerShape {
    shards: 2299,
    vsize: 99059,
};

/// Tops the block up after the congestion transactions.
pub const REMAINDER: FillerShape = FillerShape {
    shards: 167,
    vsize: 7381,
};

/// How one block's worth of weight is occupied by filler transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockFill {
    pub congestion: FillerShape,
    pub congestion_per_block: usize,
    pub remainder: FillerShape,
}

impl Default for BlockFill {
    fn default() -> Self {
        Self {
            congestion: CONGESTION,
            congestion_per_block: 10,
            remainder: REMAINDER,
        }
    }
}

impl BlockFill {
    pub fn txs_per_block(&self) -> usize {
        self.congestion_per_block + 1
    }

    pub fn weight(&self) -> u64 {
        self.congestion.weight() * self.congestion_per_block as u64 + self.remainder.weight()
    }

    /// Checks every filler is standard and the batch fits in one block.
    pub fn is_valid(&self) -> bool {
        self.congestion.weight() <= MAX_STANDARD_TX_WEIGHT
            && self.remainder.weight() <= MAX_STANDARD_TX_WEIGHT
            && self.weight() <= MAX_BLOCK_WEIGHT
    }

    fn shape(&self, index_in_block: usize) -> FillerShape {
        if index_in_block < self.congestion_per_block {
            self.congestion
        } else {
            self.remainder
        }
    }
}

/// Largest number of `per_shard_dust` outputs `total_value` can fund after
/// `fee_budget` while leaving a change output at or above the dust floor.
/// Truncates toward zero.
pub fn shard_count_for_budget(
    total_value: Amount,
    per_shard_dust: Amount,
    fee_budget: Amount,
) -> u64 {
    if per_shard_dust == Amount::ZERO {
        return 0;
    }
    total_value
        .checked_sub(fee_budget)
        .and_then(|v| v.checked_sub(DUST_FLOOR))
        .map_or(0, |spendable| spendable.to_sat() / per_shard_dust.to_sat())
}

/// Change left once `count` shards and the fee are paid.
pub fn remainder_value(
    total_value: Amount,
    fee_budget: Amount,
    count: u64,
    per_shard_dust: Amount,
) -> Result<Amount, ConstructionError> {
    let required = per_shard_dust
        .checked_mul(count)
        .and_then(|shards| shards.checked_add(fee_budget))
        .ok_or(ConstructionError::ValueOverflow)?;
    let remainder =
        total_value
            .checked_sub(required)
            .ok_or(ConstructionError::InsufficientFunds {
                available: total_value,
                required,
            })?;
    if remainder < DUST_FLOOR {
        return Err(ConstructionError::Dust {
            value: remainder,
            floor: DUST_FLOOR,
        });
    }
    Ok(remainder)
}

/// Number of dust outputs a junk child needs so that, at `target_feerate`,
/// its absolute fee reaches `absolute_fee`.
pub fn junk_child_outputs(absolute_fee: Amount, target_feerate: u64) -> u64 {
    if target_feerate == 0 {
        return 0;
    }
    (absolute_fee.to_sat() / OUTPUT_VSIZE / target_feerate).saturating_sub(1)
}

fn filler_draft(
    coin: &Coin,
    shape: FillerShape,
    sat_per_vbyte: u64,
    sink: &ScriptBuf,
) -> Result<Draft, ConstructionError> {
    let fee = Fee::for_vsize(shape.vsize, sat_per_vbyte)?;
    let affordable = shard_count_for_budget(coin.value, DUST_FLOOR, fee.amount());
    if affordable < shape.shards {
        return Err(ConstructionError::InsufficientFunds {
            available: coin.value,
            required: fee.amount() + DUST_FLOOR * (shape.shards + 1),
        });
    }
    remainder_value(coin.value, fee.amount(), shape.shards, DUST_FLOOR)?;
    assemble(
        Intent::FanOut {
            shards: shape.shards,
        },
        std::slice::from_ref(coin),
        fee,
        sink,
        LockTime::ZERO,
        Sequence::MAX,
    )
}

/// Builds `batches` blocks worth of unsigned filler transactions, batch `i`
/// paying `starting_feerate + i * feerate_step` sat/vB.
///
/// Coins are consumed in order, `plan.txs_per_block()` per batch. The
/// returned drafts spend wallet coins and still need a wallet signature.
pub fn batch_for_block_weight(
    coins: &[Coin],
    starting_feerate: u64,
    feerate_step: u64,
    batches: usize,
    plan: &BlockFill,
    sink: &ScriptBuf,
) -> Result<Vec<Draft>, ConstructionError> {
    if !plan.is_valid() {
        return Err(ConstructionError::InvalidFillPlan {
            weight: plan.weight(),
        });
    }
    let per_block = plan.txs_per_block();
    let needed = per_block * batches;
    if coins.len() < needed {
        return Err(ConstructionError::CoinsExhausted {
            needed,
            available: coins.len(),
        });
    }
    let batched: Vec<Vec<Draft>> = (0..batches)
        .into_par_iter()
        .map(|batch| {
            let feerate = starting_feerate + batch as u64 * feerate_step;
            coins[batch * per_block..(batch + 1) * per_block]
                .iter()
                .enumerate()
                .map(|(i, coin)| filler_draft(coin, plan.shape(i), feerate, sink))
                .collect::<Result<Vec<_>, _>>()
        })
        .collect::<Result<_, _>>()?;
    Ok(batched.into_iter().flatten().collect())
}
