use std::sync::Arc;

use log::debug;

use crate::address::Address;
use crate::config::{BlockId, Config, Counter};
use crate::flash::{BlockState, Flash};

/// Tracks how unevenly blocks have been erased and nominates blocks whose
/// static data keeps them from being worn.
pub struct WearLeveling {
    config: Arc<Config>,
    ages: Vec<Counter>,
    min_age: Counter,
    max_age: Counter,
}

impl WearLeveling {
    pub fn new(config: Arc<Config>) -> Self {
        WearLeveling {
            ages: vec![0; config.geometry.total_blocks()],
            min_age: 0,
            max_age: 0,
            config,
        }
    }

    pub fn min_age(&self) -> Counter {
        self.min_age
    }

    pub fn max_age(&self) -> Counter {
        self.max_age
    }

    /// Buckets an erase count into one of `num_classes` uniform classes between
    /// the youngest and oldest block.
    pub fn age_class(&self, erase_count: Counter, num_classes: Counter) -> Counter {
        if num_classes <= 1 {
            return 0;
        }
        let span = self.max_age - self.min_age + 1;
        let offset = erase_count.clamp(self.min_age, self.max_age) - self.min_age;
        (offset * num_classes / span).min(num_classes - 1)
    }

    /// Records an erase and, when wear is too skewed, proposes a block to reclaim.
    pub fn register_erase_completion(
        &mut self,
        block: BlockId,
        flash: &Flash,
        being_collected: impl Fn(BlockId) -> bool,
    ) -> Option<Address> {
        self.ages[block] = flash.block_by_index(block).erase_count();
        self.min_age = self.ages.iter().copied().min().unwrap_or(0);
        self.max_age = self.ages.iter().copied().max().unwrap_or(0);

        let threshold = self.config.wear_leveling_threshold;
        if threshold == 0 || self.max_age - self.min_age <= threshold {
            return None;
        }
        let candidate = flash
            .blocks()
            .enumerate()
            .filter(|(index, block)| {
                matches!(block.state(), BlockState::Active | BlockState::Inactive) && !being_collected(*index)
            })
            .min_by_key(|(_, block)| block.erase_count())
            .map(|(_, block)| block.address())?;
        debug!(
            "wear spread {}..{} over {threshold}, proposing {candidate}",
            self.min_age, self.max_age
        );
        Some(candidate)
    }
}
