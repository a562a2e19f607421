use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, trace};

use crate::address::Address;
use crate::config::{BlockId, Config, Counter, GcPolicy, Time};
use crate::error::{Result, SimError};
use crate::event::Event;
use crate::flash::{BlockState, Flash};
use crate::wear_leveling::WearLeveling;

/// Reclamation candidates of one die.
#[derive(Debug, Default)]
struct Candidates {
    /// Block to the sequence number it was enqueued with.
    members: HashMap<BlockId, u64>,
    being_collected: HashSet<BlockId>,
}

/// Keeps per-die sets of blocks holding invalid pages and picks victims
/// from them, greedily by valid pages or by enqueue order.
pub struct GarbageCollector {
    config: Arc<Config>,
    dies: Vec<Candidates>,
    sequence: u64,
}

impl GarbageCollector {
    pub fn new(config: Arc<Config>) -> Self {
        let dies = (0..config.geometry.total_dies()).map(|_| Candidates::default()).collect();
        GarbageCollector { config, dies, sequence: 0 }
    }

    fn die_of(&self, block: BlockId) -> usize {
        block / self.config.geometry.blocks_per_die()
    }

    /// Picks up the page an event invalidated. Returns true when its block
    /// just became a candidate.
    pub fn register_event_completion(&mut self, event: &Event, flash: &Flash) -> bool {
        if event.noop || !event.replace_address.is_valid() {
            return false;
        }
        let block = event.replace_address.block_index(&self.config.geometry);
        if flash.block_by_index(block).pages_invalid() == 0 {
            return false;
        }
        let die = self.die_of(block);
        let candidates = &mut self.dies[die];
        if candidates.being_collected.contains(&block) || candidates.members.contains_key(&block) {
            return false;
        }
        self.sequence += 1;
        candidates.members.insert(block, self.sequence);
        trace!("block {} is a gc candidate", event.replace_address.block_address());
        true
    }

    /// Best victim in scope; `None` at any level means every value.
    pub fn choose_gc_victim(
        &self,
        package: Option<usize>,
        die: Option<usize>,
        age_class: Option<Counter>,
        flash: &Flash,
        wear_leveling: &WearLeveling,
    ) -> Option<Address> {
        let geo = self.config.geometry;
        let num_age_classes = self.config.num_age_classes;
        let dies = (0..geo.packages)
            .filter(move |p| package.map_or(true, |wanted| wanted == *p))
            .flat_map(move |p| {
                (0..geo.dies_per_package)
                    .filter(move |d| die.map_or(true, |wanted| wanted == *d))
                    .map(move |d| geo.die_index(p, d))
            });

        let legal = dies.flat_map(move |index| {
            let candidates = &self.dies[index];
            candidates
                .members
                .iter()
                .filter(move |(block, _)| !candidates.being_collected.contains(*block))
                .map(move |(block, sequence)| (*block, *sequence, flash.block_by_index(*block)))
                .filter(|(_, _, block)| matches!(block.state(), BlockState::Active | BlockState::Inactive))
                .filter(move |(_, _, block)| {
                    age_class.map_or(true, |class| wear_leveling.age_class(block.erase_count(), num_age_classes) == class)
                })
        });

        let chosen = match self.config.gc_policy {
            GcPolicy::Greedy => legal.min_by_key(|(_, sequence, block)| (block.pages_valid(), *sequence)),
            GcPolicy::Lru => legal.min_by_key(|(_, sequence, _)| *sequence),
        };
        chosen.map(|(_, _, block)| block.address())
    }

    /// Takes a victim out of the candidate set once reclamation is scheduled for it.
    pub fn commit_choice_of_victim(&mut self, address: &Address, time: Time) -> Result<()> {
        let block = address.block_index(&self.config.geometry);
        let die = self.die_of(block);
        let candidates = &mut self.dies[die];
        if !candidates.being_collected.insert(block) {
            return Err(SimError::Invariant(format!(
                "block {} chosen as victim while already being collected",
                address.block_address()
            )));
        }
        candidates.members.remove(&block);
        debug!("committed victim {} at {time:.1}", address.block_address());
        Ok(())
    }

    pub fn register_erase_completion(&mut self, block: BlockId) {
        let die = self.die_of(block);
        self.dies[die].being_collected.remove(&block);
        self.dies[die].members.remove(&block);
    }

    pub fn is_candidate(&self, block: BlockId) -> bool {
        self.dies[self.die_of(block)].members.contains_key(&block)
    }

    pub fn is_being_collected(&self, block: BlockId) -> bool {
        self.dies[self.die_of(block)].being_collected.contains(&block)
    }

    pub fn num_candidates(&self, package: usize, die: usize) -> usize {
        self.dies[self.config.geometry.die_index(package, die)].members.len()
    }
}
