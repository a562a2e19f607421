//! Write placement policies.
//!
//! Each policy answers two questions for a pending write: where it would
//! like the page to go (`choose_best_address`) and where it could go at all
//! (`choose_any_address`). Policies that keep their own pointers advance
//! and refill them from the shared [`Pools`].

use std::collections::HashMap;

use crate::address::Address;
use crate::block_manager::Pools;
use crate::config::{BlockManagerPolicy, Counter, Lba, Time};
use crate::event::Event;
use crate::flash::Flash;
use crate::migrator::Migrator;

pub trait PlacementPolicy {
    /// Takes any blocks the policy needs before the first write.
    fn init(&mut self, _pools: &mut Pools) {}

    fn choose_best_address(&mut self, pools: &Pools, event: &Event, flash: &Flash) -> Address;

    fn choose_any_address(&mut self, pools: &Pools, event: &Event, flash: &Flash) -> Address;

    /// Advances the policy's own pointer if the write went through one.
    /// Returns false when the write used a shared pointer.
    fn register_write_outcome(&mut self, _pools: &mut Pools, _event: &Event, _migrator: &mut Migrator) -> bool {
        false
    }

    fn register_erase_outcome(&mut self, _pools: &mut Pools, _event: &Event, _migrator: &mut Migrator) {}

    /// Pointers owned by the policy, on top of the shared ones.
    fn pointers(&self) -> Vec<Address> {
        Vec::new()
    }
}

pub fn build(policy: BlockManagerPolicy) -> Box<dyn PlacementPolicy> {
    match policy {
        BlockManagerPolicy::RoundRobin => Box::new(RoundRobin::default()),
        BlockManagerPolicy::ShortestQueue => Box::new(ShortestQueue),
        BlockManagerPolicy::HotCold => Box::new(HotCold::default()),
        BlockManagerPolicy::Tagged => Box::new(Tagged::default()),
    }
}

/// Shared pointer with room on the die that frees up soonest.
fn soonest_shared_pointer(pools: &Pools, event: &Event, flash: &Flash) -> Address {
    pools
        .pointers()
        .iter()
        .filter(|pointer| pools.has_room(pointer))
        .map(|pointer| (pools.in_how_long_can_this_event_be_scheduled(pointer, event, flash), *pointer))
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map_or(Address::INVALID, |(_, pointer)| pointer)
}

fn first_shared_pointer(pools: &Pools) -> Address {
    pools.pointers().iter().copied().find(|pointer| pools.has_room(pointer)).unwrap_or(Address::INVALID)
}

/// Cycles through the dies, one write each.
#[derive(Default)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    fn pick(&mut self, pools: &Pools, mut usable: impl FnMut(&Address) -> bool) -> Address {
        let dies = pools.pointers().len();
        for offset in 0..dies {
            let die = (self.cursor + offset) % dies;
            let pointer = pools.pointer(die);
            if pools.has_room(&pointer) && usable(&pointer) {
                self.cursor = (die + 1) % dies;
                return pointer;
            }
        }
        Address::INVALID
    }
}

impl PlacementPolicy for RoundRobin {
    fn choose_best_address(&mut self, pools: &Pools, event: &Event, flash: &Flash) -> Address {
        self.pick(pools, |pointer| pools.in_how_long_can_this_event_be_scheduled(pointer, event, flash) <= 0.0)
    }

    fn choose_any_address(&mut self, pools: &Pools, _event: &Event, _flash: &Flash) -> Address {
        self.pick(pools, |_| true)
    }
}

/// Sends each write to the die with the shortest backlog.
pub struct ShortestQueue;

impl PlacementPolicy for ShortestQueue {
    fn choose_best_address(&mut self, pools: &Pools, event: &Event, flash: &Flash) -> Address {
        soonest_shared_pointer(pools, event, flash)
    }

    fn choose_any_address(&mut self, pools: &Pools, _event: &Event, _flash: &Flash) -> Address {
        first_shared_pointer(pools)
    }
}

/// Keeps frequently rewritten pages on their own per-die pointers, fed from
/// the youngest blocks, so hot and cold data do not share blocks.
#[derive(Default)]
pub struct HotCold {
    hot: Vec<Address>,
    writes: HashMap<Lba, Counter>,
}

impl HotCold {
    fn is_hot(&self, pools: &Pools, lba: Option<Lba>) -> bool {
        let threshold = pools.config().hot_write_threshold;
        lba.and_then(|lba| self.writes.get(&lba)).is_some_and(|count| *count >= threshold)
    }

    fn refill(&mut self, pools: &mut Pools, die: usize, time: Time, migrator: &mut Migrator) {
        if self.hot[die].is_valid() {
            return;
        }
        let geo = pools.config().geometry;
        let (package, die_in_package) = (die / geo.dies_per_package, die % geo.dies_per_package);
        // only take blocks the die can spare beyond its shared pointer
        if pools.free_blocks_in_die(die) == 0 {
            return;
        }
        self.hot[die] = pools.find_free_unused_block(Some(package), Some(die_in_package), Some(0), time, migrator);
        if !self.hot[die].is_valid() {
            self.hot[die] = pools.find_free_unused_block(Some(package), Some(die_in_package), None, time, migrator);
        }
    }
}

impl PlacementPolicy for HotCold {
    fn init(&mut self, pools: &mut Pools) {
        self.hot = vec![Address::INVALID; pools.pointers().len()];
    }

    fn choose_best_address(&mut self, pools: &Pools, event: &Event, flash: &Flash) -> Address {
        if event.garbage_collection_op || !self.is_hot(pools, event.logical_address) {
            return soonest_shared_pointer(pools, event, flash);
        }
        self.hot
            .iter()
            .filter(|pointer| pools.has_room(pointer))
            .map(|pointer| (pools.in_how_long_can_this_event_be_scheduled(pointer, event, flash), *pointer))
            .min_by(|(a, _), (b, _)| a.total_cmp(b))
            .map_or(Address::INVALID, |(_, pointer)| pointer)
    }

    fn choose_any_address(&mut self, pools: &Pools, _event: &Event, _flash: &Flash) -> Address {
        let shared = first_shared_pointer(pools);
        if shared.is_valid() {
            return shared;
        }
        self.hot.iter().copied().find(|pointer| pools.has_room(pointer)).unwrap_or(Address::INVALID)
    }

    fn register_write_outcome(&mut self, pools: &mut Pools, event: &Event, migrator: &mut Migrator) -> bool {
        let time = event.current_time();
        if let (Some(lba), false) = (event.logical_address, event.garbage_collection_op) {
            *self.writes.entry(lba).or_insert(0) += 1;
        }
        let Some(die) = self.hot.iter().position(|pointer| *pointer == event.address) else {
            let die = event.address.die_index(&pools.config().geometry);
            if self.is_hot(pools, event.logical_address) {
                self.refill(pools, die, time, migrator);
            }
            return false;
        };
        let mut pointer = self.hot[die];
        pools.advance(&mut pointer, Some(0), time, migrator);
        self.hot[die] = pointer;
        true
    }

    fn register_erase_outcome(&mut self, pools: &mut Pools, event: &Event, migrator: &mut Migrator) {
        let die = event.address.die_index(&pools.config().geometry);
        self.refill(pools, die, event.current_time(), migrator);
    }

    fn pointers(&self) -> Vec<Address> {
        self.hot.clone()
    }
}

/// Groups writes carrying the same tag into the same blocks.
#[derive(Default)]
pub struct Tagged {
    tags: HashMap<u32, Address>,
    next_die: usize,
}

impl PlacementPolicy for Tagged {
    fn choose_best_address(&mut self, pools: &Pools, event: &Event, flash: &Flash) -> Address {
        match event.tag.and_then(|tag| self.tags.get(&tag)) {
            Some(pointer) if pools.has_room(pointer) => *pointer,
            Some(_) => Address::INVALID,
            None => soonest_shared_pointer(pools, event, flash),
        }
    }

    /// Falls back to the blocks of other tags so idle tags strand no space.
    fn choose_any_address(&mut self, pools: &Pools, _event: &Event, _flash: &Flash) -> Address {
        let shared = first_shared_pointer(pools);
        if shared.is_valid() {
            return shared;
        }
        let mut tagged: Vec<(u32, Address)> = self.tags.iter().map(|(tag, pointer)| (*tag, *pointer)).collect();
        tagged.sort_unstable_by_key(|(tag, _)| *tag);
        tagged.into_iter().map(|(_, pointer)| pointer).find(|pointer| pools.has_room(pointer)).unwrap_or(Address::INVALID)
    }

    fn register_write_outcome(&mut self, pools: &mut Pools, event: &Event, migrator: &mut Migrator) -> bool {
        let time = event.current_time();
        let owner = self.tags.iter().find(|(_, pointer)| **pointer == event.address).map(|(tag, _)| *tag);
        if let Some(tag) = owner {
            let mut pointer = self.tags[&tag];
            pools.advance(&mut pointer, None, time, migrator);
            if pointer.is_valid() {
                self.tags.insert(tag, pointer);
            } else {
                self.tags.remove(&tag);
            }
            return true;
        }
        // first write of a tag opens a block for the rest of its group
        if let Some(tag) = event.tag.filter(|tag| !self.tags.contains_key(tag)) {
            let geo = pools.config().geometry;
            for offset in 0..geo.total_dies() {
                let die = (self.next_die + offset) % geo.total_dies();
                if pools.free_blocks_in_die(die) == 0 {
                    continue;
                }
                let (package, die_in_package) = (die / geo.dies_per_package, die % geo.dies_per_package);
                let block = pools.find_free_unused_block(Some(package), Some(die_in_package), None, time, migrator);
                if block.is_valid() {
                    self.tags.insert(tag, block);
                    self.next_die = (die + 1) % geo.total_dies();
                    break;
                }
            }
        }
        false
    }

    fn pointers(&self) -> Vec<Address> {
        self.tags.values().copied().collect()
    }
}
