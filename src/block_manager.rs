//! Free-space bookkeeping and write placement.
//!
//! [`Pools`] holds the per-die, per-age-class queues of erased blocks, the
//! shared free-block pointers and the page counters. [`BlockManager`] wraps
//! them with a [`PlacementPolicy`] and the outcome handlers the scheduler
//! drives. Invariant between completed events:
//!
//! `num_free_pages == pages in pools + remaining pages behind every pointer`
//! and `reserved_for_gc <= num_free_pages`. Application writes may use what
//! is left after the GC reserve and the pages promised to committed
//! victims, so `num_available_pages_for_new_writes <= num_free_pages`.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, trace};

use crate::address::{Address, Depth};
use crate::config::{Config, Counter, Time};
use crate::error::{Result, SimError};
use crate::event::{Event, EventType};
use crate::flash::{Flash, PageState, Status};
use crate::migrator::Migrator;
use crate::placement::{self, PlacementPolicy};
use crate::wear_leveling::WearLeveling;

pub struct Pools {
    config: Arc<Config>,
    /// `[die][age class]` queues of fully erased blocks.
    free_blocks: Vec<Vec<VecDeque<Address>>>,
    /// Shared per-die pointers to the next free page.
    pointers: Vec<Address>,
    num_free_pages: Counter,
    /// Pages promised to migrations of committed victims.
    reserved_for_gc: Counter,
    gc_reserve: Counter,
    redundant_gc_migrations: Counter,
}

impl Pools {
    fn new(config: Arc<Config>) -> Self {
        let geo = config.geometry;
        let mut free_blocks = vec![vec![VecDeque::new(); config.num_age_classes]; geo.total_dies()];
        for block in 0..geo.total_blocks() {
            let address = Address::from_linear(block * geo.pages_per_block, Depth::Block, &geo);
            free_blocks[address.die_index(&geo)][0].push_back(address);
        }
        let mut pools = Pools {
            free_blocks,
            pointers: vec![Address::INVALID; geo.total_dies()],
            num_free_pages: geo.total_pages(),
            reserved_for_gc: 0,
            gc_reserve: config.gc_reserve_pages(),
            redundant_gc_migrations: 0,
            config,
        };
        for die in 0..geo.total_dies() {
            pools.pointers[die] = pools.take_block(die, None);
        }
        pools
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pointer(&self, die: usize) -> Address {
        self.pointers[die]
    }

    pub fn pointers(&self) -> &[Address] {
        &self.pointers
    }

    /// A pointer that still leads to a free page.
    pub fn has_room(&self, pointer: &Address) -> bool {
        pointer.valid == Depth::Page && pointer.page < self.config.geometry.pages_per_block
    }

    pub fn free_blocks_in_die(&self, die: usize) -> usize {
        self.free_blocks[die].iter().map(VecDeque::len).sum()
    }

    pub fn num_free_pages(&self) -> Counter {
        self.num_free_pages
    }

    pub fn num_available_pages_for_new_writes(&self) -> Counter {
        self.num_free_pages.saturating_sub(self.reserved_for_gc + self.gc_reserve)
    }

    /// Time until the die behind `address` can take the event.
    pub fn in_how_long_can_this_event_be_scheduled(&self, address: &Address, event: &Event, flash: &Flash) -> Time {
        let time = event.current_time();
        let mut wait = (flash.die_finish_time(address.package, address.die) - time).max(0.0);
        let holder = flash.register_holder(address.package, address.die);
        let owns_register = event.event_type == EventType::ReadTransfer && holder.is_some() && holder == event.op();
        if holder.is_some() && !owns_register {
            wait = wait.max(self.config.bus_ctrl_delay + self.config.bus_data_delay);
        }
        wait
    }

    /// Pops an erased block as a page-0 pointer without side effects.
    fn take_block(&mut self, die: usize, age_class: Option<Counter>) -> Address {
        let queues = &mut self.free_blocks[die];
        let block = match age_class {
            Some(class) => queues.get_mut(class).and_then(VecDeque::pop_front),
            None => queues.iter_mut().find_map(VecDeque::pop_front),
        };
        block.map_or(Address::INVALID, |block| Address { page: 0, valid: Depth::Page, ..block })
    }

    /// Hands out an erased block from the scope as a page-0 pointer, or an
    /// invalid address when the scope has none. Drops below `greed_scale`
    /// free blocks request garbage collection on that die.
    pub fn find_free_unused_block(
        &mut self,
        package: Option<usize>,
        die: Option<usize>,
        age_class: Option<Counter>,
        time: Time,
        migrator: &mut Migrator,
    ) -> Address {
        let geo = self.config.geometry;
        for p in (0..geo.packages).filter(|p| package.map_or(true, |wanted| wanted == *p)) {
            for d in (0..geo.dies_per_package).filter(|d| die.map_or(true, |wanted| wanted == *d)) {
                let index = geo.die_index(p, d);
                let block = self.take_block(index, age_class);
                if !block.is_valid() {
                    continue;
                }
                if self.free_blocks_in_die(index) < self.config.greed_scale {
                    migrator.schedule_gc(time, Some(p), Some(d), None, None);
                }
                trace!("allocated free block {}", block.block_address());
                return block;
            }
        }
        Address::INVALID
    }

    /// Moves a pointer past a page just written, replacing it with a fresh
    /// block (preferring `age_class`) once its block is full.
    pub fn advance(&mut self, pointer: &mut Address, age_class: Option<Counter>, time: Time, migrator: &mut Migrator) {
        pointer.page += 1;
        if self.has_room(pointer) {
            return;
        }
        let (package, die) = (pointer.package, pointer.die);
        let mut fresh = self.find_free_unused_block(Some(package), Some(die), age_class, time, migrator);
        if !fresh.is_valid() && age_class.is_some() {
            fresh = self.find_free_unused_block(Some(package), Some(die), None, time, migrator);
        }
        if !fresh.is_valid() {
            debug!("die ({package}, {die}) has no free block left");
            migrator.schedule_gc(time, Some(package), Some(die), None, None);
        }
        *pointer = fresh;
    }

    fn advance_shared_pointer(&mut self, written: &Address, time: Time, migrator: &mut Migrator) -> bool {
        let Some(die) = self.pointers.iter().position(|pointer| pointer == written) else {
            return false;
        };
        let mut pointer = self.pointers[die];
        self.advance(&mut pointer, None, time, migrator);
        self.pointers[die] = pointer;
        true
    }

    /// Gives an invalid shared pointer a block again, if its die has one.
    fn refill_pointer(&mut self, die: usize) {
        if !self.pointers[die].is_valid() {
            self.pointers[die] = self.take_block(die, None);
        }
    }
}

pub struct BlockManager {
    config: Arc<Config>,
    pools: Pools,
    policy: Box<dyn PlacementPolicy>,
}

impl BlockManager {
    pub fn new(config: Arc<Config>) -> Self {
        let mut pools = Pools::new(Arc::clone(&config));
        let mut policy = placement::build(config.block_manager);
        policy.init(&mut pools);
        BlockManager { config, pools, policy }
    }

    pub fn pools(&self) -> &Pools {
        &self.pools
    }

    pub fn num_free_pages(&self) -> Counter {
        self.pools.num_free_pages
    }

    pub fn num_available_pages_for_new_writes(&self) -> Counter {
        self.pools.num_available_pages_for_new_writes()
    }

    pub fn reserved_for_gc(&self) -> Counter {
        self.pools.reserved_for_gc
    }

    pub fn redundant_gc_migrations(&self) -> Counter {
        self.pools.redundant_gc_migrations
    }

    /// Free pages reachable through the pools and every pointer.
    pub fn free_pages_in_structures(&self) -> Counter {
        let pages_per_block = self.config.geometry.pages_per_block;
        let pooled: Counter = (0..self.config.geometry.total_dies())
            .map(|die| self.pools.free_blocks_in_die(die) * pages_per_block)
            .sum();
        let behind_pointers: Counter = self
            .pools
            .pointers
            .iter()
            .chain(self.policy.pointers().iter())
            .filter(|pointer| self.pools.has_room(pointer))
            .map(|pointer| pages_per_block - pointer.page)
            .sum();
        pooled + behind_pointers
    }

    pub fn sort_into_age_class(&self, erase_count: Counter, wear_leveling: &WearLeveling) -> Counter {
        wear_leveling.age_class(erase_count, self.config.num_age_classes)
    }

    pub fn can_schedule_on_die(&self, address: &Address, event: &Event, flash: &Flash) -> bool {
        self.in_how_long_can_this_event_be_scheduled(address, event, flash) <= 0.0
    }

    pub fn in_how_long_can_this_event_be_scheduled(&self, address: &Address, event: &Event, flash: &Flash) -> Time {
        self.pools.in_how_long_can_this_event_be_scheduled(address, event, flash)
    }

    pub fn find_free_unused_block(
        &mut self,
        package: Option<usize>,
        die: Option<usize>,
        age_class: Option<Counter>,
        time: Time,
        migrator: &mut Migrator,
    ) -> Address {
        self.pools.find_free_unused_block(package, die, age_class, time, migrator)
    }

    /// Destination for a pending write, or an invalid address when nothing
    /// can take it right now.
    pub fn choose_write_address(&mut self, event: &Event, flash: &Flash, migrator: &mut Migrator) -> Address {
        if !event.garbage_collection_op && self.pools.num_available_pages_for_new_writes() == 0 {
            trace!("no pages available for {event}");
            self.trigger_gc_if_idle(event.current_time(), migrator);
            return Address::INVALID;
        }
        if event.event_type == EventType::CopyBack {
            return self.choose_copy_back_address(event, flash);
        }
        let best = self.policy.choose_best_address(&self.pools, event, flash);
        if best.is_valid() {
            return best;
        }
        let any = self.policy.choose_any_address(&self.pools, event, flash);
        if any.is_valid() {
            return any;
        }
        self.trigger_gc_if_idle(event.current_time(), migrator);
        Address::INVALID
    }

    /// Copy-backs stay in the die of the page they relocate; an invalid
    /// address means that die has no pointer with room.
    fn choose_copy_back_address(&self, event: &Event, flash: &Flash) -> Address {
        if event.address.valid == Depth::Page && flash.page_state(&event.address) == PageState::Empty {
            let pointed = self.pools.pointers.iter().chain(self.policy.pointers().iter()).any(|p| *p == event.address);
            if pointed {
                return event.address;
            }
        }
        let source = event.replace_address;
        self.pools
            .pointers
            .iter()
            .chain(self.policy.pointers().iter())
            .find(|pointer| self.pools.has_room(pointer) && pointer.compare(&source) >= Depth::Die)
            .copied()
            .unwrap_or(Address::INVALID)
    }

    fn trigger_gc_if_idle(&mut self, time: Time, migrator: &mut Migrator) {
        if migrator.how_many_gc_operations_are_scheduled() == 0 {
            migrator.schedule_gc(time, None, None, None, None);
        }
    }

    pub fn register_write_outcome(&mut self, event: &Event, status: Status, migrator: &mut Migrator) -> Result<()> {
        if status != Status::Success {
            return Ok(());
        }
        let time = event.current_time();
        self.pools.num_free_pages = self
            .pools
            .num_free_pages
            .checked_sub(1)
            .ok_or_else(|| SimError::Invariant(format!("free page counter underflow on {event}")))?;
        if event.garbage_collection_op {
            self.pools.reserved_for_gc = self
                .pools
                .reserved_for_gc
                .checked_sub(1)
                .ok_or_else(|| SimError::Invariant(format!("{event} wrote a page no victim reserved")))?;
        }
        // Keep invariant: reserved <= free.
        if self.pools.reserved_for_gc > self.pools.num_free_pages {
            return Err(SimError::Invariant(format!(
                "{} pages reserved for gc but only {} free after {event}",
                self.pools.reserved_for_gc, self.pools.num_free_pages
            )));
        }

        let used_policy_pointer = self.policy.register_write_outcome(&mut self.pools, event, migrator);
        if !used_policy_pointer && !self.pools.advance_shared_pointer(&event.address, time, migrator) {
            return Err(SimError::Invariant(format!("{event} was not written through any free-block pointer")));
        }

        if self.pools.num_free_pages <= self.config.geometry.pages_per_block {
            debug!("only {} free pages left, requesting gc", self.pools.num_free_pages);
            migrator.schedule_gc(time, None, None, None, None);
        }
        Ok(())
    }

    pub fn register_erase_outcome(
        &mut self,
        event: &Event,
        status: Status,
        flash: &Flash,
        migrator: &mut Migrator,
    ) {
        if status != Status::Success {
            return;
        }
        let geo = self.config.geometry;
        let block = event.address.block_address();
        let age_class = self.sort_into_age_class(flash.block(&block).erase_count(), migrator.wear_leveling());
        let die = block.die_index(&geo);
        self.pools.free_blocks[die][age_class].push_back(block);
        self.pools.num_free_pages += geo.pages_per_block;
        debug!("block {block} erased into age class {age_class}");

        self.pools.refill_pointer(die);
        self.policy.register_erase_outcome(&mut self.pools, event, migrator);
        self.check_if_should_trigger_more_gc(event.current_time(), migrator);
    }

    pub fn register_read_command_outcome(&mut self, event: &Event, status: Status) {
        trace!("read command {event} finished with {status:?}");
    }

    pub fn register_read_transfer_outcome(&mut self, event: &Event, status: Status) {
        trace!("read transfer {event} finished with {status:?}");
    }

    /// A trim made a scheduled migration pointless.
    pub fn register_trim_making_gc_redundant(&mut self) {
        self.pools.redundant_gc_migrations += 1;
    }

    /// Reserves room for the pages a victim has to move. Refuses when the
    /// free pages not yet promised to other victims cannot hold them.
    pub fn reserve_for_migration(&mut self, pages: Counter) -> bool {
        let pools = &mut self.pools;
        if pools.num_free_pages.saturating_sub(pools.reserved_for_gc) < pages {
            return false;
        }
        pools.reserved_for_gc += pages;
        true
    }

    /// Gives back the page reserved for a migration that never wrote.
    pub fn release_migration_reservation(&mut self) -> Result<()> {
        self.pools.reserved_for_gc = self
            .pools
            .reserved_for_gc
            .checked_sub(1)
            .ok_or_else(|| SimError::Invariant("released a migration page that was never reserved".into()))?;
        Ok(())
    }

    /// Requests GC for every die without a usable pointer or below the headroom.
    pub fn check_if_should_trigger_more_gc(&mut self, time: Time, migrator: &mut Migrator) {
        let geo = self.config.geometry;
        for package in 0..geo.packages {
            for die in 0..geo.dies_per_package {
                let index = geo.die_index(package, die);
                let starved = !self.pools.has_room(&self.pools.pointers[index]);
                if starved || self.pools.free_blocks_in_die(index) < self.config.greed_scale {
                    migrator.schedule_gc(time, Some(package), Some(die), None, None);
                }
            }
        }
    }
}
