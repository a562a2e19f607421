//! Turns garbage-collection requests into page migrations and erases.
//!
//! Requests are queued as GARBAGE_COLLECTION events. When the scheduler
//! reaches one, [`Migrator::migrate`] picks a victim, reserves room for its
//! valid pages and emits one chain per page (read then write, or a single
//! copy-back). At most `max_concurrent_migrations` chains per victim are in
//! flight; the erase follows once the victim holds no valid page and no
//! migration is outstanding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, trace};

use crate::address::{Address, Depth};
use crate::block_manager::BlockManager;
use crate::config::{BlockId, Config, Counter, Geometry, Time};
use crate::error::{Result, SimError};
use crate::event::{Event, EventType};
use crate::flash::{BlockState, Flash};
use crate::ftl::Ftl;
use crate::gc::GarbageCollector;
use crate::wear_leveling::WearLeveling;

type Scope = (Option<usize>, Option<usize>, Option<usize>, Option<Counter>);

#[derive(Debug, Default)]
struct Victim {
    pending: VecDeque<VecDeque<Event>>,
    in_flight: usize,
    erase_scheduled: bool,
    wear_leveling: bool,
}

pub struct Migrator {
    config: Arc<Config>,
    gc: GarbageCollector,
    wear_leveling: WearLeveling,
    requested: HashSet<Scope>,
    victims: HashMap<BlockId, Victim>,
    outbox: Vec<VecDeque<Event>>,
    migrations: Counter,
}

impl Migrator {
    pub fn new(config: Arc<Config>) -> Self {
        Migrator {
            gc: GarbageCollector::new(Arc::clone(&config)),
            wear_leveling: WearLeveling::new(Arc::clone(&config)),
            requested: HashSet::new(),
            victims: HashMap::new(),
            outbox: Vec::new(),
            migrations: 0,
            config,
        }
    }

    pub fn garbage_collector(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn wear_leveling(&self) -> &WearLeveling {
        &self.wear_leveling
    }

    /// Pages moved so far.
    pub fn migrations(&self) -> Counter {
        self.migrations
    }

    /// Requests not yet resolved plus victims still being reclaimed.
    pub fn how_many_gc_operations_are_scheduled(&self) -> usize {
        self.requested.len() + self.victims.len()
    }

    pub fn is_victim(&self, block: BlockId) -> bool {
        self.victims.contains_key(&block)
    }

    /// Chains produced since the last call, for the scheduler.
    pub fn take_outbox(&mut self) -> Vec<VecDeque<Event>> {
        std::mem::take(&mut self.outbox)
    }

    /// Asks for a scope to be reclaimed; `None` at a level means any.
    pub fn schedule_gc(
        &mut self,
        time: Time,
        package: Option<usize>,
        die: Option<usize>,
        block: Option<usize>,
        age_class: Option<Counter>,
    ) {
        self.request(time, (package, die, block, age_class), false);
    }

    fn request(&mut self, time: Time, scope: Scope, wear_leveling: bool) {
        if !self.requested.insert(scope) {
            return;
        }
        let (package, die, block, age_class) = scope;
        let mut address = Address::INVALID;
        if let Some(package) = package {
            address.package = package;
            address.valid = Depth::Package;
            if let Some(die) = die {
                address.die = die;
                address.valid = Depth::Die;
            }
        }
        if let Some(block) = block {
            address = Address::from_linear(block * self.config.geometry.pages_per_block, Depth::Block, &self.config.geometry);
        }
        let mut event = Event::new(EventType::GarbageCollection, None, time).with_address(address);
        event.garbage_collection_op = true;
        event.wear_leveling_op = wear_leveling;
        event.age_class = age_class;
        trace!("gc requested for {address} at {time:.1}");
        self.outbox.push(VecDeque::from([event]));
    }

    fn scope_of(event: &Event, geometry: &Geometry) -> Scope {
        let address = event.address;
        if address.valid >= Depth::Block {
            return (None, None, Some(address.block_index(geometry)), event.age_class);
        }
        let package = (address.valid >= Depth::Package).then_some(address.package);
        let die = (address.valid >= Depth::Die).then_some(address.die);
        (package, die, None, event.age_class)
    }

    /// Resolves a GC request to a victim and queues its migrations.
    pub fn migrate(&mut self, gc_event: &Event, flash: &Flash, ftl: &dyn Ftl, bm: &mut BlockManager) -> Result<()> {
        let geo = self.config.geometry;
        let scope = Self::scope_of(gc_event, &geo);
        self.requested.remove(&scope);
        let time = gc_event.current_time();

        let victim = match scope {
            (_, _, Some(block), _) => {
                let state = flash.block_by_index(block).state();
                let legal = matches!(state, BlockState::Active | BlockState::Inactive);
                (legal && !self.gc.is_being_collected(block)).then(|| flash.block_by_index(block).address())
            }
            (package, die, None, age_class) => {
                self.gc.choose_gc_victim(package, die, age_class, flash, &self.wear_leveling)
            }
        };
        let Some(victim) = victim else {
            trace!("no victim for gc request {}", gc_event.address);
            return Ok(());
        };

        let block = flash.block(&victim);
        let valid = block.pages_valid();
        if valid >= geo.pages_per_block && !gc_event.wear_leveling_op {
            trace!("{victim} has no stale page to reclaim");
            return Ok(());
        }
        // A page whose write is still in flight has no reverse mapping yet.
        let Some(pages) = block
            .valid_pages()
            .map(|page| ftl.get_logical_address(&page).map(|lba| (page, lba)))
            .collect::<Option<Vec<_>>>()
        else {
            debug!("{victim} still has writes in flight, not reclaiming yet");
            return Ok(());
        };
        if !bm.reserve_for_migration(valid) {
            debug!(
                "not enough unreserved free pages to reclaim {victim} ({valid} valid, {} free, {} reserved)",
                bm.num_free_pages(),
                bm.reserved_for_gc()
            );
            return Ok(());
        }
        self.gc.commit_choice_of_victim(&victim, time)?;
        debug!("reclaiming {victim} with {valid} valid pages");

        let pending = pages
            .into_iter()
            .map(|(page, lba)| self.migration_chain(gc_event, page, lba))
            .collect();

        let index = victim.block_index(&geo);
        self.victims.insert(
            index,
            Victim { pending, wear_leveling: gc_event.wear_leveling_op, ..Victim::default() },
        );
        self.trigger_next_migrations(index);
        self.try_erase(index, flash, time);
        Ok(())
    }

    fn migration_chain(&self, gc_event: &Event, source: Address, lba: usize) -> VecDeque<Event> {
        let time = gc_event.current_time();
        let internal = |event_type| {
            let mut event = Event::new(event_type, Some(lba), time);
            event.garbage_collection_op = true;
            event.wear_leveling_op = gc_event.wear_leveling_op;
            event
        };
        if self.config.enable_copy_back {
            return VecDeque::from([internal(EventType::CopyBack).with_replace_address(source)]);
        }
        VecDeque::from([
            internal(EventType::Read).with_address(source),
            internal(EventType::Write).with_replace_address(source),
        ])
    }

    /// Releases pending migrations of a victim up to the concurrency limit.
    fn trigger_next_migrations(&mut self, block: BlockId) {
        let limit = self.config.max_concurrent_migrations;
        let Some(victim) = self.victims.get_mut(&block) else { return };
        while limit == 0 || victim.in_flight < limit {
            let Some(chain) = victim.pending.pop_front() else { break };
            victim.in_flight += 1;
            self.outbox.push(chain);
        }
    }

    fn try_erase(&mut self, block: BlockId, flash: &Flash, time: Time) {
        let Some(victim) = self.victims.get_mut(&block) else { return };
        if victim.erase_scheduled || victim.in_flight > 0 || !victim.pending.is_empty() {
            return;
        }
        if flash.block_by_index(block).pages_valid() > 0 {
            return;
        }
        victim.erase_scheduled = true;
        let mut erase = Event::new(EventType::Erase, None, time).with_address(flash.block_by_index(block).address());
        erase.garbage_collection_op = true;
        erase.wear_leveling_op = victim.wear_leveling;
        trace!("erase of {} scheduled", erase.address);
        self.outbox.push(VecDeque::from([erase]));
    }

    /// One migration chain of `block` finished, cancelled or not.
    pub fn register_migration_completion(&mut self, block: BlockId, flash: &Flash, time: Time) -> Result<()> {
        let victim = self
            .victims
            .get_mut(&block)
            .ok_or_else(|| SimError::Invariant(format!("migration completed for block {block} which is no victim")))?;
        victim.in_flight = victim
            .in_flight
            .checked_sub(1)
            .ok_or_else(|| SimError::Invariant(format!("more migrations finished than started on block {block}")))?;
        self.migrations += 1;
        self.trigger_next_migrations(block);
        self.try_erase(block, flash, time);
        Ok(())
    }

    /// Tracks pages invalidated by a finished write or trim. Returns true when
    /// the page's block just became a GC candidate.
    pub fn register_event_completion(&mut self, event: &Event, flash: &Flash) -> bool {
        if !event.replace_address.is_valid() || event.noop {
            return false;
        }
        let block = event.replace_address.block_index(&self.config.geometry);
        if self.victims.contains_key(&block) {
            self.try_erase(block, flash, event.current_time());
            return false;
        }
        self.gc.register_event_completion(event, flash)
    }

    /// Forgets a reclaimed victim and lets wear leveling react to the new erase count.
    pub fn register_erase_completion(&mut self, event: &Event, flash: &Flash) {
        let geo = self.config.geometry;
        let block = event.address.block_index(&geo);
        self.victims.remove(&block);
        self.gc.register_erase_completion(block);

        let gc = &self.gc;
        let proposal = self.wear_leveling.register_erase_completion(block, flash, |index| gc.is_being_collected(index));
        if let Some(candidate) = proposal {
            let index = candidate.block_index(&geo);
            self.request(event.current_time(), (None, None, Some(index), None), true);
        }
    }
}
