//! Discrete-event I/O scheduler.
//!
//! Every chain handed to [`IoScheduler::schedule_events_queue`] becomes one
//! [`Operation`]. Its first event goes through conflict resolution against
//! the operation currently owning the same logical address and either runs,
//! runs as a noop, or parks behind the owner until it finalizes. Runnable
//! events are ordered by the configured scheme and issued to the flash; a
//! finished event fires the FTL, block-manager and migrator callbacks and
//! activates the next step of its chain.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};
use rand::rngs::SmallRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::address::{Address, Depth};
use crate::block_manager::BlockManager;
use crate::config::{Config, Lba, SchedulingScheme, Time};
use crate::error::{Result, SimError};
use crate::event::{Event, EventKind, EventType};
use crate::event_queue::EventQueue;
use crate::flash::{Flash, PageState, Status};
use crate::ftl::Ftl;
use crate::migrator::Migrator;
use crate::operation::{OpClass, OpId, Operation, Operations};
use crate::priority;

/// Outcome of checking a new operation against the owner of its address.
enum Conflict {
    /// The new operation owns the address now.
    Owner,
    /// Runs without owning the address, as a noop.
    Flow,
    /// Parked until the given operation finalizes.
    Depend(OpId),
}

fn record(operations: &Operations, id: OpId) -> Result<&Operation> {
    operations.get(id).ok_or_else(|| SimError::Invariant(format!("operation {id} is gone")))
}

fn record_mut(operations: &mut Operations, id: OpId) -> Result<&mut Operation> {
    operations.get_mut(id).ok_or_else(|| SimError::Invariant(format!("operation {id} is gone")))
}

pub struct IoScheduler {
    config: Arc<Config>,
    flash: Flash,
    ftl: Box<dyn Ftl>,
    bm: BlockManager,
    migrator: Migrator,

    future: EventQueue,
    in_flight: EventQueue,
    current: Vec<Event>,
    operations: Operations,
    owners: HashMap<Lba, OpId>,

    rng: SmallRng,
    now: Time,
    window_end: Time,
    /// Since when writes have been held with nothing in flight.
    idle_since: Option<Time>,
    completed: Vec<Event>,
}

impl IoScheduler {
    pub fn new(config: Arc<Config>, ftl: Box<dyn Ftl>) -> Self {
        IoScheduler {
            flash: Flash::new(Arc::clone(&config)),
            bm: BlockManager::new(Arc::clone(&config)),
            migrator: Migrator::new(Arc::clone(&config)),
            ftl,
            future: EventQueue::new(),
            in_flight: EventQueue::new(),
            current: Vec::new(),
            operations: Operations::default(),
            owners: HashMap::new(),
            rng: SmallRng::seed_from_u64(config.seed),
            now: 0.0,
            window_end: 1.0,
            idle_since: None,
            completed: Vec::new(),
            config,
        }
    }

    pub fn now(&self) -> Time {
        self.now
    }

    pub fn flash(&self) -> &Flash {
        &self.flash
    }

    pub fn ftl(&self) -> &dyn Ftl {
        self.ftl.as_ref()
    }

    pub fn ftl_mut(&mut self) -> &mut dyn Ftl {
        self.ftl.as_mut()
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.bm
    }

    pub fn migrator(&self) -> &Migrator {
        &self.migrator
    }

    /// Operation currently owning a logical address.
    pub fn owner(&self, lba: Lba) -> Option<OpId> {
        self.owners.get(&lba).copied()
    }

    pub fn operation(&self, id: OpId) -> Option<&Operation> {
        self.operations.get(id)
    }

    pub fn pending_operations(&self) -> usize {
        self.operations.len()
    }

    /// Events finished since the last call, in completion order.
    pub fn take_completed(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.completed)
    }

    pub fn is_empty(&self) -> bool {
        self.future.is_empty() && self.in_flight.is_empty() && self.current.is_empty()
    }

    pub fn schedule_event(&mut self, event: Event) -> Option<OpId> {
        self.schedule_events_queue(VecDeque::from([event]))
    }

    /// Registers a chain of dependent steps as one operation and queues its
    /// first step. Reads are split into command and transfer here.
    pub fn schedule_events_queue(&mut self, chain: VecDeque<Event>) -> Option<OpId> {
        let mut steps = VecDeque::with_capacity(chain.len() + 1);
        for event in chain {
            if event.event_type == EventType::Read {
                let (command, transfer) = event.split_read();
                steps.push_back(command);
                steps.push_back(transfer);
            } else {
                steps.push_back(event);
            }
        }
        let mut first = steps.pop_front()?;
        first.wait_until(self.now);

        let kind = std::iter::once(&first)
            .chain(steps.iter())
            .map(|event| event.event_type)
            .find(|event_type| event_type.is_write())
            .unwrap_or(first.event_type);
        let mut operation =
            Operation::new(kind, first.logical_address, first.garbage_collection_op, first.mapping_op);
        if operation.class() == OpClass::GcMigration {
            let source = match first.event_type {
                EventType::CopyBack => first.replace_address,
                _ => first.address,
            };
            operation.victim = Some(source.block_index(&self.config.geometry));
        }
        operation.current = Some(first.id());

        let id = self.operations.insert(operation);
        first.set_op(id);
        for step in steps.iter_mut() {
            step.set_op(id);
        }
        if let Some(operation) = self.operations.get_mut(id) {
            operation.chain = steps;
        }
        trace!("scheduled {first} as {id}");
        self.future.push(first);
        Some(id)
    }

    /// Requests garbage collection of a die, or of the whole drive.
    pub fn schedule_gc(&mut self, time: Time, package: Option<usize>, die: Option<usize>) {
        self.migrator.schedule_gc(time, package, die, None, None);
        self.drain_outbox();
    }

    /// Runs everything due in the next unit of simulated time.
    pub fn execute_soonest_events(&mut self) -> Result<()> {
        let next = match (self.future.next_time(), self.in_flight.next_time()) {
            (Some(a), Some(b)) => a.min(b),
            (Some(time), None) | (None, Some(time)) => time,
            (None, None) => {
                if !self.operations.is_empty() {
                    return Err(SimError::Invariant(format!(
                        "{} operations left with nothing scheduled",
                        self.operations.len()
                    )));
                }
                return Ok(());
            }
        };
        self.now = self.now.max(next);
        self.window_end = self.now + 1.0;

        loop {
            let mut progressed = false;
            while let Some(batch) = self.in_flight.pop_due(self.window_end) {
                progressed = true;
                for event in self.order_same_time(batch) {
                    self.handle_finished_event(event)?;
                }
            }
            while let Some(batch) = self.future.pop_due(self.window_end) {
                progressed = true;
                for event in self.order_same_time(batch) {
                    self.init_event(event)?;
                }
            }
            if self.current.is_empty() {
                if progressed {
                    continue;
                }
                break;
            }
            self.dispatch_current()?;
        }
        Ok(())
    }

    /// Sorts by exact time and shuffles runs of equal times.
    fn order_same_time(&mut self, mut batch: Vec<Event>) -> Vec<Event> {
        batch.sort_by(|a, b| a.current_time().total_cmp(&b.current_time()));
        let mut start = 0;
        while start < batch.len() {
            let time = batch[start].current_time();
            let end = batch[start..]
                .iter()
                .position(|event| event.current_time() > time)
                .map_or(batch.len(), |offset| start + offset);
            batch[start..end].shuffle(&mut self.rng);
            start = end;
        }
        batch
    }

    fn op_of(event: &Event) -> Result<OpId> {
        event.op().ok_or_else(|| SimError::Invariant(format!("{event} belongs to no operation")))
    }

    fn init_event(&mut self, mut event: Event) -> Result<()> {
        let id = Self::op_of(&event)?;
        if event.event_type == EventType::GarbageCollection {
            self.migrator.migrate(&event, &self.flash, self.ftl.as_ref(), &mut self.bm)?;
            return self.handle_finished_event(event);
        }

        // Held and cancelled operations come back here; only fresh ones are classified.
        let operation = record(&self.operations, id)?;
        if !operation.started && !operation.noop && event.logical_address.is_some() {
            match self.remove_redundant_events(&event, id)? {
                Conflict::Owner | Conflict::Flow => {}
                Conflict::Depend(owner) => {
                    trace!("{event} waits on {owner}");
                    record_mut(&mut self.operations, owner)?.dependents.push_back(id);
                    record_mut(&mut self.operations, id)?.parked = Some(event);
                    return Ok(());
                }
            }
        }

        self.resolve_addresses(&mut event, id)?;
        self.enqueue_runnable(event);
        Ok(())
    }

    /// Applies the conflict table to a new operation and the owner of its
    /// logical address.
    fn remove_redundant_events(&mut self, event: &Event, id: OpId) -> Result<Conflict> {
        let Some(lba) = event.logical_address else {
            return Ok(Conflict::Flow);
        };
        let existing_id = match self.owners.get(&lba).copied() {
            Some(owner) if owner != id => owner,
            _ => {
                self.owners.insert(lba, id);
                return Ok(Conflict::Owner);
            }
        };

        let new = record(&self.operations, id)?;
        let existing = record(&self.operations, existing_id)?;
        let (new_class, existing_class) = (new.class(), existing.class());
        let new_is_gc = new.gc;
        let cancellable = existing.cancellable();
        let existing_is_mapping = existing.mapping;

        use OpClass::*;
        let conflict = match (new_class, existing_class) {
            (GcMigration, Write) => {
                if cancellable {
                    debug!("{existing_id} takes over the migration of lba {lba} from {id}");
                    let existing = record_mut(&mut self.operations, existing_id)?;
                    existing.gc = true;
                    existing.carries_migration = true;
                    record_mut(&mut self.operations, id)?.handed_off = true;
                }
                record_mut(&mut self.operations, id)?.noop = true;
                Conflict::Flow
            }
            (GcMigration, GcMigration | Read) => Conflict::Depend(existing_id),
            (GcMigration, Trim) if event.event_type.is_read() => {
                debug!("migration {id} of trimmed lba {lba} is redundant");
                self.bm.register_trim_making_gc_redundant();
                record_mut(&mut self.operations, id)?.noop = true;
                Conflict::Flow
            }
            (GcMigration | Write, Trim) | (Write, GcMigration) | (Trim, Read) | (Read, Write) => {
                Conflict::Depend(existing_id)
            }
            (Trim, GcMigration) => {
                record_mut(&mut self.operations, existing_id)?.notify_gc_redundant = true;
                Conflict::Depend(existing_id)
            }
            (Write | Trim, Write) if cancellable => self.cancel(existing_id, id, lba)?,
            (Write | Trim, Write) => Conflict::Depend(existing_id),
            (Write, Read) if existing_is_mapping && cancellable => self.cancel(existing_id, id, lba)?,
            (Write, Read) => Conflict::Depend(existing_id),
            (Read, GcMigration) => {
                record_mut(&mut self.operations, id)?.noop = true;
                Conflict::Depend(existing_id)
            }
            (Read, Read) => {
                if !new_is_gc {
                    record_mut(&mut self.operations, id)?.noop = true;
                }
                Conflict::Depend(existing_id)
            }
            (Read, Trim) if new_is_gc => {
                self.bm.register_trim_making_gc_redundant();
                record_mut(&mut self.operations, id)?.noop = true;
                Conflict::Flow
            }
            (Read, Trim) | (Trim, Trim) | (Unaddressed, _) | (_, Unaddressed) => {
                let existing = record(&self.operations, existing_id)?;
                return Err(SimError::UndefinedConflict {
                    new_event: event.id(),
                    new_type: event.event_type,
                    existing_event: existing.current.unwrap_or_else(|| event.id()),
                    existing_type: existing.kind,
                    logical_address: lba,
                });
            }
        };
        Ok(conflict)
    }

    /// Turns a not yet dispatched owner into a noop and hands its address over.
    fn cancel(&mut self, existing: OpId, new: OpId, lba: Lba) -> Result<Conflict> {
        debug!("{new} cancels {existing} on lba {lba}");
        record_mut(&mut self.operations, existing)?.noop = true;
        self.owners.insert(lba, new);
        Ok(Conflict::Owner)
    }

    fn resolve_addresses(&mut self, event: &mut Event, id: OpId) -> Result<()> {
        let operation = record(&self.operations, id)?;
        let (gc, started, migration) = (operation.gc, operation.started, operation.victim.is_some());
        match event.event_type {
            EventType::ReadCommand if !event.address.is_valid() => {
                self.resolve_read_address(event);
                if !event.address.is_valid() {
                    trace!("lba {:?} is unmapped, {event} becomes a noop", event.logical_address);
                    record_mut(&mut self.operations, id)?.noop = true;
                }
            }
            EventType::Write | EventType::Trim if !gc => self.ftl.set_replace_address(event),
            _ => {}
        }
        if migration && !started {
            let source = match event.event_type {
                EventType::CopyBack => event.replace_address,
                _ => event.address,
            };
            if self.flash.page_state(&source) != PageState::Valid {
                trace!("source {source} of {event} is stale");
                record_mut(&mut self.operations, id)?.noop = true;
            }
        }
        Ok(())
    }

    /// Flexible reads take the candidate whose die frees up first.
    fn resolve_read_address(&self, event: &mut Event) {
        if let EventKind::Flexible { candidates } = &event.kind {
            let best = candidates
                .iter()
                .filter(|candidate| candidate.valid == Depth::Page)
                .filter(|candidate| self.flash.page_state(candidate) == PageState::Valid)
                .min_by(|a, b| {
                    let a = self.flash.die_finish_time(a.package, a.die);
                    let b = self.flash.die_finish_time(b.package, b.die);
                    a.total_cmp(&b)
                })
                .copied();
            if let Some(best) = best {
                event.address = best;
                return;
            }
        }
        self.ftl.set_read_address(event);
    }

    fn enqueue_runnable(&mut self, event: Event) {
        if event.current_time() < self.window_end {
            self.current.push(event);
        } else {
            self.future.push(event);
        }
    }

    fn dispatch_current(&mut self) -> Result<()> {
        let batch = std::mem::take(&mut self.current);
        let (transfers, rest): (Vec<Event>, Vec<Event>) = if self.config.allow_deferring_transfers {
            (Vec::new(), batch)
        } else {
            batch.into_iter().partition(|event| event.event_type == EventType::ReadTransfer)
        };
        let transfers = priority::arrange(SchedulingScheme::Fifo, transfers);
        let rest = priority::arrange(self.config.scheduling_scheme, rest);
        for event in transfers.into_iter().chain(rest) {
            self.dispatch(event)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, mut event: Event) -> Result<()> {
        let id = Self::op_of(&event)?;
        let operation = record(&self.operations, id)?;
        event.noop |= operation.noop;
        event.garbage_collection_op |= operation.gc;
        if event.noop || !event.event_type.needs_hardware() {
            return self.handle_finished_event(event);
        }

        if event.event_type.is_write() {
            let address = self.bm.choose_write_address(&event, &self.flash, &mut self.migrator);
            self.drain_outbox();
            if !address.is_valid() && event.event_type == EventType::CopyBack {
                return self.copy_back_through_controller(event, id);
            }
            if !address.is_valid() {
                return self.hold_write(event);
            }
            event.address = address;
        }

        let wait = self.bm.in_how_long_can_this_event_be_scheduled(&event.address, &event, &self.flash);
        if wait > 0.0 {
            event.incr_accumulated_wait_time(wait);
            trace!("{event} waits {wait:.1} for its die");
            self.enqueue_runnable(event);
            return Ok(());
        }

        if self.flash.issue(&mut event) != Status::Success {
            return Err(SimError::HardwareFailure {
                event: event.id(),
                event_type: event.event_type,
                address: event.address,
            });
        }
        record_mut(&mut self.operations, id)?.dispatched = true;
        if event.event_type.is_write() {
            self.bm.register_write_outcome(&event, Status::Success, &mut self.migrator)?;
        }
        self.in_flight.push(event);
        self.drain_outbox();
        Ok(())
    }

    /// Replaces a copy-back whose die has no room with a read into the
    /// controller and a write that may land on any die.
    fn copy_back_through_controller(&mut self, copy_back: Event, id: OpId) -> Result<()> {
        let source = copy_back.replace_address;
        let mut write = Event::new(EventType::Write, copy_back.logical_address, copy_back.start_time)
            .with_replace_address(source);
        write.garbage_collection_op = true;
        write.wear_leveling_op = copy_back.wear_leveling_op;
        write.set_op(id);

        let mut read = copy_back;
        read.event_type = EventType::Read;
        read.address = source;
        read.replace_address = Address::INVALID;
        let (command, transfer) = read.split_read();
        debug!("die of {source} is full, {command} reads the page into the controller");

        let operation = record_mut(&mut self.operations, id)?;
        operation.chain.push_front(write);
        operation.chain.push_front(transfer);
        operation.current = Some(command.id());
        self.enqueue_runnable(command);
        Ok(())
    }

    /// Holds a write nothing can take until the next completion or one write
    /// delay. Two delays without anything in flight mean the drive is stuck.
    fn hold_write(&mut self, mut event: Event) -> Result<()> {
        let time = event.current_time();
        let delay = self.config.page_write_delay;
        if self.in_flight.is_empty() {
            let since = *self.idle_since.get_or_insert(time);
            if time - since >= 2.0 * delay {
                return Err(SimError::Invariant(format!(
                    "device stalled: {event} cannot be placed, {} pages free, {} available, nothing in flight",
                    self.bm.num_free_pages(),
                    self.bm.num_available_pages_for_new_writes()
                )));
            }
        }
        let until = self
            .in_flight
            .iter()
            .map(Event::current_time)
            .filter(|finish| *finish > time)
            .fold(time + delay, Time::min);
        event.wait_until(until);
        debug!("no room for {event}, holding it");
        self.enqueue_runnable(event);
        Ok(())
    }

    fn handle_finished_event(&mut self, mut event: Event) -> Result<()> {
        let id = Self::op_of(&event)?;
        let status = Status::Success;
        if !event.noop {
            match event.event_type {
                EventType::ReadCommand => self.bm.register_read_command_outcome(&event, status),
                EventType::ReadTransfer => {
                    self.bm.register_read_transfer_outcome(&event, status);
                    self.ftl.register_read_completion(&event, status);
                }
                EventType::Write | EventType::CopyBack => {
                    self.ftl.register_write_completion(&event, status);
                    // a migration nobody maps to is garbage right away
                    if event.garbage_collection_op && self.ftl.get_logical_address(&event.address).is_none() {
                        self.flash.invalidate(&event.address);
                    }
                    self.register_invalidation(&event);
                }
                EventType::Trim => {
                    self.ftl.register_trim_completion(&mut event);
                    self.flash.invalidate(&event.replace_address);
                    self.register_invalidation(&event);
                }
                EventType::Erase => {
                    self.migrator.register_erase_completion(&event, &self.flash);
                    self.bm.register_erase_outcome(&event, status, &self.flash, &mut self.migrator);
                }
                _ => {}
            }
            if event.event_type.needs_hardware() {
                self.idle_since = None;
            }
        }
        trace!("finished {event}");
        self.completed.push(event.clone());
        self.advance(id, event)?;
        self.drain_outbox();
        Ok(())
    }

    fn register_invalidation(&mut self, event: &Event) {
        if self.migrator.register_event_completion(event, &self.flash) {
            self.bm.check_if_should_trigger_more_gc(event.current_time(), &mut self.migrator);
        }
    }

    /// Activates the next step of the chain, or finalizes the operation.
    fn advance(&mut self, id: OpId, finished: Event) -> Result<()> {
        let operation = record_mut(&mut self.operations, id)?;
        operation.started = true;
        let Some(mut next) = operation.chain.pop_front() else {
            return self.finalize(id, &finished);
        };
        operation.current = Some(next.id());
        next.inherit_timing(&finished);
        if next.event_type == EventType::ReadTransfer {
            next.address = finished.address;
        }
        self.init_event(next)
    }

    /// Releases the address and re-initializes dependents in attach order.
    fn finalize(&mut self, id: OpId, finished: &Event) -> Result<()> {
        let operation = self
            .operations
            .remove(id)
            .ok_or_else(|| SimError::Invariant(format!("operation {id} finalized twice")))?;
        if let Some(lba) = operation.logical_address {
            if self.owners.get(&lba) == Some(&id) {
                self.owners.remove(&lba);
            }
        }
        let time = finished.current_time();
        if operation.notify_gc_redundant {
            self.bm.register_trim_making_gc_redundant();
        }
        if let Some(block) = operation.victim {
            if operation.noop && !operation.handed_off {
                self.bm.release_migration_reservation()?;
            }
            self.migrator.register_migration_completion(block, &self.flash, time)?;
        }
        if operation.carries_migration && operation.noop {
            self.bm.release_migration_reservation()?;
        }

        for dependent in operation.dependents {
            let mut parked = record_mut(&mut self.operations, dependent)?
                .parked
                .take()
                .ok_or_else(|| SimError::Invariant(format!("{dependent} waited on {id} without a parked event")))?;
            parked.wait_until(time);
            self.init_event(parked)?;
        }
        Ok(())
    }

    fn drain_outbox(&mut self) {
        for chain in self.migrator.take_outbox() {
            self.schedule_events_queue(chain);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BlockManagerPolicy, Geometry, PAGE_SIZE};
    use crate::ftl::PageFtl;

    fn config() -> Config {
        let mut config = Config::default();
        config.geometry = Geometry {
            packages: 1,
            dies_per_package: 1,
            planes_per_die: 1,
            blocks_per_plane: 4,
            pages_per_block: 4,
            page_size: PAGE_SIZE,
        };
        config.over_provisioning_factor = 0.0;
        config
    }

    fn scheduler_with(config: Config) -> IoScheduler {
        let config = Arc::new(config);
        IoScheduler::new(Arc::clone(&config), Box::new(PageFtl::new(config)))
    }

    fn scheduler() -> IoScheduler {
        scheduler_with(config())
    }

    /// No page is promised to a migration any more and every free page is reachable.
    fn assert_settled(scheduler: &IoScheduler) {
        let bm = scheduler.block_manager();
        assert_eq!(bm.reserved_for_gc(), 0);
        assert_eq!(bm.num_free_pages(), bm.free_pages_in_structures());
        assert_eq!(bm.num_available_pages_for_new_writes(), bm.num_free_pages());
    }

    fn submit(scheduler: &mut IoScheduler, event_type: EventType, lba: Lba, time: Time) -> OpId {
        let ftl = scheduler.ftl_mut();
        let chain = match event_type {
            EventType::Write => ftl.write(lba, time),
            EventType::Read => ftl.read(lba, time),
            EventType::Trim => ftl.trim(lba, time),
            other => panic!("no host request for {other:?}"),
        };
        scheduler.schedule_events_queue(chain).unwrap()
    }

    fn run(scheduler: &mut IoScheduler) -> Result<Vec<Event>> {
        let mut completed = Vec::new();
        while !scheduler.is_empty() {
            scheduler.execute_soonest_events()?;
            completed.extend(scheduler.take_completed());
        }
        assert_eq!(scheduler.pending_operations(), 0);
        Ok(completed)
    }

    fn finished(events: &[Event], event_type: EventType, lba: Lba) -> Vec<&Event> {
        events.iter().filter(|e| e.event_type == event_type && e.logical_address == Some(lba)).collect()
    }

    fn mapped(scheduler: &IoScheduler, lba: Lba) -> Address {
        let mut probe = Event::application(EventType::Read, lba, 0.0);
        scheduler.ftl().set_read_address(&mut probe);
        probe.address
    }

    #[test]
    fn read_waits_for_pending_write() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 3, 0.0);
        submit(&mut s, EventType::Read, 3, 0.1);
        let events = run(&mut s).unwrap();

        let write = finished(&events, EventType::Write, 3)[0];
        let transfer = finished(&events, EventType::ReadTransfer, 3)[0];
        assert!(!write.noop && !transfer.noop);
        assert_eq!(transfer.address, write.address);
        assert!(transfer.current_time() > write.current_time());
    }

    #[test]
    fn trim_cancels_undispatched_write() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 5, 0.0);
        submit(&mut s, EventType::Trim, 5, 0.1);
        let events = run(&mut s).unwrap();

        assert!(finished(&events, EventType::Write, 5)[0].noop);
        assert!(!finished(&events, EventType::Trim, 5)[0].noop);
        assert_eq!(s.block_manager().num_free_pages(), 16);
        assert!(!mapped(&s, 5).is_valid());
    }

    #[test]
    fn later_write_supersedes_undispatched_one() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 1, 0.0);
        submit(&mut s, EventType::Write, 1, 0.5);
        let events = run(&mut s).unwrap();

        let writes = finished(&events, EventType::Write, 1);
        assert_eq!(writes.iter().filter(|w| w.noop).count(), 1);
        assert_eq!(s.block_manager().num_free_pages(), 15);
    }

    #[test]
    fn write_waits_for_dispatched_write() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 1, 0.0);
        submit(&mut s, EventType::Write, 1, 10.0);
        let events = run(&mut s).unwrap();

        let writes = finished(&events, EventType::Write, 1);
        assert_eq!(writes.len(), 2);
        assert!(writes.iter().all(|w| !w.noop));
        assert_eq!(writes[1].replace_address, writes[0].address);
        assert_eq!(mapped(&s, 1), writes[1].address);
        assert_eq!(s.flash().page_state(&writes[0].address), PageState::Invalid);
    }

    #[test]
    fn dependents_are_released_in_attach_order() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 2, 0.0);
        submit(&mut s, EventType::Read, 2, 10.0);
        submit(&mut s, EventType::Write, 2, 20.0);
        let events = run(&mut s).unwrap();

        let writes = finished(&events, EventType::Write, 2);
        let transfer = finished(&events, EventType::ReadTransfer, 2)[0];
        assert_eq!(transfer.address, writes[0].address);
        assert!(writes[0].current_time() < transfer.current_time());
        assert!(transfer.current_time() < writes[1].current_time());
        // the read waited from the first write's completion
        assert!(transfer.latency() >= writes[0].current_time() - 10.0);
    }

    #[test]
    fn write_cancels_pending_mapping_read() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 6, 0.0);
        run(&mut s).unwrap();
        let old = mapped(&s, 6);
        let mut lookup = Event::new(EventType::Read, Some(6), 5000.0);
        lookup.mapping_op = true;
        s.schedule_event(lookup).unwrap();
        submit(&mut s, EventType::Write, 6, 5000.5);
        let events = run(&mut s).unwrap();

        assert!(finished(&events, EventType::ReadTransfer, 6)[0].noop);
        let write = finished(&events, EventType::Write, 6)[0];
        assert!(!write.noop);
        assert_eq!(write.replace_address, old);
        assert_eq!(mapped(&s, 6), write.address);
    }

    #[test]
    fn write_waits_for_pending_trim() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 3, 0.0);
        run(&mut s).unwrap();
        let old = mapped(&s, 3);
        submit(&mut s, EventType::Trim, 3, 5000.0);
        submit(&mut s, EventType::Write, 3, 5000.5);
        let events = run(&mut s).unwrap();

        let trim = finished(&events, EventType::Trim, 3)[0];
        let write = finished(&events, EventType::Write, 3)[0];
        assert!(!trim.noop && !write.noop);
        assert_eq!(trim.replace_address, old);
        // resolved only after the trim unmapped the old page
        assert!(!write.replace_address.is_valid());
        assert!(write.current_time() > trim.current_time());
        assert_eq!(mapped(&s, 3), write.address);
        assert_eq!(s.flash().page_state(&old), PageState::Invalid);
    }

    #[test]
    fn trim_waits_for_pending_read() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 2, 0.0);
        run(&mut s).unwrap();
        let old = mapped(&s, 2);
        submit(&mut s, EventType::Read, 2, 5000.0);
        submit(&mut s, EventType::Trim, 2, 5000.5);
        let events = run(&mut s).unwrap();

        let transfer = finished(&events, EventType::ReadTransfer, 2)[0];
        let trim = finished(&events, EventType::Trim, 2)[0];
        assert!(!transfer.noop && !trim.noop);
        assert_eq!(transfer.address, old);
        assert!(trim.current_time() >= transfer.current_time());
        assert!(!mapped(&s, 2).is_valid());
    }

    #[test]
    fn repeated_read_becomes_noop() {
        let mut s = scheduler();
        submit(&mut s, EventType::Write, 4, 0.0);
        run(&mut s).unwrap();
        submit(&mut s, EventType::Read, 4, 5000.0);
        submit(&mut s, EventType::Read, 4, 5000.5);
        let events = run(&mut s).unwrap();

        let transfers = finished(&events, EventType::ReadTransfer, 4);
        assert_eq!(transfers.len(), 2);
        assert_eq!(transfers.iter().filter(|t| t.noop).count(), 1);
        assert!(transfers[1].current_time() >= transfers[0].current_time());
    }

    #[test]
    fn unmapped_read_is_a_noop() {
        let mut s = scheduler();
        s.schedule_event(Event::application(EventType::Read, 9, 0.0)).unwrap();
        let events = run(&mut s).unwrap();
        assert!(events.iter().filter(|e| e.event_type.is_read()).all(|e| e.noop));
    }

    #[test]
    fn application_read_against_trim_is_undefined() {
        let mut s = scheduler();
        submit(&mut s, EventType::Trim, 7, 0.0);
        submit(&mut s, EventType::Read, 7, 0.1);
        let result = run(&mut s);
        assert!(matches!(
            result,
            Err(SimError::UndefinedConflict { new_type: EventType::ReadCommand, existing_type: EventType::Trim, .. })
        ));
    }

    #[test]
    fn trim_against_trim_is_undefined() {
        let mut s = scheduler();
        submit(&mut s, EventType::Trim, 7, 0.0);
        submit(&mut s, EventType::Trim, 7, 0.1);
        assert!(matches!(run(&mut s), Err(SimError::UndefinedConflict { .. })));
    }

    /// Block 0 holds lbas 0..4 with lba 0 rewritten into block 1.
    fn with_victim() -> IoScheduler {
        with_victim_on(config())
    }

    fn with_victim_on(config: Config) -> IoScheduler {
        let mut s = scheduler_with(config);
        for (i, lba) in [0, 1, 2, 3, 0].into_iter().enumerate() {
            submit(&mut s, EventType::Write, lba, i as Time * 2000.0);
        }
        run(&mut s).unwrap();
        assert!(s.migrator().garbage_collector().is_candidate(0));
        s
    }

    #[test]
    fn migration_promotes_waiting_application_write() {
        let mut s = with_victim();
        // keeps the die busy so the write to lba 1 is still waiting
        submit(&mut s, EventType::Write, 5, 19_999.0);
        submit(&mut s, EventType::Write, 1, 20_000.0);
        s.schedule_gc(20_000.2, Some(0), Some(0));
        let events = run(&mut s).unwrap();

        let write = finished(&events, EventType::Write, 1)
            .into_iter()
            .find(|w| w.original_application_io)
            .unwrap();
        assert!(write.garbage_collection_op);
        assert_eq!(mapped(&s, 1), write.address);
        assert!(events.iter().any(|e| e.event_type == EventType::Erase));
        assert_eq!(s.flash().block_by_index(0).erase_count(), 1);
        assert_settled(&s);
    }

    #[test]
    fn trim_waits_for_promoted_write() {
        let mut s = with_victim();
        submit(&mut s, EventType::Write, 5, 19_999.0);
        submit(&mut s, EventType::Write, 1, 20_000.0);
        s.schedule_gc(20_000.2, Some(0), Some(0));
        submit(&mut s, EventType::Trim, 1, 20_001.5);
        let events = run(&mut s).unwrap();

        let write = finished(&events, EventType::Write, 1)
            .into_iter()
            .find(|w| w.original_application_io)
            .unwrap();
        let trim = finished(&events, EventType::Trim, 1)[0];
        assert!(write.garbage_collection_op && !write.noop);
        assert!(!trim.noop);
        assert_eq!(trim.replace_address, write.address);
        assert!(trim.current_time() >= write.current_time());
        assert!(!mapped(&s, 1).is_valid());
        assert_eq!(s.block_manager().redundant_gc_migrations(), 1);
        assert_settled(&s);
    }

    #[test]
    fn trim_waits_for_migration_and_reports_it_redundant() {
        let mut s = with_victim();
        // keeps the die busy so the migration is not dispatched yet
        submit(&mut s, EventType::Write, 5, 19_999.0);
        s.schedule_gc(20_000.2, Some(0), Some(0));
        submit(&mut s, EventType::Trim, 1, 20_001.5);
        let events = run(&mut s).unwrap();

        let moved = finished(&events, EventType::Write, 1);
        assert_eq!(moved.len(), 1);
        assert!(moved[0].garbage_collection_op && !moved[0].noop);
        let trim = finished(&events, EventType::Trim, 1)[0];
        assert_eq!(trim.replace_address, moved[0].address);
        assert!(trim.current_time() >= moved[0].current_time());

        assert_eq!(s.block_manager().redundant_gc_migrations(), 1);
        assert!(!mapped(&s, 1).is_valid());
        assert!(events.iter().any(|e| e.event_type == EventType::Erase));
        for lba in [2, 3] {
            assert!(matches!(s.ftl().get_logical_address(&mapped(&s, lba)), Some(l) if l == lba));
            assert_ne!(mapped(&s, lba).block, 0);
        }
        assert_settled(&s);
    }

    #[test]
    fn migration_read_of_trimmed_page_is_dropped() {
        let mut s = with_victim();
        submit(&mut s, EventType::Trim, 1, 20_000.0);
        s.schedule_gc(20_000.2, Some(0), Some(0));
        let events = run(&mut s).unwrap();

        let reads: Vec<&Event> = finished(&events, EventType::ReadCommand, 1)
            .into_iter()
            .filter(|e| e.garbage_collection_op)
            .collect();
        assert_eq!(reads.len(), 1);
        assert!(reads[0].noop);
        assert!(finished(&events, EventType::Write, 1).iter().all(|w| w.noop || w.original_application_io));
        assert_eq!(s.block_manager().redundant_gc_migrations(), 1);
        assert!(!mapped(&s, 1).is_valid());
        assert_eq!(s.flash().block_by_index(0).erase_count(), 1);
        assert_settled(&s);
    }

    #[test]
    fn copy_back_relocates_within_the_die() {
        let mut config = config();
        config.enable_copy_back = true;
        let mut s = with_victim_on(config);
        s.schedule_gc(20_000.0, Some(0), Some(0));
        let events = run(&mut s).unwrap();

        let copies: Vec<&Event> = events.iter().filter(|e| e.event_type == EventType::CopyBack).collect();
        assert_eq!(copies.len(), 3);
        assert!(copies.iter().all(|e| !e.noop && e.garbage_collection_op));
        assert!(copies.iter().all(|e| e.replace_address.block == 0 && e.address.block != 0));
        for lba in 1..4 {
            assert_ne!(mapped(&s, lba).block, 0);
        }
        assert_eq!(s.flash().block_by_index(0).erase_count(), 1);
        assert_settled(&s);
    }

    #[test]
    fn copy_back_goes_through_controller_when_its_die_is_full() {
        let mut config = config();
        config.geometry.dies_per_package = 2;
        config.geometry.blocks_per_plane = 2;
        config.block_manager = BlockManagerPolicy::ShortestQueue;
        config.enable_copy_back = true;
        let mut s = scheduler_with(config);
        // idle dies tie, so every spaced write lands on die 0 until it is full
        for lba in 0..8 {
            submit(&mut s, EventType::Write, lba, lba as Time * 5000.0);
        }
        run(&mut s).unwrap();
        assert!((0..8).all(|lba| mapped(&s, lba).die == 0));

        submit(&mut s, EventType::Write, 0, 40_000.0);
        let events = run(&mut s).unwrap();

        assert!(events.iter().all(|e| e.event_type != EventType::CopyBack));
        let moved: Vec<&Event> = events
            .iter()
            .filter(|e| e.event_type == EventType::Write && e.garbage_collection_op)
            .collect();
        assert_eq!(moved.len(), 3);
        assert!(moved.iter().all(|e| e.replace_address.die == 0 && e.address.die == 1));
        for lba in 1..4 {
            assert_eq!(mapped(&s, lba).die, 1);
        }
        assert!(events.iter().any(|e| e.event_type == EventType::Erase && e.address.die == 0));
        assert_settled(&s);
    }
}
