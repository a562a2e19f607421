use std::collections::VecDeque;
use std::fmt;

use crate::config::{BlockId, Lba};
use crate::event::{Event, EventId, EventType};

/// Generational handle of an in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId {
    index: u32,
    generation: u32,
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}.{}", self.index, self.generation)
    }
}

/// How an operation takes part in logical address conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpClass {
    Read,
    Write,
    Trim,
    /// Relocation of a valid page off a garbage-collection victim.
    GcMigration,
    /// Erases, GC requests and messages; never conflict.
    Unaddressed,
}

/// Everything the scheduler knows about one logical operation: the steps
/// still to run, who waits on it and whether it was cancelled.
#[derive(Debug)]
pub struct Operation {
    pub kind: EventType,
    pub logical_address: Option<Lba>,
    pub gc: bool,
    pub mapping: bool,
    /// Steps after the current one, in execution order.
    pub chain: VecDeque<Event>,
    pub current: Option<EventId>,
    /// First step, held back while the operation depends on another.
    pub parked: Option<Event>,
    /// Operations waiting on this one, in the order they were attached.
    pub dependents: VecDeque<OpId>,
    /// First step finished; later steps skip conflict detection.
    pub started: bool,
    pub dispatched: bool,
    pub noop: bool,
    /// Noop migration whose page is moved by a promoted application write.
    pub handed_off: bool,
    /// Promoted application write using the page reserved for a migration.
    pub carries_migration: bool,
    pub notify_gc_redundant: bool,
    /// Block this operation migrates a page off, if any.
    pub victim: Option<BlockId>,
}

impl Operation {
    pub fn new(kind: EventType, logical_address: Option<Lba>, gc: bool, mapping: bool) -> Self {
        Operation {
            kind,
            logical_address,
            gc,
            mapping,
            chain: VecDeque::new(),
            current: None,
            parked: None,
            dependents: VecDeque::new(),
            started: false,
            dispatched: false,
            noop: false,
            handed_off: false,
            carries_migration: false,
            notify_gc_redundant: false,
            victim: None,
        }
    }

    pub fn class(&self) -> OpClass {
        if self.logical_address.is_none() {
            return OpClass::Unaddressed;
        }
        match self.kind {
            EventType::Write | EventType::CopyBack if self.gc => OpClass::GcMigration,
            EventType::CopyBack => OpClass::GcMigration,
            EventType::Write => OpClass::Write,
            EventType::Trim => OpClass::Trim,
            EventType::Read | EventType::ReadCommand | EventType::ReadTransfer => OpClass::Read,
            _ => OpClass::Unaddressed,
        }
    }

    /// Nothing has reached the flash yet, so the operation may still be dropped.
    pub fn cancellable(&self) -> bool {
        !self.dispatched
    }
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    record: Option<Operation>,
}

/// Arena owning every live [`Operation`].
#[derive(Debug, Default)]
pub struct Operations {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Operations {
    pub fn insert(&mut self, operation: Operation) -> OpId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.generation += 1;
            slot.record = Some(operation);
            return OpId { index, generation: slot.generation };
        }
        self.slots.push(Slot { generation: 0, record: Some(operation) });
        OpId { index: (self.slots.len() - 1) as u32, generation: 0 }
    }

    pub fn get(&self, id: OpId) -> Option<&Operation> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_ref())
    }

    pub fn get_mut(&mut self, id: OpId) -> Option<&mut Operation> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.record.as_mut())
    }

    pub fn remove(&mut self, id: OpId) -> Option<Operation> {
        let slot = self.slots.get_mut(id.index as usize).filter(|slot| slot.generation == id.generation)?;
        let record = slot.record.take()?;
        self.free.push(id.index);
        self.live -= 1;
        Some(record)
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_handles_do_not_alias_reused_slots() {
        let mut ops = Operations::default();
        let first = ops.insert(Operation::new(EventType::Write, Some(1), false, false));
        assert!(ops.remove(first).is_some());

        let second = ops.insert(Operation::new(EventType::Trim, Some(2), false, false));
        assert_ne!(first, second);
        assert!(ops.get(first).is_none());
        assert_eq!(ops.get(second).unwrap().kind, EventType::Trim);
        assert!(ops.remove(first).is_none());
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn classifies_by_chain_type_and_origin() {
        assert_eq!(Operation::new(EventType::Write, Some(0), false, false).class(), OpClass::Write);
        assert_eq!(Operation::new(EventType::Write, Some(0), true, false).class(), OpClass::GcMigration);
        assert_eq!(Operation::new(EventType::CopyBack, Some(0), true, false).class(), OpClass::GcMigration);
        assert_eq!(Operation::new(EventType::Read, Some(0), false, true).class(), OpClass::Read);
        assert_eq!(Operation::new(EventType::Trim, Some(0), false, false).class(), OpClass::Trim);
        assert_eq!(Operation::new(EventType::Erase, None, true, false).class(), OpClass::Unaddressed);
    }
}
