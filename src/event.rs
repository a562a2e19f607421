use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::address::Address;
use crate::config::{Counter, Lba, Time};
use crate::operation::OpId;

static NEXT_EVENT_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(u64);

impl EventId {
    fn next() -> Self {
        EventId(NEXT_EVENT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Read,
    ReadCommand,
    ReadTransfer,
    Write,
    Erase,
    Trim,
    CopyBack,
    GarbageCollection,
    Message,
}

impl EventType {
    pub fn is_read(self) -> bool {
        matches!(self, EventType::Read | EventType::ReadCommand | EventType::ReadTransfer)
    }

    pub fn is_write(self) -> bool {
        matches!(self, EventType::Write | EventType::CopyBack)
    }

    /// Whether the event occupies flash resources when issued.
    pub fn needs_hardware(self) -> bool {
        matches!(
            self,
            EventType::ReadCommand | EventType::ReadTransfer | EventType::Write | EventType::CopyBack | EventType::Erase
        )
    }
}

/// Plain events target one location; flexible reads may be served from any
/// of several copies, picked when the scheduler resolves them.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum EventKind {
    #[default]
    Plain,
    Flexible { candidates: Vec<Address> },
}

/// A single step of work flowing through the simulator.
#[derive(Debug, Clone)]
pub struct Event {
    id: EventId,
    op: Option<OpId>,
    pub event_type: EventType,
    pub kind: EventKind,
    pub logical_address: Option<Lba>,
    pub address: Address,
    pub replace_address: Address,
    pub size: Counter,

    pub start_time: Time,
    pub execution_time: Time,
    pub bus_wait_time: Time,
    pub accumulated_wait_time: Time,

    pub garbage_collection_op: bool,
    pub wear_leveling_op: bool,
    pub mapping_op: bool,
    pub original_application_io: bool,
    pub noop: bool,
    pub cached_write: bool,

    /// Age class a garbage-collection request is restricted to.
    pub age_class: Option<Counter>,
    /// Placement hint for the tag-based block manager.
    pub tag: Option<u32>,
}

impl Event {
    pub fn new(event_type: EventType, logical_address: Option<Lba>, start_time: Time) -> Self {
        Event {
            id: EventId::next(),
            op: None,
            event_type,
            kind: EventKind::Plain,
            logical_address,
            address: Address::INVALID,
            replace_address: Address::INVALID,
            size: 1,
            start_time,
            execution_time: 0.0,
            bus_wait_time: 0.0,
            accumulated_wait_time: 0.0,
            garbage_collection_op: false,
            wear_leveling_op: false,
            mapping_op: false,
            original_application_io: false,
            noop: false,
            cached_write: false,
            age_class: None,
            tag: None,
        }
    }

    pub fn application(event_type: EventType, logical_address: Lba, start_time: Time) -> Self {
        let mut event = Event::new(event_type, Some(logical_address), start_time);
        event.original_application_io = true;
        event
    }

    pub fn flexible_read(logical_address: Lba, candidates: Vec<Address>, start_time: Time) -> Self {
        let mut event = Event::application(EventType::Read, logical_address, start_time);
        event.kind = EventKind::Flexible { candidates };
        event
    }

    pub fn with_address(mut self, address: Address) -> Self {
        self.address = address;
        self
    }

    pub fn with_replace_address(mut self, address: Address) -> Self {
        self.replace_address = address;
        self
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    pub fn op(&self) -> Option<OpId> {
        self.op
    }

    pub(crate) fn set_op(&mut self, op: OpId) {
        self.op = Some(op);
    }

    /// Time at which the event is due or, once issued, finishes.
    pub fn current_time(&self) -> Time {
        self.start_time + self.accumulated_wait_time + self.bus_wait_time + self.execution_time
    }

    /// Start to finish, including every wait.
    pub fn latency(&self) -> Time {
        self.current_time() - self.start_time
    }

    pub fn incr_accumulated_wait_time(&mut self, delta: Time) {
        debug_assert!(delta >= 0.0, "negative wait {delta} on {}", self.id);
        self.accumulated_wait_time += delta;
    }

    /// Holds the event until at least `time`.
    pub fn wait_until(&mut self, time: Time) {
        let now = self.current_time();
        if time > now {
            self.incr_accumulated_wait_time(time - now);
        }
    }

    /// Carries the timeline of the previous step of the same operation over to this one.
    pub fn inherit_timing(&mut self, previous: &Event) {
        self.start_time = previous.start_time;
        self.execution_time = 0.0;
        self.bus_wait_time = 0.0;
        self.accumulated_wait_time = previous.current_time() - previous.start_time;
    }

    /// Splits a READ into its command and transfer halves.
    pub fn split_read(mut self) -> (Event, Event) {
        debug_assert_eq!(self.event_type, EventType::Read);
        self.event_type = EventType::ReadCommand;
        let mut transfer = self.clone();
        transfer.id = EventId::next();
        transfer.event_type = EventType::ReadTransfer;
        (self, transfer)
    }

    pub fn is_internal(&self) -> bool {
        self.garbage_collection_op || self.wear_leveling_op || self.mapping_op
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?}", self.id, self.event_type)?;
        if let Some(lba) = self.logical_address {
            write!(f, " lba {lba}")?;
        }
        write!(f, " at {} t={:.1}", self.address, self.current_time())?;
        if self.replace_address.is_valid() {
            write!(f, " replacing {}", self.replace_address)?;
        }
        if self.garbage_collection_op {
            write!(f, " [gc]")?;
        }
        if self.noop {
            write!(f, " [noop]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        let a = Event::new(EventType::Write, Some(1), 0.0);
        let b = Event::new(EventType::Write, Some(1), 0.0);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn split_read_keeps_target_with_fresh_id() {
        let read = Event::application(EventType::Read, 3, 10.0);
        let id = read.id();
        let (command, transfer) = read.split_read();
        assert_eq!(command.id(), id);
        assert_ne!(transfer.id(), id);
        assert_eq!(command.event_type, EventType::ReadCommand);
        assert_eq!(transfer.event_type, EventType::ReadTransfer);
        assert_eq!(transfer.logical_address, Some(3));
    }

    #[test]
    fn waiting_moves_current_time() {
        let mut event = Event::new(EventType::Write, Some(0), 100.0);
        event.wait_until(50.0);
        assert_eq!(event.current_time(), 100.0);
        event.wait_until(130.0);
        assert_eq!(event.accumulated_wait_time, 30.0);
        event.execution_time = 20.0;
        assert_eq!(event.current_time(), 150.0);
    }

    #[test]
    fn next_step_inherits_elapsed_time() {
        let mut first = Event::new(EventType::ReadCommand, Some(0), 10.0);
        first.execution_time = 120.0;
        first.bus_wait_time = 5.0;
        let mut second = Event::new(EventType::ReadTransfer, Some(0), 0.0);
        second.inherit_timing(&first);
        assert_eq!(second.start_time, 10.0);
        assert_eq!(second.current_time(), first.current_time());
        assert_eq!(second.latency(), 125.0);
    }
}
