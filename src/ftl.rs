use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use byte_unit::Byte;
use log::*;

use crate::address::{Address, Depth};
use crate::config::*;
use crate::event::{Event, EventKind, EventType};
use crate::flash::Status;

/// What the scheduler needs from a flash translation layer.
pub trait Ftl {
    fn logical_size(&self) -> Lba;

    /// Event chains for host requests.
    fn read(&mut self, lba: Lba, time: Time) -> VecDeque<Event>;
    fn write(&mut self, lba: Lba, time: Time) -> VecDeque<Event>;
    fn trim(&mut self, lba: Lba, time: Time) -> VecDeque<Event>;

    fn set_read_address(&self, event: &mut Event);
    fn set_replace_address(&self, event: &mut Event);

    fn register_read_completion(&mut self, event: &Event, status: Status);
    fn register_write_completion(&mut self, event: &Event, status: Status);
    fn register_trim_completion(&mut self, event: &mut Event);

    /// Logical page stored at a physical page, if any.
    fn get_logical_address(&self, physical: &Address) -> Option<Lba>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)] // for Vec resize
pub enum L2PValue {
    Invalid,
    Valid(Address),
}

/// Page-mapped FTL: one table entry per logical page.
pub struct PageFtl {
    config: Arc<Config>,
    l2p: Vec<L2PValue>,
    p2l: HashMap<BaseType, Lba>,
    logical_size: Lba,
}

impl PageFtl {
    pub fn new(config: Arc<Config>) -> Self {
        let geo = config.geometry;
        let all_pages = geo.total_pages();
        let logical_size = config.logical_size();

        trace!("ALL_PAGES: {}", all_pages);
        trace!("op_pages: {}", all_pages - logical_size);
        trace!(
            "Physical Capacity: {} bytes, {}",
            geo.capacity_bytes(),
            Byte::from(geo.capacity_bytes()).get_appropriate_unit(true).to_string()
        );
        trace!(
            "User Capacity: {} bytes, {}",
            logical_size * geo.page_size,
            Byte::from(logical_size * geo.page_size).get_appropriate_unit(true).to_string()
        );

        PageFtl {
            l2p: vec![L2PValue::Invalid; logical_size],
            p2l: HashMap::new(),
            logical_size,
            config,
        }
    }

    pub fn get_max_lba(&self) -> Lba {
        self.logical_size - 1
    }

    pub fn lookup(&self, lba: Lba) -> L2PValue {
        self.l2p[lba]
    }

    pub fn mapped_pages(&self) -> usize {
        self.p2l.len()
    }

    fn physical(&self, address: &Address) -> BaseType {
        address.get_linear_address(&self.config.geometry)
    }

    fn mapped_address(&self, lba: Lba) -> Address {
        match self.l2p.get(lba) {
            Some(L2PValue::Valid(address)) => *address,
            _ => Address::INVALID,
        }
    }

    fn unmap(&mut self, lba: Lba) {
        if let L2PValue::Valid(old) = self.l2p[lba] {
            let physical = self.physical(&old);
            self.p2l.remove(&physical);
        }
        self.l2p[lba] = L2PValue::Invalid;
    }
}

impl Ftl for PageFtl {
    fn logical_size(&self) -> Lba {
        self.logical_size
    }

    fn read(&mut self, lba: Lba, time: Time) -> VecDeque<Event> {
        VecDeque::from([Event::application(EventType::Read, lba, time)])
    }

    fn write(&mut self, lba: Lba, time: Time) -> VecDeque<Event> {
        VecDeque::from([Event::application(EventType::Write, lba, time)])
    }

    fn trim(&mut self, lba: Lba, time: Time) -> VecDeque<Event> {
        VecDeque::from([Event::application(EventType::Trim, lba, time)])
    }

    fn set_read_address(&self, event: &mut Event) {
        let Some(lba) = event.logical_address else { return };
        // flexible reads pick one of their candidates in the scheduler
        if matches!(&event.kind, EventKind::Flexible { candidates } if !candidates.is_empty()) {
            return;
        }
        event.address = self.mapped_address(lba);
    }

    fn set_replace_address(&self, event: &mut Event) {
        let Some(lba) = event.logical_address else { return };
        event.replace_address = self.mapped_address(lba);
    }

    fn register_read_completion(&mut self, event: &Event, status: Status) {
        if status == Status::Success && !event.noop {
            trace!("read of lba {:?} served from {}", event.logical_address, event.address);
        }
    }

    fn register_write_completion(&mut self, event: &Event, status: Status) {
        if status != Status::Success || event.noop {
            return;
        }
        let Some(lba) = event.logical_address else { return };
        // A migrated page only moves if nobody remapped it meanwhile.
        if event.garbage_collection_op && self.mapped_address(lba) != event.replace_address {
            debug!("dropping stale migration of lba {lba} to {}", event.address);
            return;
        }
        self.unmap(lba);
        let physical = self.physical(&event.address);
        self.l2p[lba] = L2PValue::Valid(Address { valid: Depth::Page, ..event.address });
        self.p2l.insert(physical, lba);
    }

    fn register_trim_completion(&mut self, event: &mut Event) {
        let Some(lba) = event.logical_address else { return };
        if event.noop {
            return;
        }
        self.unmap(lba);
    }

    fn get_logical_address(&self, physical: &Address) -> Option<Lba> {
        self.p2l.get(&self.physical(physical)).copied()
    }
}
