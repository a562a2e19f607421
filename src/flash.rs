//! Reference NAND model the scheduler issues to.
//!
//! Keeps per-page state for every block plus the few shared resources the
//! scheduler contends for: one bus per package, a busy horizon and a data
//! register per die. Timing is a plain sum of the configured delays.

use std::sync::Arc;

use log::trace;

use crate::address::{Address, Depth};
use crate::config::{BlockId, Config, Counter, Time};
use crate::event::{Event, EventType};
use crate::operation::OpId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Empty,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Free,
    PartiallyFree,
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    Failure,
}

#[derive(Debug, Clone)]
pub struct Block {
    address: Address,
    pages: Vec<PageState>,
    written: Counter,
    valid: Counter,
    invalid: Counter,
    erase_count: Counter,
    modification_time: Time,
}

impl Block {
    fn new(address: Address, pages_per_block: Counter) -> Self {
        Block {
            address,
            pages: vec![PageState::Empty; pages_per_block],
            written: 0,
            valid: 0,
            invalid: 0,
            erase_count: 0,
            modification_time: 0.0,
        }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn state(&self) -> BlockState {
        if self.written == 0 {
            BlockState::Free
        } else if self.written < self.pages.len() {
            BlockState::PartiallyFree
        } else if self.valid > 0 {
            BlockState::Active
        } else {
            BlockState::Inactive
        }
    }

    pub fn pages_valid(&self) -> Counter {
        self.valid
    }

    pub fn pages_invalid(&self) -> Counter {
        self.invalid
    }

    pub fn erase_count(&self) -> Counter {
        self.erase_count
    }

    pub fn modification_time(&self) -> Time {
        self.modification_time
    }

    pub fn page_state(&self, page: usize) -> PageState {
        self.pages[page]
    }

    /// Page addresses currently holding valid data.
    pub fn valid_pages(&self) -> impl Iterator<Item = Address> + '_ {
        let block = self.address;
        self.pages
            .iter()
            .enumerate()
            .filter(|(_, state)| **state == PageState::Valid)
            .map(move |(page, _)| Address { page, valid: Depth::Page, ..block })
    }

    fn program(&mut self, page: usize, time: Time) -> bool {
        if page != self.written || self.pages[page] != PageState::Empty {
            return false;
        }
        self.pages[page] = PageState::Valid;
        self.written += 1;
        self.valid += 1;
        self.modification_time = time;
        true
    }

    fn invalidate(&mut self, page: usize) -> bool {
        if self.pages[page] != PageState::Valid {
            return false;
        }
        self.pages[page] = PageState::Invalid;
        self.valid -= 1;
        self.invalid += 1;
        true
    }

    fn erase(&mut self, time: Time) {
        self.pages.fill(PageState::Empty);
        self.written = 0;
        self.valid = 0;
        self.invalid = 0;
        self.erase_count += 1;
        self.modification_time = time;
    }
}

#[derive(Debug, Clone, Default)]
struct Die {
    busy_until: Time,
    register: Option<OpId>,
}

pub struct Flash {
    config: Arc<Config>,
    blocks: Vec<Block>,
    channels: Vec<Time>,
    dies: Vec<Die>,
}

impl Flash {
    pub fn new(config: Arc<Config>) -> Self {
        let geo = config.geometry;
        let blocks = (0..geo.total_blocks())
            .map(|index| {
                let address = Address::from_linear(index * geo.pages_per_block, Depth::Block, &geo);
                Block::new(address, geo.pages_per_block)
            })
            .collect();
        Flash {
            blocks,
            channels: vec![0.0; geo.packages],
            dies: vec![Die::default(); geo.total_dies()],
            config,
        }
    }

    pub fn block(&self, address: &Address) -> &Block {
        &self.blocks[address.block_index(&self.config.geometry)]
    }

    pub fn block_by_index(&self, index: BlockId) -> &Block {
        &self.blocks[index]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    pub fn page_state(&self, address: &Address) -> PageState {
        self.block(address).page_state(address.page)
    }

    /// When the package's bus frees up.
    pub fn get_currently_executing_operation_finish_time(&self, package: usize) -> Time {
        self.channels[package]
    }

    pub fn die_finish_time(&self, package: usize, die: usize) -> Time {
        self.dies[self.config.geometry.die_index(package, die)].busy_until
    }

    pub fn register_is_busy(&self, package: usize, die: usize) -> bool {
        self.register_holder(package, die).is_some()
    }

    pub fn register_holder(&self, package: usize, die: usize) -> Option<OpId> {
        self.dies[self.config.geometry.die_index(package, die)].register
    }

    /// Marks a page stale, returning whether it held valid data.
    pub fn invalidate(&mut self, address: &Address) -> bool {
        if address.valid < Depth::Page {
            return false;
        }
        let index = address.block_index(&self.config.geometry);
        self.blocks[index].invalidate(address.page)
    }

    /// Executes a hardware event, accruing its bus wait and execution time.
    pub fn issue(&mut self, event: &mut Event) -> Status {
        let cfg = Arc::clone(&self.config);
        let address = event.address;
        if address.valid < Depth::Block {
            return Status::Failure;
        }
        let die_index = address.die_index(&cfg.geometry);
        let time = event.current_time();
        if self.dies[die_index].busy_until > time {
            return Status::Failure;
        }
        let register = self.dies[die_index].register;
        let owns_register = register.is_some() && register == event.op();
        if register.is_some() && !(event.event_type == EventType::ReadTransfer && owns_register) {
            return Status::Failure;
        }

        let start = time.max(self.channels[address.package]);
        let bus_wait = start - time;
        let (channel_busy, execution) = match event.event_type {
            EventType::ReadCommand => {
                if self.page_state(&address) != PageState::Valid {
                    return Status::Failure;
                }
                self.dies[die_index].register = event.op();
                (cfg.bus_ctrl_delay, cfg.bus_ctrl_delay + cfg.page_read_delay)
            }
            EventType::ReadTransfer => {
                if !owns_register {
                    return Status::Failure;
                }
                self.dies[die_index].register = None;
                let transfer = cfg.bus_ctrl_delay + cfg.bus_data_delay;
                (transfer, transfer)
            }
            EventType::Write => {
                let transfer = cfg.bus_ctrl_delay + cfg.bus_data_delay;
                if !self.program(event, start + transfer + cfg.page_write_delay) {
                    return Status::Failure;
                }
                (transfer, transfer + cfg.page_write_delay)
            }
            EventType::CopyBack => {
                if event.replace_address.compare(&address) < Depth::Die {
                    return Status::Failure;
                }
                let execution = cfg.bus_ctrl_delay + cfg.page_read_delay + cfg.page_write_delay;
                if !self.program(event, start + execution) {
                    return Status::Failure;
                }
                (cfg.bus_ctrl_delay, execution)
            }
            EventType::Erase => {
                let index = address.block_index(&cfg.geometry);
                if self.blocks[index].pages_valid() > 0 {
                    return Status::Failure;
                }
                let execution = cfg.bus_ctrl_delay + cfg.block_erase_delay;
                self.blocks[index].erase(start + execution);
                (cfg.bus_ctrl_delay, execution)
            }
            _ => return Status::Failure,
        };

        self.channels[address.package] = start + channel_busy;
        self.dies[die_index].busy_until = start + execution;
        event.bus_wait_time += bus_wait;
        event.execution_time = execution;
        trace!("issued {event}");
        Status::Success
    }

    fn program(&mut self, event: &Event, finish: Time) -> bool {
        let address = event.address;
        if address.valid != Depth::Page {
            return false;
        }
        let index = address.block_index(&self.config.geometry);
        if !self.blocks[index].program(address.page, finish) {
            return false;
        }
        self.invalidate(&event.replace_address);
        true
    }
}
