//! Discrete-event simulator of an SSD controller: an I/O scheduler that
//! orders host and internal flash operations, resolves logical address
//! conflicts between them, and drives garbage collection and wear leveling
//! against a timing model of the flash.

pub mod address;
pub mod block_manager;
pub mod config;
pub mod error;
pub mod event;
pub mod event_queue;
pub mod flash;
pub mod ftl;
pub mod gc;
pub mod migrator;
pub mod operation;
pub mod placement;
pub mod priority;
pub mod scheduler;
pub mod ssd;
pub mod wear_leveling;

pub use config::Config;
pub use error::{Result, SimError};
pub use ssd::{Ssd, Stats};
