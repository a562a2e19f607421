use thiserror::Error;

use crate::address::Address;
use crate::config::Lba;
use crate::event::{EventId, EventType};

/// Conditions that stop a simulation run.
///
/// Running out of free pages is not one of them: that is reported with an
/// invalid [`Address`] and resolved by holding the event or collecting garbage.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(
        "no resolution for {new_type:?} event {new_event} against {existing_type:?} event {existing_event} on logical address {logical_address}"
    )]
    UndefinedConflict {
        new_event: EventId,
        new_type: EventType,
        existing_event: EventId,
        existing_type: EventType,
        logical_address: Lba,
    },

    #[error("flash refused {event_type:?} event {event} at {address}")]
    HardwareFailure {
        event: EventId,
        event_type: EventType,
        address: Address,
    },

    #[error("logical address {address} out of range (logical size {logical_size})")]
    LogicalAddressOutOfRange { address: Lba, logical_size: Lba },

    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, SimError>;
