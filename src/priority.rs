use crate::config::SchedulingScheme;
use crate::event::{Event, EventType};

fn category(scheme: SchedulingScheme, event: &Event) -> u8 {
    match scheme {
        SchedulingScheme::Fifo => 0,
        SchedulingScheme::ReadEraseWrite => match event.event_type {
            EventType::ReadTransfer => 0,
            EventType::ReadCommand | EventType::Read => 1,
            EventType::Erase => 2,
            EventType::Write | EventType::CopyBack => 3,
            _ => 4,
        },
        SchedulingScheme::InternalFirst => u8::from(!event.is_internal()),
        SchedulingScheme::ApplicationFirst => u8::from(event.is_internal()),
    }
}

/// Orders a runnable batch for dispatch. Within a category, earlier events go
/// first and ties keep their incoming order.
pub fn arrange(scheme: SchedulingScheme, mut batch: Vec<Event>) -> Vec<Event> {
    batch.sort_by(|a, b| {
        category(scheme, a)
            .cmp(&category(scheme, b))
            .then_with(|| a.current_time().total_cmp(&b.current_time()))
    });
    batch
}
