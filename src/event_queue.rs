use std::collections::BTreeMap;

use crate::config::Time;
use crate::event::{Event, EventId};

/// Events bucketed by their floored due time.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<i64, Vec<Event>>,
    len: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue::default()
    }

    fn key(time: Time) -> i64 {
        time.floor() as i64
    }

    pub fn push(&mut self, event: Event) {
        self.events.entry(Self::key(event.current_time())).or_default().push(event);
        self.len += 1;
    }

    /// Floored time of the soonest bucket.
    pub fn next_time(&self) -> Option<Time> {
        self.events.keys().next().map(|key| *key as Time)
    }

    /// Takes the soonest bucket.
    pub fn pop_soonest(&mut self) -> Option<Vec<Event>> {
        let (_, batch) = self.events.pop_first()?;
        self.len -= batch.len();
        Some(batch)
    }

    /// Takes the soonest bucket if it is due before `limit`.
    pub fn pop_due(&mut self, limit: Time) -> Option<Vec<Event>> {
        match self.next_time() {
            Some(time) if time < limit => self.pop_soonest(),
            _ => None,
        }
    }

    pub fn find(&self, id: EventId) -> Option<&Event> {
        self.events.values().flatten().find(|event| event.id() == id)
    }

    pub fn find_mut(&mut self, id: EventId) -> Option<&mut Event> {
        self.events.values_mut().flatten().find(|event| event.id() == id)
    }

    pub fn remove(&mut self, id: EventId) -> Option<Event> {
        let (key, index) = self
            .events
            .iter()
            .find_map(|(key, batch)| batch.iter().position(|event| event.id() == id).map(|index| (*key, index)))?;
        let batch = self.events.get_mut(&key)?;
        let event = batch.remove(index);
        if batch.is_empty() {
            self.events.remove(&key);
        }
        self.len -= 1;
        Some(event)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;

    fn event_at(time: Time) -> Event {
        Event::new(EventType::Write, Some(0), time)
    }

    #[test]
    fn pops_soonest_bucket_first() {
        let mut queue = EventQueue::new();
        queue.push(event_at(20.5));
        queue.push(event_at(3.2));
        queue.push(event_at(3.9));
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.next_time(), Some(3.0));

        let batch = queue.pop_soonest().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_time(), Some(20.0));
    }

    #[test]
    fn pop_due_respects_limit() {
        let mut queue = EventQueue::new();
        queue.push(event_at(5.0));
        assert!(queue.pop_due(5.0).is_none());
        assert!(queue.pop_due(5.5).is_some());
        assert!(queue.is_empty());
    }

    #[test]
    fn finds_and_removes_by_id() {
        let mut queue = EventQueue::new();
        let first = event_at(1.0);
        let second = event_at(1.5);
        let (first_id, second_id) = (first.id(), second.id());
        queue.push(first);
        queue.push(second);

        queue.find_mut(second_id).unwrap().noop = true;
        assert!(queue.find(second_id).unwrap().noop);

        let removed = queue.remove(first_id).unwrap();
        assert_eq!(removed.id(), first_id);
        assert!(queue.find(first_id).is_none());
        assert_eq!(queue.len(), 1);

        queue.remove(second_id).unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.next_time(), None);
    }
}
