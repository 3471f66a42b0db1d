use std::time::Instant;

use crate::protocol::{address::DeviceAddress, command::Command};

/// A reply the master is waiting for.
///
/// `action` is the continuation run when the reply arrives or the deadline
/// passes; the registry itself never interprets it.
#[derive(Debug)]
pub struct PendingAnswer<A> {
    pub id: u64,
    pub request: Command,
    pub expected: Command,
    pub source: DeviceAddress,
    pub deadline: Instant,
    pub action: A,
}

/// Outstanding replies in registration order.
#[derive(Debug)]
pub struct PendingAnswers<A> {
    entries: Vec<PendingAnswer<A>>,
    next_id: u64,
}

impl<A> Default for PendingAnswers<A> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
        }
    }
}

impl<A> PendingAnswers<A> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn register(
        &mut self,
        request: Command,
        expected: Command,
        source: DeviceAddress,
        deadline: Instant,
        action: A,
    ) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(PendingAnswer {
            id,
            request,
            expected,
            source,
            deadline,
            action,
        });
        id
    }

    /// Remove and return the oldest entry waiting for `command` from `source`.
    pub fn take_match(&mut self, source: DeviceAddress, command: Command) -> Option<PendingAnswer<A>> {
        let index = self
            .entries
            .iter()
            .position(|p| p.source == source && p.expected == command)?;
        Some(self.entries.remove(index))
    }

    /// Remove every entry whose deadline is at or before `now`, oldest first.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingAnswer<A>> {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|p| p.deadline <= now);
        self.entries = live;
        expired
    }
}
