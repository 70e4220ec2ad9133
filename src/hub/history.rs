//! Bounded message history with lazy, restartable queries

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::{Message, MessageKind};

/// Filter applied to history queries; unset fields match everything
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub sender: Option<String>,
    pub target: Option<String>,
    pub kind: Option<MessageKind>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl HistoryFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn from_sender(mut self, sender: &str) -> Self {
        self.sender = Some(sender.to_string());
        self
    }

    pub fn to_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    pub fn of_kind(mut self, kind: MessageKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn between(mut self, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self.until = Some(until);
        self
    }

    pub fn matches(&self, message: &Message) -> bool {
        if let Some(sender) = &self.sender {
            if &message.sender != sender {
                return false;
            }
        }
        if let Some(target) = &self.target {
            if message.target.as_ref() != Some(target) {
                return false;
            }
        }
        if let Some(kind) = self.kind {
            if message.kind != kind {
                return false;
            }
        }
        if let Some(since) = self.since {
            if message.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if message.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Ring buffer backing the hub history
#[derive(Debug)]
pub(crate) struct MessageLog {
    entries: VecDeque<Arc<Message>>,
    capacity: usize,
    evicted: u64,
}

impl MessageLog {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    pub(crate) fn push(&mut self, message: Message) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.evicted += 1;
        }
        self.entries.push_back(Arc::new(message));
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn evicted(&self) -> u64 {
        self.evicted
    }

    pub(crate) fn snapshot(&self) -> Arc<[Arc<Message>]> {
        self.entries.iter().cloned().collect()
    }
}

/// Point-in-time view of the history.
///
/// Filtering happens while iterating, and `iter()` can be called any number
/// of times to walk the same view again.
#[derive(Debug, Clone)]
pub struct MessageHistory {
    entries: Arc<[Arc<Message>]>,
    filter: HistoryFilter,
}

impl MessageHistory {
    pub(crate) fn new(entries: Arc<[Arc<Message>]>, filter: HistoryFilter) -> Self {
        Self { entries, filter }
    }

    pub fn iter(&self) -> HistoryIter<'_> {
        HistoryIter {
            inner: self.entries.iter(),
            filter: &self.filter,
        }
    }

    pub fn filter(&self) -> &HistoryFilter {
        &self.filter
    }
}

impl<'a> IntoIterator for &'a MessageHistory {
    type Item = &'a Message;
    type IntoIter = HistoryIter<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct HistoryIter<'a> {
    inner: std::slice::Iter<'a, Arc<Message>>,
    filter: &'a HistoryFilter,
}

impl<'a> Iterator for HistoryIter<'a> {
    type Item = &'a Message;

    fn next(&mut self) -> Option<Self::Item> {
        let filter = self.filter;
        self.inner
            .by_ref()
            .map(|m| m.as_ref())
            .find(|m| filter.matches(m))
    }
}
