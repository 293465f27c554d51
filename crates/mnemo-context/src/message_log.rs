//! Ordered conversation history.
//!
//! Entries are immutable once appended. The only structural removal is
//! [`MessageLog::replace_window`], which swaps a contiguous run of messages
//! for a single summary message in one step.

use std::collections::{HashMap, HashSet};

use mnemo_core::ids::{EntityId, MessageId};

use crate::errors::{ContextError, Result};
use crate::types::{AgentScope, Message};

/// Append-mostly message list with an ID → position index.
#[derive(Clone, Debug, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    positions: HashMap<MessageId, usize>,
}

impl MessageLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted messages. Callers validate ID uniqueness first.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        let mut log = Self {
            messages,
            positions: HashMap::new(),
        };
        log.reindex();
        log
    }

    fn reindex(&mut self) {
        self.positions = self
            .messages
            .iter()
            .enumerate()
            .map(|(i, m)| (m.id.clone(), i))
            .collect();
    }

    /// Append a message. Empty content is rejected.
    pub fn append(&mut self, message: Message) -> Result<MessageId> {
        if message.content.trim().is_empty() {
            return Err(ContextError::InvalidMessage("message content is empty".into()));
        }
        let id = message.id.clone();
        let _ = self.positions.insert(id.clone(), self.messages.len());
        self.messages.push(message);
        Ok(id)
    }

    /// All messages, oldest first.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Number of messages.
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the log is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Look up by ID.
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.positions.get(id).map(|&i| &self.messages[i])
    }

    /// The last `n` messages.
    pub fn get_window(&self, n: usize) -> &[Message] {
        let start = self.messages.len().saturating_sub(n);
        &self.messages[start..]
    }

    /// Messages from `from` to `to`, both inclusive.
    ///
    /// Empty if either ID is unknown or `from` comes after `to`.
    pub fn get_range(&self, from: &MessageId, to: &MessageId) -> &[Message] {
        match (self.positions.get(from), self.positions.get(to)) {
            (Some(&start), Some(&end)) if start <= end => &self.messages[start..=end],
            _ => &[],
        }
    }

    /// Messages visible from `scope`.
    pub fn iter_scope<'a>(&'a self, scope: &'a AgentScope) -> impl Iterator<Item = &'a Message> {
        self.messages.iter().filter(move |m| scope.sees(&m.agent_scope))
    }

    /// Messages older than the most recent `preserve_recent`.
    pub fn oldest_outside_recent(&self, preserve_recent: usize) -> &[Message] {
        let end = self.messages.len().saturating_sub(preserve_recent);
        &self.messages[..end]
    }

    /// Replace the contiguous run `ids` with `summary`, returning the removed messages.
    ///
    /// Fails without modifying anything if `ids` is empty or is no longer a
    /// contiguous run in this order.
    pub fn replace_window(&mut self, ids: &[MessageId], summary: Message) -> Result<Vec<Message>> {
        let Some(first) = ids.first() else {
            return Err(ContextError::ConcurrentMutationConflict(
                "empty compaction window".into(),
            ));
        };
        let start = *self.positions.get(first).ok_or_else(|| {
            ContextError::ConcurrentMutationConflict(format!(
                "window start {first} is no longer in the log"
            ))
        })?;
        let end = start + ids.len();
        let contiguous = end <= self.messages.len()
            && self.messages[start..end]
                .iter()
                .zip(ids)
                .all(|(m, id)| &m.id == id);
        if !contiguous {
            return Err(ContextError::ConcurrentMutationConflict(
                "compaction window is no longer contiguous".into(),
            ));
        }
        if summary.content.trim().is_empty() {
            return Err(ContextError::InvalidMessage("summary content is empty".into()));
        }

        let removed: Vec<Message> = self.messages.splice(start..end, [summary]).collect();
        self.reindex();
        Ok(removed)
    }

    /// IDs referenced by messages outside `excluded`.
    pub fn entity_refs_outside(
        &self,
        excluded: &HashSet<&MessageId>,
    ) -> HashSet<EntityId> {
        self.messages
            .iter()
            .filter(|m| !excluded.contains(&m.id))
            .flat_map(|m| m.entity_refs.iter().cloned())
            .collect()
    }
}
