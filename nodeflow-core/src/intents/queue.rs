//! Priority queue of pending intents

use crate::models::Intent;

/// Accumulates intents across transitions and hands them out in dispatch order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IntentQueue {
    pending: Vec<Intent>,
}

impl IntentQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, intent: Intent) {
        self.pending.push(intent);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Next intent that would be dispatched
    pub fn peek(&self) -> Option<&Intent> {
        self.pending
            .iter()
            .enumerate()
            .min_by_key(|(index, intent)| (intent.priority, *index))
            .map(|(_, intent)| intent)
    }

    /// Take every pending intent in dispatch order, leaving the queue empty
    pub fn drain(&mut self) -> Vec<Intent> {
        dispatch_order(std::mem::take(&mut self.pending))
    }
}

impl Extend<Intent> for IntentQueue {
    fn extend<I: IntoIterator<Item = Intent>>(&mut self, intents: I) {
        self.pending.extend(intents);
    }
}

impl FromIterator<Intent> for IntentQueue {
    fn from_iter<I: IntoIterator<Item = Intent>>(intents: I) -> Self {
        Self {
            pending: intents.into_iter().collect(),
        }
    }
}

/// Lower priority value first; equal priorities keep emission order
pub fn dispatch_order(mut intents: Vec<Intent>) -> Vec<Intent> {
    intents.sort_by_key(|intent| intent.priority);
    intents
}
