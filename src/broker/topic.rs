//! Pattern bookkeeping for the shared consume queue.
//!
//! A `Binding` holds the consumer tags currently registered under one topic
//! pattern. `Bindings` is the pattern → binding table. Duplicate tags are a
//! no-op. Callers serialize access (the registry keeps it behind its lock).

use std::collections::{BTreeMap, HashSet};

pub type ConsumerTag = String;

#[derive(Debug, Default, Clone)]
pub struct Binding {
    pub pattern: String,
    pub consumer_tags: HashSet<ConsumerTag>,
}

impl Binding {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            consumer_tags: HashSet::new(),
        }
    }

    pub fn add(&mut self, tag: ConsumerTag) {
        self.consumer_tags.insert(tag);
    }

    pub fn remove(&mut self, tag: &str) -> bool {
        self.consumer_tags.remove(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.consumer_tags.is_empty()
    }
}

/// What happened to a pattern when a tag was released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Released {
    /// Other tags still hold the pattern.
    Retained(String),
    /// That was the last tag; the pattern entry is gone.
    Emptied(String),
}

#[derive(Debug, Default)]
pub struct Bindings {
    patterns: BTreeMap<String, Binding>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `tag` under `pattern`, creating the entry on first use.
    pub fn add(&mut self, pattern: &str, tag: ConsumerTag) {
        self.patterns
            .entry(pattern.to_string())
            .or_insert_with(|| Binding::new(pattern))
            .add(tag);
    }

    /// Removes `tag` from whichever pattern owns it. `None` if no pattern does.
    pub fn release(&mut self, tag: &str) -> Option<Released> {
        let pattern = self
            .patterns
            .values()
            .find(|b| b.consumer_tags.contains(tag))
            .map(|b| b.pattern.clone())?;

        let binding = self.patterns.get_mut(&pattern)?;
        binding.remove(tag);
        if binding.is_empty() {
            self.patterns.remove(&pattern);
            Some(Released::Emptied(pattern))
        } else {
            Some(Released::Retained(pattern))
        }
    }

    pub fn get(&self, pattern: &str) -> Option<&Binding> {
        self.patterns.get(pattern)
    }

    pub fn patterns(&self) -> Vec<String> {
        self.patterns.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
