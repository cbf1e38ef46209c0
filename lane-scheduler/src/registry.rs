//! Callback registry keyed by combined topic.
//!
//! Besides the callbacks themselves the registry remembers the base topic of
//! every combined topic it has seen. A record only carries its physical topic,
//! and routing a failure to the error lane needs the base topic back.

use std::collections::HashMap;
use std::sync::Arc;

use crate::callback::Dispatch;
use crate::lane::{combine, CombinedTopic, Lane};

#[derive(Default)]
pub(crate) struct CallbackRegistry {
    callbacks: HashMap<CombinedTopic, Vec<Arc<dyn Dispatch>>>,
    base_topics: HashMap<CombinedTopic, String>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `base_topic` on `lane` and return the combined topic.
    pub fn register(
        &mut self,
        base_topic: &str,
        lane: Lane,
        callback: Arc<dyn Dispatch>,
    ) -> CombinedTopic {
        let combined = combine(base_topic, lane);
        self.base_topics
            .insert(combined.clone(), base_topic.to_string());
        self.callbacks
            .entry(combined.clone())
            .or_default()
            .push(callback);
        combined
    }

    pub fn callbacks(&self, combined_topic: &str) -> Option<&[Arc<dyn Dispatch>]> {
        self.callbacks.get(combined_topic).map(Vec::as_slice)
    }

    pub fn base_topic(&self, combined_topic: &str) -> Option<&str> {
        self.base_topics.get(combined_topic).map(String::as_str)
    }

    pub fn callback_count(&self, combined_topic: &str) -> usize {
        self.callbacks.get(combined_topic).map_or(0, Vec::len)
    }
}
