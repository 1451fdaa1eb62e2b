//! Catalog snapshot: the tools, resources and prompts a session advertises.
//!
//! Each list is an `Arc<Vec<_>>` that is replaced wholesale on refresh, so
//! readers holding a snapshot never observe a partially updated list.

use std::collections::HashSet;
use std::sync::Arc;

use crate::protocol::model::{Prompt, Resource, Tool};

/// Last known catalog of one session.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    /// Advertised tools.
    pub tools: Arc<Vec<Tool>>,
    /// Advertised resources.
    pub resources: Arc<Vec<Resource>>,
    /// Advertised prompts.
    pub prompts: Arc<Vec<Prompt>>,
}

impl Catalog {
    /// Look a tool up by name.
    #[must_use]
    pub fn tool(&self, name: &str) -> Option<&Tool> {
        self.tools.iter().find(|t| t.name == name)
    }

    /// Look a resource up by URI.
    #[must_use]
    pub fn resource(&self, uri: &str) -> Option<&Resource> {
        self.resources.iter().find(|r| r.uri == uri)
    }

    /// Look a prompt up by name.
    #[must_use]
    pub fn prompt(&self, name: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.name == name)
    }
}

/// Keep the first entry for every key; later duplicates are dropped.
pub(crate) fn dedupe_by_key<T>(items: Vec<T>, key: impl Fn(&T) -> &str) -> Vec<T> {
    let mut seen = HashSet::with_capacity(items.len());
    items
        .into_iter()
        .filter(|item| seen.insert(key(item).to_owned()))
        .collect()
}
