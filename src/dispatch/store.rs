//! Local response store consulted by serve decisions.
//!
//! The store is read-only from the dispatcher's point of view. Nothing in the
//! dispatch path writes to it; populating it is up to the embedder.

use crate::models::{InterceptedResponse, ResponseSource};
use dashmap::DashMap;
use futures::future::BoxFuture;

/// Store keyed by request identity (see `InterceptedRequest::identity`)
pub trait ResponseStore: Send + Sync {
    fn lookup<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<InterceptedResponse>>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, InterceptedResponse>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, response: InterceptedResponse) {
        self.entries.insert(key.into(), response);
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ResponseStore for MemoryStore {
    fn lookup<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Option<InterceptedResponse>> {
        let found = self.entries.get(key).map(|entry| {
            let mut response = entry.value().clone();
            response.source = ResponseSource::Store;
            response
        });
        Box::pin(async move { found })
    }
}
