//! # dedup
//!
//! why: make retried client requests idempotent
//! relations: consulted by node.rs both when a request arrives and when an entry is applied
//! what: DedupCache, one most-recent completed response per client

use crate::message::ClientResponse;
use std::collections::HashMap;

/// Most recent completed (non-redirect) response per client.
#[derive(Debug, Default, Clone)]
pub struct DedupCache {
    responses: HashMap<String, ClientResponse>,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached response if `serial` was already executed for `client_id`.
    ///
    /// A serial at or below the cached one counts as a duplicate.
    pub fn lookup(&self, client_id: &str, serial: u64) -> Option<&ClientResponse> {
        self.responses
            .get(client_id)
            .filter(|cached| cached.client_serial >= serial)
    }

    /// Remember `response` as the latest for `client_id`.
    ///
    /// Redirects are never cached, and an older serial never replaces a newer one.
    pub fn record(&mut self, client_id: &str, response: ClientResponse) {
        if response.is_redirect() {
            return;
        }
        match self.responses.get(client_id) {
            Some(cached) if cached.client_serial > response.client_serial => {}
            _ => {
                self.responses.insert(client_id.to_string(), response);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }
}
