//! Protocol handlers
//!
//! One module per wire protocol. Each handler owns a connection registry,
//! a fixed-capacity table of live connection state keyed by endpoint, and
//! implements [`ProtocolHandler`] so the dispatcher can route generic
//! requests to it.

pub mod database;
pub mod http;
pub mod mqtt;
pub mod tcp;
pub mod udp;
pub mod websocket;

use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::debug;

use crate::envelope::{Protocol, Request, Response};
use crate::types::{EngineError, Result};

/// A protocol-specific executor with its own connection registry.
///
/// `execute` never fails at the Rust level: protocol and transport errors
/// populate a failure [`Response`] so the dispatcher can classify the call
/// for metrics without inspecting anything beyond `success`.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// The protocol tag this handler owns
    fn protocol(&self) -> Protocol;

    /// Perform the network transaction described by a generic request
    async fn execute(&self, request: &Request) -> Response;
}

/// Fixed-capacity connection registry shared by reference with the engine.
///
/// Entries outlive any single request: a disconnect clears the entry's live
/// state but keeps the slot, so repeated connect/disconnect cycles on the
/// same key reuse it. Capacity is fixed at startup; inserting a new key past
/// capacity fails.
pub(crate) struct Registry<K, V> {
    name: &'static str,
    entries: DashMap<K, Arc<Mutex<V>>>,
    count: AtomicUsize,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> Registry<K, V> {
    pub(crate) fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: DashMap::with_capacity(capacity),
            count: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Look up an existing entry
    pub(crate) fn get(&self, key: &K) -> Option<Arc<Mutex<V>>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Look up or create an entry, enforcing the capacity cap on creation
    pub(crate) fn get_or_create(
        &self,
        key: K,
        init: impl FnOnce() -> V,
    ) -> Result<Arc<Mutex<V>>> {
        match self.entries.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(e) => Ok(Arc::clone(e.get())),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                if self.count.load(Ordering::Relaxed) >= self.capacity {
                    return Err(EngineError::RegistryFull(self.name));
                }
                self.count.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(Mutex::new(init()));
                e.insert(Arc::clone(&entry));
                debug!(registry = self.name, count = self.len(), "registry entry created");
                Ok(entry)
            }
        }
    }

    /// Remove an entry entirely, freeing its slot
    pub(crate) fn remove(&self, key: &K) {
        if self.entries.remove(key).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

/// Split a `scheme://host[:port]` URL into host and port.
///
/// The scheme prefix is required; a missing port falls back to
/// `default_port`. Anything after the first `/` past the authority is
/// ignored.
pub(crate) fn parse_endpoint_url(url: &str, default_port: u16) -> Option<(String, u16)> {
    let rest = url.split_once("://")?.1;
    let authority = rest.split('/').next().unwrap_or(rest);
    if authority.is_empty() {
        return None;
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().ok()?;
            Some((host.to_string(), port))
        }
        None => Some((authority.to_string(), default_port)),
    }
}

/// Resolve a host name to its first address, preferring IPv4
pub(crate) async fn resolve_host(host: &str, port: u16) -> Option<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await.ok()?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
}
