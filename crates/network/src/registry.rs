#[cfg(test)]
#[path = "tests/registry.rs"]
mod tests;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mixcomms_crypto::PublicKey;
use mixcomms_primitives::Id;
use parking_lot::RwLock;
use tracing::debug;

use crate::config::HostParams;
use crate::host::Host;
use crate::Error;

/// Every peer this process knows about, keyed by network id.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<Id, Arc<Host>>>,
    allow_insecure: AtomicBool,
}

impl HostRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lets hosts be registered without a certificate.
    pub fn allow_insecure(&self) {
        self.allow_insecure.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_insecure(&self) -> bool {
        self.allow_insecure.load(Ordering::Acquire)
    }

    /// Registers a host, or returns the existing one with its address
    /// updated.
    pub fn add_host(
        &self,
        id: Id,
        address: &str,
        certificate: Option<&[u8]>,
        params: HostParams,
    ) -> Result<Arc<Host>, Error> {
        if let Some(host) = self.get_host(&id) {
            host.update_address(address);
            return Ok(host);
        }

        let host = Arc::new(Host::new(
            id,
            address,
            certificate,
            params,
            self.is_insecure(),
        )?);

        let mut hosts = self.hosts.write();
        let host = Arc::clone(hosts.entry(id).or_insert(host));
        drop(hosts);

        debug!(%id, address, "registered host");

        Ok(host)
    }

    /// Registers an address-less host, keeping any existing entry.
    pub fn add_receive_only(
        &self,
        id: Id,
        public_key: Option<PublicKey>,
        params: HostParams,
    ) -> Arc<Host> {
        let mut hosts = self.hosts.write();

        Arc::clone(
            hosts
                .entry(id)
                .or_insert_with(|| Arc::new(Host::receive_only(id, public_key, params))),
        )
    }

    #[must_use]
    pub fn get_host(&self, id: &Id) -> Option<Arc<Host>> {
        self.hosts.read().get(id).cloned()
    }

    /// Unregisters a host and closes its connection.
    pub fn remove_host(&self, id: &Id) -> Option<Arc<Host>> {
        let host = self.hosts.write().remove(id)?;
        host.disconnect();

        debug!(%id, "removed host");

        Some(host)
    }

    #[must_use]
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.read().values().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    /// Closes every live connection. Hosts stay registered.
    pub fn disconnect_all(&self) {
        for host in self.hosts() {
            host.disconnect();
        }
    }
}
