use std::collections::BTreeMap;

use parking_lot::Mutex;

/// A container's address on one docker network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub hostname: String,
    pub ip: String,
}

/// Per-host map of `network -> container_name -> (hostname, ip)`.
///
/// Populated as each runner on a network comes up; consulted when a new
/// runner joins an existing network so every sibling can resolve every other
/// by hostname (`--add-host` flags for the newcomer, `/etc/hosts` patches for
/// the incumbents) without relying on docker's internal DNS.
#[derive(Debug, Default)]
pub struct NetworkRegistry {
    networks: Mutex<BTreeMap<String, BTreeMap<String, HostEntry>>>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, network: &str, container_name: &str, hostname: &str, ip: &str) {
        self.networks
            .lock()
            .entry(network.to_owned())
            .or_default()
            .insert(container_name.to_owned(), HostEntry {
                hostname: hostname.to_owned(),
                ip: ip.to_owned(),
            });
    }

    /// Every `(container_name, entry)` on `network` except `exclude`
    pub fn peers(&self, network: &str, exclude: &str) -> Vec<(String, HostEntry)> {
        self.networks
            .lock()
            .get(network)
            .map(|containers| {
                containers
                    .iter()
                    .filter(|(name, _)| name.as_str() != exclude)
                    .map(|(name, entry)| (name.clone(), entry.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes a container from every network it was registered on
    pub fn remove_container(&self, container_name: &str) {
        let mut networks = self.networks.lock();
        for containers in networks.values_mut() {
            containers.remove(container_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peers_exclude_the_newcomer() {
        let registry = NetworkRegistry::new();
        registry.register("testnet", "a", "host-a", "172.18.0.2");
        registry.register("testnet", "b", "host-b", "172.18.0.3");
        registry.register("other", "c", "host-c", "172.19.0.2");

        let peers = registry.peers("testnet", "b");
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, "a");
        assert_eq!(peers[0].1.hostname, "host-a");
        assert!(registry.peers("missing", "x").is_empty());
    }

    #[test]
    fn removal_spans_networks() {
        let registry = NetworkRegistry::new();
        registry.register("n0", "a", "host-a", "172.18.0.2");
        registry.register("n1", "a", "host-a", "172.20.0.2");
        registry.remove_container("a");
        assert!(registry.peers("n0", "").is_empty());
        assert!(registry.peers("n1", "").is_empty());
    }
}
