use std::collections::HashMap;

/// Symmetric map of active pairs: `pairs[a] == b` iff `pairs[b] == a`.
#[derive(Debug, Default)]
pub struct PairMap {
    peers: HashMap<String, String>,
}

impl PairMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `a <-> b`. Both sides must be unpaired.
    pub fn pair(&mut self, a: &str, b: &str) {
        debug_assert!(a != b, "device paired with itself");
        debug_assert!(!self.peers.contains_key(a) && !self.peers.contains_key(b));
        self.peers.insert(a.to_string(), b.to_string());
        self.peers.insert(b.to_string(), a.to_string());
    }

    pub fn peer_of(&self, device_id: &str) -> Option<&str> {
        self.peers.get(device_id).map(String::as_str)
    }

    pub fn contains(&self, device_id: &str) -> bool {
        self.peers.contains_key(device_id)
    }

    /// Dissolve the pair containing `device_id`, returning the former peer.
    pub fn dissolve(&mut self, device_id: &str) -> Option<String> {
        let peer = self.peers.remove(device_id)?;
        self.peers.remove(&peer);
        Some(peer)
    }

    /// Number of devices currently paired (twice the number of pairs).
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn is_symmetric(&self) -> bool {
        self.peers
            .iter()
            .all(|(a, b)| self.peers.get(b).is_some_and(|back| back == a))
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &str> {
        self.peers.keys().map(String::as_str)
    }
}
