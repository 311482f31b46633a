use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub client_id: u32,
    pub addr: SocketAddr,
    pub connected_at: Instant,
    pub last_seen: Instant,
    pub accepted: bool,
    pub entity_id: Option<u32>,
    pub player_name: String,
    pub last_processed_sequence: u32,
    pub decode_errors: u32,
}

impl ConnectionRecord {
    fn new(client_id: u32, addr: SocketAddr, now: Instant) -> Self {
        Self {
            client_id,
            addr,
            connected_at: now,
            last_seen: now,
            accepted: false,
            entity_id: None,
            player_name: String::new(),
            last_processed_sequence: 0,
            decode_errors: 0,
        }
    }

    pub fn is_stale(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("server full ({0} clients)")]
    Full(usize),
    #[error("no connection from {0}")]
    Unknown(SocketAddr),
    #[error("client {0} has not been accepted")]
    NotAccepted(u32),
    #[error("{addr} claimed client {claimed} but is client {actual}")]
    ClientMismatch {
        addr: SocketAddr,
        claimed: u32,
        actual: u32,
    },
}

#[derive(Default)]
struct Inner {
    clients_by_addr: HashMap<SocketAddr, u32>,
    clients: HashMap<u32, ConnectionRecord>,
    next_client_id: u32,
}

impl Inner {
    fn by_addr_mut(&mut self, addr: &SocketAddr) -> Option<&mut ConnectionRecord> {
        let client_id = *self.clients_by_addr.get(addr)?;
        self.clients.get_mut(&client_id)
    }

    fn remove(&mut self, client_id: u32) -> Option<ConnectionRecord> {
        let record = self.clients.remove(&client_id)?;
        self.clients_by_addr.remove(&record.addr);
        Some(record)
    }

    fn accepted_count(&self) -> usize {
        self.clients.values().filter(|c| c.accepted).count()
    }
}

/// Every peer the server has heard from, keyed by address and by client id.
/// Client ids start at 1 and are never handed out twice. Records are only
/// ever returned as clones.
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
    max_clients: usize,
}

impl ConnectionRegistry {
    pub fn new(max_clients: usize) -> Self {
        Self {
            inner: RwLock::new(Inner {
                next_client_id: 1,
                ..Default::default()
            }),
            max_clients,
        }
    }

    pub fn max_clients(&self) -> usize {
        self.max_clients
    }

    /// Returns the record for `addr`, creating one if needed, and marks it
    /// as seen now.
    pub fn resolve(&self, addr: SocketAddr) -> ConnectionRecord {
        self.resolve_at(addr, Instant::now())
    }

    pub fn resolve_at(&self, addr: SocketAddr, now: Instant) -> ConnectionRecord {
        let mut inner = self.inner.write();
        if let Some(record) = inner.by_addr_mut(&addr) {
            record.last_seen = now;
            return record.clone();
        }

        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        let record = ConnectionRecord::new(client_id, addr, now);
        inner.clients_by_addr.insert(addr, client_id);
        inner.clients.insert(client_id, record.clone());
        log::debug!("Tracking {} as client {}", addr, client_id);
        record
    }

    pub fn lookup_addr(&self, addr: &SocketAddr) -> Option<ConnectionRecord> {
        let inner = self.inner.read();
        let client_id = inner.clients_by_addr.get(addr)?;
        inner.clients.get(client_id).cloned()
    }

    pub fn lookup_id(&self, client_id: u32) -> Option<ConnectionRecord> {
        self.inner.read().clients.get(&client_id).cloned()
    }

    /// Completes the handshake for `addr`. `bind_entity` runs under the
    /// registry lock with the client id and returns the entity to bind, so an
    /// accepted record is never observed without one. Accepting an already
    /// accepted record returns it unchanged.
    pub fn accept<F>(
        &self,
        addr: SocketAddr,
        player_name: &str,
        bind_entity: F,
    ) -> Result<ConnectionRecord, RegistryError>
    where
        F: FnOnce(u32) -> u32,
    {
        let mut inner = self.inner.write();
        let accepted = inner.accepted_count();
        let record = inner
            .by_addr_mut(&addr)
            .ok_or(RegistryError::Unknown(addr))?;

        if record.accepted {
            return Ok(record.clone());
        }
        if accepted >= self.max_clients {
            return Err(RegistryError::Full(self.max_clients));
        }

        let entity_id = match record.entity_id {
            Some(entity_id) => entity_id,
            None => bind_entity(record.client_id),
        };
        record.entity_id = Some(entity_id);
        record.accepted = true;
        record.player_name = player_name.to_string();
        record.decode_errors = 0;
        Ok(record.clone())
    }

    /// Checks that an input from `addr` may act for `client_id`.
    pub fn authorize_input(
        &self,
        addr: &SocketAddr,
        client_id: u32,
    ) -> Result<ConnectionRecord, RegistryError> {
        let record = self
            .lookup_addr(addr)
            .ok_or(RegistryError::Unknown(*addr))?;
        if record.client_id != client_id {
            return Err(RegistryError::ClientMismatch {
                addr: *addr,
                claimed: client_id,
                actual: record.client_id,
            });
        }
        if !record.accepted {
            return Err(RegistryError::NotAccepted(record.client_id));
        }
        Ok(record)
    }

    /// Raises the client's last processed sequence. Returns `false` when
    /// `sequence` is not newer, leaving the record untouched.
    pub fn mark_processed(&self, client_id: u32, sequence: u32) -> bool {
        let mut inner = self.inner.write();
        match inner.clients.get_mut(&client_id) {
            Some(record) if sequence > record.last_processed_sequence => {
                record.last_processed_sequence = sequence;
                true
            }
            _ => false,
        }
    }

    pub fn record_decode_error(&self, addr: &SocketAddr) -> u32 {
        let mut inner = self.inner.write();
        match inner.by_addr_mut(addr) {
            Some(record) => {
                record.decode_errors += 1;
                record.decode_errors
            }
            None => 0,
        }
    }

    pub fn clear_decode_errors(&self, addr: &SocketAddr) {
        if let Some(record) = self.inner.write().by_addr_mut(addr) {
            record.decode_errors = 0;
        }
    }

    /// Withdraws acceptance and unbinds the entity. The record stays tracked
    /// until it goes stale or is removed.
    pub fn revoke(&self, addr: &SocketAddr) -> Option<ConnectionRecord> {
        let mut inner = self.inner.write();
        let record = inner.by_addr_mut(addr)?;
        let before = record.clone();
        record.accepted = false;
        record.entity_id = None;
        Some(before)
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<ConnectionRecord> {
        let mut inner = self.inner.write();
        let client_id = *inner.clients_by_addr.get(addr)?;
        inner.remove(client_id)
    }

    pub fn remove_id(&self, client_id: u32) -> Option<ConnectionRecord> {
        self.inner.write().remove(client_id)
    }

    pub fn evict_stale(&self, timeout: Duration) -> Vec<ConnectionRecord> {
        self.evict_stale_at(Instant::now(), timeout)
    }

    /// Removes every record not seen within `timeout` of `now`.
    pub fn evict_stale_at(&self, now: Instant, timeout: Duration) -> Vec<ConnectionRecord> {
        let mut inner = self.inner.write();
        let stale: Vec<u32> = inner
            .clients
            .values()
            .filter(|c| c.is_stale(now, timeout))
            .map(|c| c.client_id)
            .collect();

        stale
            .into_iter()
            .filter_map(|client_id| inner.remove(client_id))
            .collect()
    }

    pub fn accepted(&self) -> Vec<ConnectionRecord> {
        self.inner
            .read()
            .clients
            .values()
            .filter(|c| c.accepted)
            .cloned()
            .collect()
    }

    /// Entity id to last processed input sequence, for accepted connections.
    pub fn owner_sequences(&self) -> HashMap<u32, u32> {
        self.inner
            .read()
            .clients
            .values()
            .filter(|c| c.accepted)
            .filter_map(|c| c.entity_id.map(|e| (e, c.last_processed_sequence)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn accepted_count(&self) -> usize {
        self.inner.read().accepted_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_resolve_is_stable_per_address() {
        let registry = ConnectionRegistry::new(8);
        let first = registry.resolve(addr(5000));
        let again = registry.resolve(addr(5000));

        assert_eq!(first.client_id, again.client_id);
        assert!(again.last_seen >= first.last_seen);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_accept_binds_one_entity() {
        let registry = ConnectionRegistry::new(8);
        registry.resolve(addr(5000));

        let mut binds = 0;
        let record = registry
            .accept(addr(5000), "ace", |client_id| {
                binds += 1;
                client_id + 100
            })
            .unwrap();
        assert!(record.accepted);
        assert_eq!(record.entity_id, Some(101));
        assert_eq!(record.player_name, "ace");

        let again = registry.accept(addr(5000), "ace", |_| 999).unwrap();
        assert_eq!(again.entity_id, Some(101));
        assert_eq!(binds, 1);
    }

    #[test]
    fn test_accept_requires_resolve() {
        let registry = ConnectionRegistry::new(8);
        assert_eq!(
            registry.accept(addr(5000), "ace", |_| 1),
            Err(RegistryError::Unknown(addr(5000)))
        );
    }

    #[test]
    fn test_accept_enforces_capacity() {
        let registry = ConnectionRegistry::new(1);
        registry.resolve(addr(5000));
        registry.resolve(addr(5001));

        registry.accept(addr(5000), "one", |_| 1).unwrap();
        assert_eq!(
            registry.accept(addr(5001), "two", |_| 2),
            Err(RegistryError::Full(1))
        );
        assert_eq!(registry.accepted_count(), 1);
    }

    #[test]
    fn test_authorize_input() {
        let registry = ConnectionRegistry::new(8);
        let record = registry.resolve(addr(5000));
        let other = registry.resolve(addr(5001));

        assert_eq!(
            registry.authorize_input(&addr(5000), record.client_id),
            Err(RegistryError::NotAccepted(record.client_id))
        );

        registry.accept(addr(5000), "ace", |_| 1).unwrap();
        assert!(registry.authorize_input(&addr(5000), record.client_id).is_ok());
        assert!(matches!(
            registry.authorize_input(&addr(5000), other.client_id),
            Err(RegistryError::ClientMismatch { .. })
        ));
        assert_eq!(
            registry.authorize_input(&addr(6000), record.client_id),
            Err(RegistryError::Unknown(addr(6000)))
        );
    }

    #[test]
    fn test_last_processed_never_decreases() {
        let registry = ConnectionRegistry::new(8);
        let record = registry.resolve(addr(5000));

        assert!(registry.mark_processed(record.client_id, 5));
        assert!(!registry.mark_processed(record.client_id, 3));
        assert!(!registry.mark_processed(record.client_id, 5));
        assert!(registry.mark_processed(record.client_id, 6));
        assert_eq!(
            registry.lookup_id(record.client_id).unwrap().last_processed_sequence,
            6
        );
        assert!(!registry.mark_processed(999, 1));
    }

    #[test]
    fn test_decode_errors_and_revoke() {
        let registry = ConnectionRegistry::new(8);
        registry.resolve(addr(5000));
        registry.accept(addr(5000), "ace", |_| 7).unwrap();

        assert_eq!(registry.record_decode_error(&addr(5000)), 1);
        assert_eq!(registry.record_decode_error(&addr(5000)), 2);
        registry.clear_decode_errors(&addr(5000));
        assert_eq!(registry.record_decode_error(&addr(5000)), 1);
        assert_eq!(registry.record_decode_error(&addr(6000)), 0);

        let before = registry.revoke(&addr(5000)).unwrap();
        assert_eq!(before.entity_id, Some(7));
        let after = registry.lookup_addr(&addr(5000)).unwrap();
        assert!(!after.accepted);
        assert_eq!(after.entity_id, None);
        assert!(registry.owner_sequences().is_empty());
    }

    #[test]
    fn test_owner_sequences() {
        let registry = ConnectionRegistry::new(8);
        let a = registry.resolve(addr(5000));
        registry.resolve(addr(5001));
        registry.accept(addr(5000), "a", |_| 10).unwrap();
        registry.mark_processed(a.client_id, 42);

        assert_eq!(registry.owner_sequences(), HashMap::from([(10, 42)]));
    }
}
