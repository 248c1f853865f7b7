//! Resource Registry
//!
//! Maps ids to `(type, value)`. The value is an arena handle whose meaning
//! depends on the type; the type's destructor knows which arena to use.
//! Ids are unique across all types at any instant.

use bitflags::bitflags;
use std::collections::HashMap;
use tracing::{debug, warn};
use xdix_proto::Xid;

use super::arena::Handle;
use super::client::{client_index_of, Client};
use super::error::{DixError, DixResult, ErrorCode};
use crate::server::Server;

/// Called once when an entry leaves the registry
pub type Destructor = fn(&mut Server, Handle, Xid) -> DixResult<()>;

pub const MAX_RESOURCE_TYPES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceType(u16);

bitflags! {
    /// Access modes checked by the security hook
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Access: u32 {
        const READ      = 1 << 0;
        const WRITE     = 1 << 1;
        const DESTROY   = 1 << 2;
        const CREATE    = 1 << 3;
        const GET_ATTR  = 1 << 4;
        const SET_ATTR  = 1 << 5;
        const ADD       = 1 << 11;
        const REMOVE    = 1 << 12;
        const USE       = 1 << 24;
        const MANAGE    = 1 << 25;
        const BLEND     = 1 << 27;
    }
}

/// External access-control policy consulted on every lookup
pub trait AccessHook: Send {
    fn check(&self, client: &Client, id: Xid, type_name: &'static str, access: Access) -> bool;
}

/// Policy used when no security module is configured
pub struct AllowAll;

impl AccessHook for AllowAll {
    fn check(&self, _: &Client, _: Xid, _: &'static str, _: Access) -> bool {
        true
    }
}

struct TypeInfo {
    name: &'static str,
    destructor: Destructor,
    error: ErrorCode,
}

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub rtype: ResourceType,
    pub value: Handle,
    /// Index of the owning client, 0 for the server
    pub owner: usize,
    serial: u64,
}

pub struct Registry {
    types: Vec<TypeInfo>,
    max_types: usize,
    entries: HashMap<Xid, Entry>,
    next_serial: u64,
}

impl Registry {
    pub fn new(max_types: usize) -> Self {
        Self {
            types: Vec::new(),
            max_types,
            entries: HashMap::new(),
            next_serial: 0,
        }
    }

    /// Register a resource class during extension setup
    pub fn register_type(
        &mut self,
        name: &'static str,
        destructor: Destructor,
        error: ErrorCode,
    ) -> DixResult<ResourceType> {
        if self.types.len() >= self.max_types {
            warn!("No resource type slot left for {}", name);
            return Err(DixError::TypesExhausted);
        }
        self.types.push(TypeInfo {
            name,
            destructor,
            error,
        });
        Ok(ResourceType((self.types.len() - 1) as u16))
    }

    pub fn type_name(&self, rtype: ResourceType) -> &'static str {
        self.types
            .get(rtype.0 as usize)
            .map(|t| t.name)
            .unwrap_or("unknown")
    }

    fn type_error(&self, rtype: ResourceType) -> ErrorCode {
        self.types
            .get(rtype.0 as usize)
            .map(|t| t.error)
            .unwrap_or(ErrorCode::Core(super::error::BAD_VALUE))
    }

    /// Insert an entry; id legality is the caller's concern
    pub fn add(&mut self, id: Xid, rtype: ResourceType, value: Handle) -> DixResult<()> {
        if id == 0 {
            return Err(DixError::BadIdChoice(id));
        }
        if self.entries.contains_key(&id) {
            return Err(DixError::IdInUse(id));
        }
        self.next_serial += 1;
        self.entries.insert(
            id,
            Entry {
                rtype,
                value,
                owner: client_index_of(id),
                serial: self.next_serial,
            },
        );
        debug!("Added {} 0x{:08x}", self.type_name(rtype), id);
        Ok(())
    }

    /// Look an id up, failing distinctly for absent and mistyped ids
    pub fn lookup(&self, id: Xid, rtype: ResourceType) -> DixResult<Handle> {
        let Some(entry) = self.entries.get(&id) else {
            return Err(DixError::BadResource {
                id,
                what: self.type_name(rtype),
                code: self.type_error(rtype),
            });
        };
        if entry.rtype != rtype {
            return Err(DixError::BadType {
                id,
                expected: self.type_name(rtype),
                found: self.type_name(entry.rtype),
                code: self.type_error(rtype),
            });
        }
        Ok(entry.value)
    }

    /// Look up an id that may be any of `types`
    pub fn lookup_class(
        &self,
        id: Xid,
        types: &[ResourceType],
        absent: DixError,
    ) -> DixResult<(ResourceType, Handle)> {
        match self.entries.get(&id) {
            Some(entry) if types.contains(&entry.rtype) => Ok((entry.rtype, entry.value)),
            _ => Err(absent),
        }
    }

    pub fn get(&self, id: Xid) -> Option<Entry> {
        self.entries.get(&id).copied()
    }

    pub fn contains(&self, id: Xid) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn remove(&mut self, id: Xid) -> Option<Entry> {
        self.entries.remove(&id)
    }

    fn destructor(&self, rtype: ResourceType) -> Option<Destructor> {
        self.types.get(rtype.0 as usize).map(|t| t.destructor)
    }

    /// Ids owned by a client, most recently created first
    fn owned_by(&self, index: usize) -> Vec<Xid> {
        let mut owned: Vec<(u64, Xid)> = self
            .entries
            .iter()
            .filter(|(_, e)| e.owner == index)
            .map(|(id, e)| (e.serial, *id))
            .collect();
        owned.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        owned.into_iter().map(|(_, id)| id).collect()
    }
}

/// Remove `id` and run its destructor
///
/// The entry is unlinked before the destructor runs, so destructors may
/// free or add other ids and a second free of the same id misses.
pub fn free_resource(server: &mut Server, id: Xid) -> DixResult<()> {
    let Some(entry) = server.resources.remove(id) else {
        return Err(DixError::BadResource {
            id,
            what: "resource",
            code: ErrorCode::Core(super::error::BAD_VALUE),
        });
    };
    debug!(
        "Freeing {} 0x{:08x}",
        server.resources.type_name(entry.rtype),
        id
    );
    match server.resources.destructor(entry.rtype) {
        Some(destroy) => destroy(server, entry.value, id),
        None => Ok(()),
    }
}

/// Free `id` only if it is registered under `rtype`
pub fn free_resource_by_type(server: &mut Server, id: Xid, rtype: ResourceType) -> DixResult<()> {
    server.resources.lookup(id, rtype)?;
    free_resource(server, id)
}

/// Free everything a client owns, newest first
pub fn free_client_resources(server: &mut Server, index: usize) {
    for id in server.resources.owned_by(index) {
        // an earlier destructor may already have cascaded into this one
        if !server.resources.contains(id) {
            continue;
        }
        if let Err(e) = free_resource(server, id) {
            warn!("Destructor for 0x{:08x} failed: {}", id, e);
        }
    }
}

/// Free every entry, client resources first, then the server's own
pub fn free_all_resources(server: &mut Server) {
    let mut owners: Vec<usize> = server.resources.entries.values().map(|e| e.owner).collect();
    owners.sort_unstable();
    owners.dedup();
    for index in owners.into_iter().rev() {
        free_client_resources(server, index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing;

    fn noop(_: &mut Server, _: Handle, _: Xid) -> DixResult<()> {
        Ok(())
    }

    fn cascade(server: &mut Server, _: Handle, id: Xid) -> DixResult<()> {
        // frees the next id up, which is also a cascade entry
        let _ = free_resource(server, id + 1);
        Ok(())
    }

    #[test]
    fn test_lookup_never_crosses_types() {
        let (mut server, _) = testing::server();
        let a = server
            .resources
            .register_type("A", noop, ErrorCode::Core(2))
            .unwrap();
        let b = server
            .resources
            .register_type("B", noop, ErrorCode::Core(3))
            .unwrap();
        let mut arena = crate::dix::arena::Arena::new();
        let value = arena.insert(());

        server.resources.add(0x0020_0001, a, value).unwrap();
        assert_eq!(server.resources.lookup(0x0020_0001, a), Ok(value));
        let err = server.resources.lookup(0x0020_0001, b).unwrap_err();
        assert_eq!(err.kind(), crate::dix::error::ErrorKind::TypeMismatch);
        let err = server.resources.lookup(0x0020_0002, a).unwrap_err();
        assert_eq!(err.kind(), crate::dix::error::ErrorKind::InvalidId);

        // uniqueness spans types
        assert_eq!(
            server.resources.add(0x0020_0001, b, value),
            Err(DixError::IdInUse(0x0020_0001))
        );
        assert_eq!(server.resources.add(0, a, value), Err(DixError::BadIdChoice(0)));
    }

    #[test]
    fn test_type_slots_run_out() {
        let mut registry = Registry::new(1);
        registry.register_type("A", noop, ErrorCode::Core(2)).unwrap();
        assert_eq!(
            registry.register_type("B", noop, ErrorCode::Core(2)),
            Err(DixError::TypesExhausted)
        );
    }

    #[test]
    fn test_reentrant_free_runs_each_destructor_once() {
        let (mut server, _) = testing::server();
        let t = server
            .resources
            .register_type("Cascade", cascade, ErrorCode::Core(2))
            .unwrap();
        let mut arena = crate::dix::arena::Arena::new();
        for id in 0x0020_0001..=0x0020_0004 {
            server.resources.add(id, t, arena.insert(())).unwrap();
        }

        free_resource(&mut server, 0x0020_0001).unwrap();
        for id in 0x0020_0001..=0x0020_0004 {
            assert!(!server.resources.contains(id));
        }
        assert!(free_resource(&mut server, 0x0020_0001).is_err());
    }

    #[test]
    fn test_client_resources_freed_newest_first() {
        use std::sync::Mutex;
        static ORDER: Mutex<Vec<Xid>> = Mutex::new(Vec::new());

        fn record(_: &mut Server, _: Handle, id: Xid) -> DixResult<()> {
            ORDER.lock().unwrap().push(id);
            Ok(())
        }

        let (mut server, _) = testing::server();
        let t = server
            .resources
            .register_type("Recorded", record, ErrorCode::Core(2))
            .unwrap();
        let mut arena = crate::dix::arena::Arena::new();
        for id in [0x0020_0003, 0x0020_0001, 0x0020_0002] {
            server.resources.add(id, t, arena.insert(())).unwrap();
        }
        server.resources.add(0x0040_0001, t, arena.insert(())).unwrap();

        free_client_resources(&mut server, 1);
        assert_eq!(
            *ORDER.lock().unwrap(),
            vec![0x0020_0002, 0x0020_0001, 0x0020_0003]
        );
        assert!(server.resources.contains(0x0040_0001));
    }
}
