//! Client Connections
//!
//! A client owns a slice of the id space: its index sits in bits 21..28 and
//! the low 21 bits are free for it to choose. Ids the server allocates on a
//! client's behalf carry bit 30 so they never collide with client choices.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;
use xdix_proto::{Event, Reply, Request, ServerMessage, Xid};

use super::error::{DixError, DixResult};

pub const CLIENT_OFFSET: u32 = 21;
pub const RESOURCE_ID_MASK: u32 = (1 << CLIENT_OFFSET) - 1;
pub const CLIENT_MASK: u32 = 0xff << CLIENT_OFFSET;
pub const SERVER_BIT: u32 = 1 << 30;
/// Bits 29..31; no client-chosen id may set them
pub const RESERVED_ID_BITS: u32 = !(CLIENT_MASK | RESOURCE_ID_MASK);
pub const MAX_CLIENTS: usize = 255;

/// Index of the client owning `id`; index 0 is the server
pub fn client_index_of(id: Xid) -> usize {
    ((id & CLIENT_MASK) >> CLIENT_OFFSET) as usize
}

pub fn client_id_base(index: usize) -> Xid {
    (index as u32) << CLIENT_OFFSET
}

/// Connection identity, never reused for the life of the process
///
/// Anything that outlives a request (pending swaps, waiters) stores this
/// and re-resolves it through `ClientTable::get`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u64);

static NEXT_CLIENT: AtomicU64 = AtomicU64::new(1);

impl ClientId {
    pub fn next() -> Self {
        ClientId(NEXT_CLIENT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    pub index: usize,
    /// Connected over a trusted local transport
    pub local: bool,
    pub sequence: u16,
    /// A reply is deferred; new requests go to `backlog`
    pub suspended: bool,
    pub backlog: VecDeque<Request>,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    versions: HashMap<&'static str, (u32, u32)>,
    next_fake: u32,
}

impl Client {
    pub fn resource_base(&self) -> Xid {
        client_id_base(self.index)
    }

    /// Whether the client may create a resource named `id`
    pub fn legal_new_id(&self, id: Xid) -> bool {
        client_index_of(id) == self.index && id & RESERVED_ID_BITS == 0
    }

    /// Allocate a server-chosen id inside this client's range
    pub fn fake_id(&mut self) -> Xid {
        let id = self.resource_base() | SERVER_BIT | (self.next_fake & RESOURCE_ID_MASK);
        self.next_fake = self.next_fake.wrapping_add(1);
        id
    }

    pub fn set_version(&mut self, extension: &'static str, version: (u32, u32)) {
        self.versions.insert(extension, version);
    }

    pub fn version(&self, extension: &str) -> Option<(u32, u32)> {
        self.versions.get(extension).copied()
    }

    pub fn send(&self, msg: ServerMessage) {
        if self.outbound.send(msg).is_err() {
            debug!("Client {} outbound closed, dropping message", self.index);
        }
    }

    pub fn send_reply(&self, sequence: u16, reply: Reply) {
        self.send(ServerMessage::Reply { sequence, reply });
    }

    pub fn send_event(&self, code: u8, event: Event) {
        self.send(ServerMessage::Event { code, event });
    }
}

/// Live clients, by identity and by index
#[derive(Debug)]
pub struct ClientTable {
    clients: HashMap<ClientId, Client>,
    slots: Vec<Option<ClientId>>,
    next_server_id: u32,
}

impl ClientTable {
    pub fn new(max_clients: usize) -> Self {
        let max = max_clients.clamp(1, MAX_CLIENTS);
        Self {
            clients: HashMap::new(),
            // slot 0 belongs to the server
            slots: vec![None; max + 1],
            next_server_id: 1,
        }
    }

    pub fn connect(
        &mut self,
        id: ClientId,
        local: bool,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) -> DixResult<&mut Client> {
        let index = self
            .slots
            .iter()
            .skip(1)
            .position(Option::is_none)
            .map(|i| i + 1)
            .ok_or(DixError::BadAlloc("client table full"))?;
        self.slots[index] = Some(id);
        let client = Client {
            id,
            index,
            local,
            sequence: 0,
            suspended: false,
            backlog: VecDeque::new(),
            outbound,
            versions: HashMap::new(),
            next_fake: 1,
        };
        Ok(self.clients.entry(id).or_insert(client))
    }

    pub fn remove(&mut self, id: ClientId) -> Option<Client> {
        let client = self.clients.remove(&id)?;
        if let Some(slot) = self.slots.get_mut(client.index) {
            *slot = None;
        }
        Some(client)
    }

    pub fn get(&self, id: ClientId) -> Option<&Client> {
        self.clients.get(&id)
    }

    pub fn get_mut(&mut self, id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&id)
    }

    pub fn is_live(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Client currently holding `index`
    pub fn by_index(&self, index: usize) -> Option<ClientId> {
        self.slots.get(index).copied().flatten()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    /// Allocate an id owned by the server itself
    pub fn server_id(&mut self) -> Xid {
        let id = self.next_server_id & RESOURCE_ID_MASK;
        self.next_server_id = self.next_server_id.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_ranges() {
        let mut table = ClientTable::new(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = table.connect(ClientId::next(), true, tx).unwrap();
        assert_eq!(client.index, 1);
        assert_eq!(client.resource_base(), 0x0020_0000);
        assert!(client.legal_new_id(0x0020_0001));
        assert!(!client.legal_new_id(0x0040_0001));

        let fake = client.fake_id();
        assert!(!client.legal_new_id(fake));
        assert_eq!(client_index_of(fake), 1);

        // bits above the client field are reserved
        assert!(!client.legal_new_id(0x0020_0001 | 1 << 29));
        assert!(!client.legal_new_id(0x0020_0001 | 1 << 31));
    }

    #[test]
    fn test_slots_are_recycled_but_ids_are_not() {
        let mut table = ClientTable::new(1);
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = ClientId::next();
        table.connect(first, false, tx.clone()).unwrap();
        assert!(table.connect(ClientId::next(), false, tx.clone()).is_err());

        table.remove(first);
        let second = ClientId::next();
        let client = table.connect(second, false, tx).unwrap();
        assert_eq!(client.index, 1);
        assert_ne!(first, second);
        assert!(!table.is_live(first));
    }
}
