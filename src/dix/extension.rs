//! Extension Table
//!
//! Extensions register a dispatch function at startup and receive a major
//! opcode plus event and error bases. Requests for an extension that never
//! registered are rejected uniformly.

use tracing::info;
use xdix_proto::{Reply, Request};

use super::client::ClientId;
use super::error::{DixError, DixResult, ErrorCode, BAD_IMPLEMENTATION};
use crate::server::Server;

pub const FIRST_MAJOR: u8 = 128;
pub const FIRST_EVENT: u8 = 64;
pub const FIRST_ERROR: u8 = 128;

/// Outcome of a successfully handled request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Reply(Reply),
    /// Request has no reply
    None,
    /// Reply is sent later; the client is suspended until then
    Deferred,
}

pub type DispatchFn = fn(&mut Server, ClientId, Request) -> DixResult<Response>;

#[derive(Debug, Clone)]
pub struct Extension {
    pub name: &'static str,
    pub major_opcode: u8,
    pub first_event: u8,
    pub first_error: u8,
    pub version: (u32, u32),
    dispatch: DispatchFn,
}

#[derive(Debug)]
pub struct ExtensionTable {
    list: Vec<Extension>,
    next_event: u16,
    next_error: u16,
}

impl Default for ExtensionTable {
    fn default() -> Self {
        Self {
            list: Vec::new(),
            next_event: u16::from(FIRST_EVENT),
            next_error: u16::from(FIRST_ERROR),
        }
    }
}

impl ExtensionTable {
    pub fn add_extension(
        &mut self,
        name: &'static str,
        num_events: u8,
        num_errors: u8,
        version: (u32, u32),
        dispatch: DispatchFn,
    ) -> DixResult<&Extension> {
        let major = u16::from(FIRST_MAJOR) + self.list.len() as u16;
        let events_end = self.next_event + u16::from(num_events);
        let errors_end = self.next_error + u16::from(num_errors);
        if major > 255 || events_end > 256 || errors_end > 256 {
            return Err(DixError::BadAlloc("extension table full"));
        }
        let ext = Extension {
            name,
            major_opcode: major as u8,
            first_event: if num_events > 0 { self.next_event as u8 } else { 0 },
            first_error: if num_errors > 0 { self.next_error as u8 } else { 0 },
            version,
            dispatch,
        };
        self.next_event = events_end;
        self.next_error = errors_end;
        info!(
            "Extension {} registered (major {}, events {}, errors {})",
            name, ext.major_opcode, ext.first_event, ext.first_error
        );
        self.list.push(ext);
        Ok(&self.list[self.list.len() - 1])
    }

    pub fn get(&self, name: &str) -> Option<&Extension> {
        self.list.iter().find(|e| e.name == name)
    }

    pub fn dispatch_for(&self, name: &str) -> Option<DispatchFn> {
        self.get(name).map(|e| e.dispatch)
    }

    pub fn query(&self, name: &str) -> Reply {
        let (present, major_opcode, first_event, first_error) = match self.get(name) {
            Some(ext) => (true, ext.major_opcode, ext.first_event, ext.first_error),
            None => (false, 0, 0, 0),
        };
        Reply::QueryExtension {
            present,
            major_opcode,
            first_event,
            first_error,
        }
    }

    /// Absolute event code for an extension-relative event number
    pub fn event_code(&self, name: &str, offset: u8) -> u8 {
        self.get(name)
            .map(|e| e.first_event.wrapping_add(offset))
            .unwrap_or(0)
    }

    pub fn error_code(&self, code: ErrorCode) -> u8 {
        match code {
            ErrorCode::Core(c) => c,
            ErrorCode::Extension { name, offset } => self
                .get(name)
                .map(|e| e.first_error.wrapping_add(offset))
                .unwrap_or(BAD_IMPLEMENTATION),
        }
    }
}

/// Both sides settle on the lower of the two versions
pub fn negotiate_version(server: (u32, u32), client: (u32, u32)) -> (u32, u32) {
    server.min(client)
}

/// Negotiate and remember the version for this client
pub fn query_version(
    server: &mut Server,
    client: ClientId,
    name: &'static str,
    requested: (u32, u32),
) -> DixResult<Response> {
    let supported = server
        .extensions
        .get(name)
        .map(|e| e.version)
        .ok_or(DixError::BadRequest)?;
    let (major, minor) = negotiate_version(supported, requested);
    if let Some(c) = server.clients.get_mut(client) {
        c.set_version(name, (major, minor));
    }
    Ok(Response::Reply(Reply::Version { major, minor }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unused(_: &mut Server, _: ClientId, _: Request) -> DixResult<Response> {
        Err(DixError::BadRequest)
    }

    #[test]
    fn test_bases_are_assigned_in_order() {
        let mut table = ExtensionTable::default();
        table.add_extension("A", 2, 1, (1, 0), unused).unwrap();
        let b = table.add_extension("B", 0, 3, (1, 0), unused).unwrap().clone();
        assert_eq!(b.major_opcode, 129);
        assert_eq!(b.first_event, 0);
        assert_eq!(b.first_error, 129);

        let c = table.add_extension("C", 1, 0, (1, 0), unused).unwrap();
        assert_eq!(c.first_event, 66);

        assert_eq!(table.error_code(ErrorCode::Extension { name: "B", offset: 2 }), 131);
        assert_eq!(
            table.error_code(ErrorCode::Extension { name: "missing", offset: 0 }),
            BAD_IMPLEMENTATION
        );
    }

    #[test]
    fn test_negotiate_version() {
        assert_eq!(negotiate_version((1, 4), (1, 2)), (1, 2));
        assert_eq!(negotiate_version((0, 4), (1, 0)), (0, 4));
        assert_eq!(negotiate_version((1, 1), (2, 0)), (1, 1));
    }

    #[test]
    fn test_query_unknown_extension() {
        let table = ExtensionTable::default();
        assert_eq!(
            table.query("DRI2"),
            Reply::QueryExtension {
                present: false,
                major_opcode: 0,
                first_event: 0,
                first_error: 0
            }
        );
    }
}
