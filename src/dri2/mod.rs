//! DRI2 Extension
//!
//! Buffer allocation and swap scheduling for direct-rendering clients.
//! Only `QueryVersion` is open to remote clients.
//!
//! Swap flow: `SwapBuffers` either throttles (returns the current sbc and
//! does nothing) or schedules with the backend and records a pending swap
//! holding the issuer's `ClientId`. The backend later queues a completion;
//! the request loop feeds it to `swap_complete`, which delivers the event
//! only if that client is still connected.

mod backend;
mod scheduler;

pub use backend::{Dri2Backend, SwapRequest, VirtualCrtc};
pub use scheduler::{next_msc, DrawableSwapState};

use std::collections::HashMap;
use tracing::{debug, info};
use xdix_proto::{
    join_u64, split_u64, AttachmentFormat, BufferInfo, Dri2Request, Event, Reply, Request, Xid,
    DRI2_NAME,
};

use crate::completion::SwapKind;
use crate::config::Dri2Config;
use crate::dix::error::{BAD_DRAWABLE, BAD_REQUEST};
use crate::dix::extension::query_version;
use crate::dix::resource::free_resource;
use crate::dix::window::{self, Geometry};
use crate::dix::{Access, Arena, ClientId, DixError, DixResult, ErrorCode, Handle, ResourceType, Response};
use crate::server::Server;

pub const VERSION: (u32, u32) = (1, 4);

pub const BUFFER_SWAP_COMPLETE: u8 = 0;
pub const INVALIDATE_BUFFERS: u8 = 1;
const NUM_EVENTS: u8 = 2;

pub const DRIVER_DRI: u32 = 0;
pub const DRIVER_VDPAU: u32 = 1;

pub const FRONT_LEFT: u32 = 0;
pub const BACK_LEFT: u32 = 1;
pub const FRONT_RIGHT: u32 = 2;
pub const BACK_RIGHT: u32 = 3;
pub const DEPTH: u32 = 4;
pub const STENCIL: u32 = 5;
pub const ACCUM: u32 = 6;
pub const FAKE_FRONT_LEFT: u32 = 7;
pub const FAKE_FRONT_RIGHT: u32 = 8;
pub const DEPTH_STENCIL: u32 = 9;
pub const HIZ: u32 = 10;

/// Param 0: whether buffers report their age
const PARAM_X_HAS_BUFFER_AGE: u32 = 0;

const OP_WAIT_MSC: u16 = 10;
const OP_WAIT_SBC: u16 = 11;

/// A client's interest in a drawable's buffer invalidations
#[derive(Debug)]
struct DrawableRef {
    id: Xid,
    drawable: Xid,
    client: ClientId,
}

#[derive(Debug)]
pub struct Dri2Drawable {
    pub swap: DrawableSwapState,
    width: u16,
    height: u16,
    buffers: Vec<(BufferInfo, u32)>,
    refs: Vec<Handle>,
}

#[derive(Debug)]
struct MscWaiter {
    client: ClientId,
    drawable: Xid,
    screen: usize,
    deadline: u64,
    sequence: u16,
}

#[derive(Debug)]
struct SbcWaiter {
    client: ClientId,
    drawable: Xid,
    target: u64,
    sequence: u16,
}

pub struct Dri2 {
    backend: Box<dyn Dri2Backend>,
    driver_name: String,
    vdpau_driver_name: Option<String>,
    device_name: String,
    swap_limit: u32,
    ref_type: ResourceType,
    refs: Arena<DrawableRef>,
    drawables: HashMap<Xid, Dri2Drawable>,
    msc_waiters: Vec<MscWaiter>,
    sbc_waiters: Vec<SbcWaiter>,
}

impl Dri2 {
    pub fn drawable(&self, id: Xid) -> Option<&Dri2Drawable> {
        self.drawables.get(&id)
    }

    fn state_for(&mut self, id: Xid, geometry: &Geometry) -> &mut Dri2Drawable {
        self.drawables.entry(id).or_insert_with(|| Dri2Drawable {
            swap: DrawableSwapState::new(geometry.screen),
            width: geometry.width,
            height: geometry.height,
            buffers: Vec::new(),
            refs: Vec::new(),
        })
    }
}

pub fn init(server: &mut Server, config: &Dri2Config, backend: Box<dyn Dri2Backend>) -> DixResult<()> {
    if server.panoramix.is_some() {
        info!("DRI2 is not available with fan-out, skipping");
        return Ok(());
    }
    let ref_type = server.resources.register_type(
        "DRI2Drawable",
        destroy_ref,
        ErrorCode::Core(BAD_DRAWABLE),
    )?;
    server
        .extensions
        .add_extension(DRI2_NAME, NUM_EVENTS, 0, VERSION, dispatch)?;
    server.dri2 = Some(Dri2 {
        backend,
        driver_name: config.driver_name.clone(),
        vdpau_driver_name: config.vdpau_driver_name.clone(),
        device_name: config.device_name.clone(),
        swap_limit: config.swap_limit,
        ref_type,
        refs: Arena::new(),
        drawables: HashMap::new(),
        msc_waiters: Vec::new(),
        sbc_waiters: Vec::new(),
    });
    Ok(())
}

fn dri2_mut(server: &mut Server) -> DixResult<&mut Dri2> {
    server.dri2.as_mut().ok_or(DixError::BadRequest)
}

fn lookup(server: &Server, client: ClientId, id: Xid, access: Access) -> DixResult<Geometry> {
    let drawable = window::lookup_drawable(server, client, id, access)?;
    server
        .drawables
        .geometry(drawable)
        .ok_or(DixError::bad_drawable(id))
}

fn dispatch(server: &mut Server, client: ClientId, request: Request) -> DixResult<Response> {
    let Request::Dri2(req) = request else {
        return Err(DixError::BadRequest);
    };
    if let Dri2Request::QueryVersion { major, minor } = req {
        return query_version(server, client, DRI2_NAME, (major, minor));
    }
    if !server.is_local(client) {
        return Err(DixError::NotLocal {
            code: ErrorCode::Core(BAD_REQUEST),
        });
    }

    match req {
        Dri2Request::QueryVersion { .. } => Err(DixError::BadRequest),
        Dri2Request::Connect {
            window,
            driver_type,
        } => connect(server, client, window, driver_type),
        Dri2Request::Authenticate { window, magic } => {
            let handle = window::lookup_window(server, client, window, Access::GET_ATTR)?;
            let screen = server
                .drawables
                .windows
                .get(handle)
                .map(|w| w.screen)
                .unwrap_or(0);
            let authenticated = dri2_mut(server)?.backend.authenticate(screen, magic);
            Ok(Response::Reply(Reply::Authenticate { authenticated }))
        }
        Dri2Request::CreateDrawable { drawable } => create_drawable(server, client, drawable),
        Dri2Request::DestroyDrawable { drawable } => {
            // the reference goes away with the client or the drawable
            lookup(server, client, drawable, Access::REMOVE)?;
            Ok(Response::None)
        }
        Dri2Request::GetBuffers {
            drawable,
            attachments,
        } => {
            let wanted = attachments.into_iter().map(|a| (a, 0)).collect();
            get_buffers(server, client, drawable, wanted)
        }
        Dri2Request::GetBuffersWithFormat {
            drawable,
            attachments,
        } => {
            let wanted = attachments
                .into_iter()
                .map(|AttachmentFormat { attachment, format }| (attachment, format))
                .collect();
            get_buffers(server, client, drawable, wanted)
        }
        Dri2Request::CopyRegion {
            drawable,
            region,
            dest,
            src,
        } => {
            lookup(server, client, drawable, Access::WRITE)?;
            let rects = crate::xfixes::region_rects(server, client, region)?;
            dri2_mut(server)?
                .backend
                .copy_region(drawable, &rects, dest, src)?;
            Ok(Response::Reply(Reply::CopyRegion))
        }
        Dri2Request::SwapBuffers {
            drawable,
            target_msc_hi,
            target_msc_lo,
            divisor_hi,
            divisor_lo,
            remainder_hi,
            remainder_lo,
        } => {
            let sbc = swap_buffers(
                server,
                client,
                drawable,
                join_u64(target_msc_hi, target_msc_lo),
                join_u64(divisor_hi, divisor_lo),
                join_u64(remainder_hi, remainder_lo),
            )?;
            let (swap_hi, swap_lo) = split_u64(sbc);
            Ok(Response::Reply(Reply::SwapBuffers { swap_hi, swap_lo }))
        }
        Dri2Request::GetMSC { drawable } => {
            let geometry = lookup(server, client, drawable, Access::READ)?;
            let dri2 = dri2_mut(server)?;
            let (ust, msc) = dri2.backend.msc(geometry.screen);
            let sbc = dri2.state_for(drawable, &geometry).swap.completed_sbc;
            Ok(Response::Reply(msc_reply(ust, msc, sbc)))
        }
        Dri2Request::WaitMSC {
            drawable,
            target_msc_hi,
            target_msc_lo,
            divisor_hi,
            divisor_lo,
            remainder_hi,
            remainder_lo,
        } => wait_msc(
            server,
            client,
            drawable,
            join_u64(target_msc_hi, target_msc_lo),
            join_u64(divisor_hi, divisor_lo),
            join_u64(remainder_hi, remainder_lo),
        ),
        Dri2Request::WaitSBC {
            drawable,
            target_sbc_hi,
            target_sbc_lo,
        } => wait_sbc(server, client, drawable, join_u64(target_sbc_hi, target_sbc_lo)),
        Dri2Request::SwapInterval { drawable, interval } => {
            let geometry = lookup(server, client, drawable, Access::WRITE)?;
            dri2_mut(server)?
                .state_for(drawable, &geometry)
                .swap
                .swap_interval = interval;
            Ok(Response::None)
        }
        Dri2Request::GetParam { drawable, param } => {
            lookup(server, client, drawable, Access::READ)?;
            let dri2 = dri2_mut(server)?;
            let value = match param >> 24 {
                0 if param == PARAM_X_HAS_BUFFER_AGE => Some(u64::from(dri2.backend.buffer_age())),
                // server and reserved ranges
                0 | 1 => None,
                _ => dri2.backend.get_param(param),
            };
            let (value_hi, value_lo) = split_u64(value.unwrap_or(0));
            Ok(Response::Reply(Reply::Param {
                recognized: value.is_some(),
                value_hi,
                value_lo,
            }))
        }
    }
}

fn msc_reply(ust: u64, msc: u64, sbc: u64) -> Reply {
    let (ust_hi, ust_lo) = split_u64(ust);
    let (msc_hi, msc_lo) = split_u64(msc);
    let (sbc_hi, sbc_lo) = split_u64(sbc);
    Reply::Msc {
        ust_hi,
        ust_lo,
        msc_hi,
        msc_lo,
        sbc_hi,
        sbc_lo,
    }
}

fn connect(server: &mut Server, client: ClientId, window: Xid, driver_type: u32) -> DixResult<Response> {
    window::lookup_window(server, client, window, Access::GET_ATTR)?;
    let dri2 = dri2_mut(server)?;
    let driver = match driver_type {
        DRIVER_DRI => Some(dri2.driver_name.clone()),
        DRIVER_VDPAU => dri2.vdpau_driver_name.clone(),
        _ => None,
    };
    // unsupported driver types get empty names, not an error
    let reply = match driver {
        Some(driver_name) => Reply::Dri2Connect {
            driver_name,
            device_name: dri2.device_name.clone(),
        },
        None => Reply::Dri2Connect {
            driver_name: String::new(),
            device_name: String::new(),
        },
    };
    Ok(Response::Reply(reply))
}

fn create_drawable(server: &mut Server, client: ClientId, drawable: Xid) -> DixResult<Response> {
    let geometry = lookup(server, client, drawable, Access::ADD)?;
    let dri2 = dri2_mut(server)?;
    // one reference per (client, drawable)
    if dri2
        .refs
        .iter()
        .any(|(_, r)| r.client == client && r.drawable == drawable)
    {
        return Ok(Response::None);
    }
    let ref_type = dri2.ref_type;
    let handle = dri2.refs.insert(DrawableRef {
        id: 0,
        drawable,
        client,
    });
    let id = match server.add_fake_resource(client, ref_type, handle) {
        Ok(id) => id,
        Err(e) => {
            dri2_mut(server)?.refs.remove(handle);
            return Err(e);
        }
    };
    let dri2 = dri2_mut(server)?;
    if let Some(record) = dri2.refs.get_mut(handle) {
        record.id = id;
    }
    dri2.state_for(drawable, &geometry).refs.push(handle);
    debug!("DRI2 drawable 0x{:08x} referenced as 0x{:08x}", drawable, id);
    Ok(Response::None)
}

fn get_buffers(
    server: &mut Server,
    client: ClientId,
    drawable: Xid,
    wanted: Vec<(u32, u32)>,
) -> DixResult<Response> {
    let geometry = lookup(server, client, drawable, Access::READ)?;
    if let Some((attachment, _)) = wanted.iter().find(|(a, _)| *a > HIZ) {
        return Err(DixError::BadValue(*attachment));
    }
    let Dri2 {
        backend, drawables, ..
    } = dri2_mut(server)?;
    let state = drawables.entry(drawable).or_insert_with(|| Dri2Drawable {
        swap: DrawableSwapState::new(geometry.screen),
        width: geometry.width,
        height: geometry.height,
        buffers: Vec::new(),
        refs: Vec::new(),
    });

    if (state.width, state.height) != (geometry.width, geometry.height) {
        for (buffer, _) in state.buffers.drain(..) {
            backend.destroy_buffer(&buffer);
        }
        state.width = geometry.width;
        state.height = geometry.height;
    }

    let mut buffers = Vec::with_capacity(wanted.len());
    for (attachment, format) in wanted {
        let existing = state
            .buffers
            .iter()
            .find(|(b, f)| b.attachment == attachment && *f == format)
            .map(|(b, _)| *b);
        let buffer = match existing {
            Some(buffer) => buffer,
            None => {
                let buffer = backend.create_buffer(
                    geometry.screen,
                    attachment,
                    format,
                    geometry.width,
                    geometry.height,
                )?;
                state.buffers.push((buffer, format));
                buffer
            }
        };
        // the real front buffer of a window stays with the server
        if geometry.is_window && attachment == FRONT_LEFT {
            continue;
        }
        buffers.push(buffer);
    }

    Ok(Response::Reply(Reply::Buffers {
        width: u32::from(geometry.width),
        height: u32::from(geometry.height),
        buffers,
    }))
}

/// Accept or throttle a swap; returns the sbc receipt
pub fn swap_buffers(
    server: &mut Server,
    client: ClientId,
    drawable: Xid,
    target_msc: u64,
    divisor: u64,
    remainder: u64,
) -> DixResult<u64> {
    let geometry = lookup(server, client, drawable, Access::WRITE)?;
    let dri2 = dri2_mut(server)?;
    let swap_limit = dri2.swap_limit;
    let Dri2 {
        backend, drawables, ..
    } = dri2;
    let state = drawables.entry(drawable).or_insert_with(|| Dri2Drawable {
        swap: DrawableSwapState::new(geometry.screen),
        width: geometry.width,
        height: geometry.height,
        buffers: Vec::new(),
        refs: Vec::new(),
    });

    if state.swap.throttled(swap_limit) {
        debug!(
            "Swap on 0x{:08x} throttled at sbc {}",
            drawable, state.swap.sbc
        );
        return Ok(state.swap.sbc);
    }

    let target = state.swap.effective_target(target_msc, divisor, remainder);
    let request = SwapRequest {
        drawable,
        screen: geometry.screen,
        target_msc: target,
        divisor,
        remainder,
        sbc: state.swap.next_sbc(),
    };
    // backend first so a refusal leaves no trace
    let scheduled = backend
        .schedule_swap(request)
        .map_err(|_| DixError::bad_drawable(drawable))?;
    let sbc = state.swap.accept(client, scheduled, divisor, remainder);
    let refs = state.refs.clone();

    let watchers: Vec<ClientId> = refs
        .iter()
        .filter_map(|h| dri2_ref_client(&server.dri2, *h))
        .collect();
    for watcher in watchers {
        server.send_event(
            watcher,
            DRI2_NAME,
            INVALIDATE_BUFFERS,
            Event::InvalidateBuffers { drawable },
        );
    }
    Ok(sbc)
}

fn dri2_ref_client(dri2: &Option<Dri2>, handle: Handle) -> Option<ClientId> {
    dri2.as_ref()?.refs.get(handle).map(|r| r.client)
}

fn wait_msc(
    server: &mut Server,
    client: ClientId,
    drawable: Xid,
    target: u64,
    divisor: u64,
    remainder: u64,
) -> DixResult<Response> {
    let geometry = lookup(server, client, drawable, Access::READ)?;
    let sequence = server.clients.get(client).map(|c| c.sequence).unwrap_or(0);
    let dri2 = dri2_mut(server)?;
    let (ust, msc) = dri2.backend.msc(geometry.screen);
    let sbc = dri2.state_for(drawable, &geometry).swap.completed_sbc;

    let deadline = next_msc(msc, target, divisor, remainder);
    if msc >= deadline {
        return Ok(Response::Reply(msc_reply(ust, msc, sbc)));
    }
    dri2.msc_waiters.push(MscWaiter {
        client,
        drawable,
        screen: geometry.screen,
        deadline,
        sequence,
    });
    Ok(Response::Deferred)
}

fn wait_sbc(server: &mut Server, client: ClientId, drawable: Xid, target: u64) -> DixResult<Response> {
    let geometry = lookup(server, client, drawable, Access::READ)?;
    let sequence = server.clients.get(client).map(|c| c.sequence).unwrap_or(0);
    let dri2 = dri2_mut(server)?;
    let state = &dri2.state_for(drawable, &geometry).swap;
    // zero waits for every swap accepted so far
    let target = if target == 0 { state.sbc } else { target };
    if state.completed_sbc >= target {
        let reply = msc_reply(state.last_ust, state.last_msc, state.completed_sbc);
        return Ok(Response::Reply(reply));
    }
    dri2.sbc_waiters.push(SbcWaiter {
        client,
        drawable,
        target,
        sequence,
    });
    Ok(Response::Deferred)
}

fn major_opcode(server: &Server) -> u8 {
    server
        .extensions
        .get(DRI2_NAME)
        .map(|e| e.major_opcode)
        .unwrap_or(0)
}

/// Backend finished a swap
pub fn swap_complete(server: &mut Server, drawable: Xid, ust: u64, msc: u64, sbc: u64, kind: SwapKind) {
    let Some(dri2) = server.dri2.as_mut() else { return };
    let Some(state) = dri2.drawables.get_mut(&drawable) else {
        debug!("Swap completion for unknown drawable 0x{:08x}", drawable);
        return;
    };
    let issuer = state.swap.complete(sbc, ust, msc);
    let completed = state.swap.completed_sbc;
    let (ready, waiting): (Vec<_>, Vec<_>) = dri2
        .sbc_waiters
        .drain(..)
        .partition(|w| w.drawable == drawable && w.target <= completed);
    dri2.sbc_waiters = waiting;

    match issuer {
        Some(client) if server.clients.is_live(client) => {
            let (ust_hi, ust_lo) = split_u64(ust);
            let (msc_hi, msc_lo) = split_u64(msc);
            let (sbc_hi, sbc_lo) = split_u64(sbc);
            server.send_event(
                client,
                DRI2_NAME,
                BUFFER_SWAP_COMPLETE,
                Event::BufferSwapComplete {
                    event_type: kind as u16,
                    drawable,
                    ust_hi,
                    ust_lo,
                    msc_hi,
                    msc_lo,
                    sbc_hi,
                    sbc_lo,
                },
            );
        }
        Some(_) => debug!("Dropping swap {} completion, client has left", sbc),
        None => debug!("Swap {} on 0x{:08x} was not pending", sbc, drawable),
    }

    let major = major_opcode(server);
    for waiter in ready {
        server.resume_client(
            waiter.client,
            waiter.sequence,
            major,
            OP_WAIT_SBC,
            Ok(msc_reply(ust, msc, completed)),
        );
    }
}

/// A screen's MSC advanced
pub fn vblank(server: &mut Server, screen: usize, ust: u64, msc: u64) {
    let Some(dri2) = server.dri2.as_mut() else { return };
    let (ready, waiting): (Vec<_>, Vec<_>) = dri2
        .msc_waiters
        .drain(..)
        .partition(|w| w.screen == screen && w.deadline <= msc);
    dri2.msc_waiters = waiting;
    let replies: Vec<(MscWaiter, u64)> = ready
        .into_iter()
        .map(|w| {
            let sbc = dri2
                .drawables
                .get(&w.drawable)
                .map(|d| d.swap.completed_sbc)
                .unwrap_or(0);
            (w, sbc)
        })
        .collect();

    let major = major_opcode(server);
    for (waiter, sbc) in replies {
        server.resume_client(
            waiter.client,
            waiter.sequence,
            major,
            OP_WAIT_MSC,
            Ok(msc_reply(ust, msc, sbc)),
        );
    }
}

/// The drawable is being destroyed: drop its state and wake its waiters
pub fn drawable_gone(server: &mut Server, id: Xid) {
    let Some(dri2) = server.dri2.as_mut() else { return };
    let Some(state) = dri2.drawables.remove(&id) else { return };
    dri2.backend.cancel_swaps(id);
    for (buffer, _) in &state.buffers {
        dri2.backend.destroy_buffer(buffer);
    }

    let ref_ids: Vec<Xid> = state
        .refs
        .iter()
        .filter_map(|h| dri2.refs.get(*h).map(|r| r.id))
        .collect();
    let (msc_ready, msc_rest): (Vec<_>, Vec<_>) =
        dri2.msc_waiters.drain(..).partition(|w| w.drawable == id);
    dri2.msc_waiters = msc_rest;
    let (sbc_ready, sbc_rest): (Vec<_>, Vec<_>) =
        dri2.sbc_waiters.drain(..).partition(|w| w.drawable == id);
    dri2.sbc_waiters = sbc_rest;

    for ref_id in ref_ids {
        if let Err(e) = free_resource(server, ref_id) {
            debug!("DRI2 reference 0x{:08x} already gone: {}", ref_id, e);
        }
    }

    let major = major_opcode(server);
    let woken = msc_ready
        .into_iter()
        .map(|w| (w.client, w.sequence, OP_WAIT_MSC))
        .chain(sbc_ready.into_iter().map(|w| (w.client, w.sequence, OP_WAIT_SBC)));
    for (client, sequence, minor) in woken.collect::<Vec<_>>() {
        server.resume_client(client, sequence, major, minor, Err(DixError::bad_drawable(id)));
    }
    debug!("DRI2 state for 0x{:08x} released", id);
}

/// Forget waiters of a departing client
pub fn client_gone(server: &mut Server, client: ClientId) {
    let Some(dri2) = server.dri2.as_mut() else { return };
    dri2.msc_waiters.retain(|w| w.client != client);
    dri2.sbc_waiters.retain(|w| w.client != client);
}

fn destroy_ref(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    let Some(dri2) = server.dri2.as_mut() else {
        return Ok(());
    };
    if let Some(record) = dri2.refs.remove(handle) {
        if let Some(state) = dri2.drawables.get_mut(&record.drawable) {
            state.refs.retain(|h| *h != handle);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{self, FakeClient};
    use xdix_proto::{CoreRequest, ServerMessage};

    fn swap(c: &mut FakeClient, server: &mut Server, drawable: Xid) -> Vec<ServerMessage> {
        c.request(
            server,
            Request::Dri2(Dri2Request::SwapBuffers {
                drawable,
                target_msc_hi: 0,
                target_msc_lo: 0,
                divisor_hi: 0,
                divisor_lo: 0,
                remainder_hi: 0,
                remainder_lo: 0,
            }),
        )
    }

    fn receipt(msgs: &[ServerMessage]) -> u64 {
        match testing::reply(msgs) {
            Some(Reply::SwapBuffers { swap_hi, swap_lo }) => join_u64(swap_hi, swap_lo),
            other => panic!("expected swap reply, got {:?}", other),
        }
    }

    fn setup() -> (Server, testing::Mocks, FakeClient, Xid) {
        let (mut server, mocks) = testing::server();
        let mut c = testing::connect(&mut server, true);
        let window = c.base() | 1;
        c.create_window(&mut server, window, 0);
        (server, mocks, c, window)
    }

    #[test]
    fn test_throttle_boundedness() {
        let (mut server, mocks, mut c, window) = setup();
        let mut receipts = Vec::new();
        for _ in 0..4 {
            receipts.push(receipt(&swap(&mut c, &mut server, window)));
        }
        // default limit is one outstanding swap
        assert_eq!(receipts, vec![1, 1, 1, 1]);
        let state = &server.dri2.as_ref().unwrap().drawable(window).unwrap().swap;
        assert_eq!(state.outstanding_swaps, 1);
        assert_eq!(mocks.dri2.lock().scheduled.len(), 1);
    }

    #[test]
    fn test_sbc_strictly_increases_across_completions() {
        let (mut server, _, mut c, window) = setup();
        let mut last = 0;
        for msc in 1..=5 {
            let sbc = receipt(&swap(&mut c, &mut server, window));
            assert!(sbc > last);
            last = sbc;
            testing::complete_swap(&mut server, window, sbc, msc * 1000, msc);
            let events = testing::events(&c.drain());
            assert!(events.iter().any(|e| matches!(
                e,
                Event::BufferSwapComplete { sbc_lo, .. } if u64::from(*sbc_lo) == sbc
            )));
        }
    }

    #[test]
    fn test_completion_after_disconnect_is_dropped() {
        let (mut server, _, mut owner, window) = setup();
        let mut swapper = testing::connect(&mut server, true);
        let sbc = receipt(&swap(&mut swapper, &mut server, window));

        server.disconnect(swapper.id);
        testing::complete_swap(&mut server, window, sbc, 10, 1);

        assert!(swapper.drain().is_empty());
        assert!(testing::events(&owner.drain()).is_empty());
        let state = &server.dri2.as_ref().unwrap().drawable(window).unwrap().swap;
        assert_eq!(state.outstanding_swaps, 0);
        assert_eq!(state.completed_sbc, sbc);
    }

    #[test]
    fn test_backend_refusal_leaves_no_trace() {
        let (mut server, mocks, mut c, window) = setup();
        mocks.dri2.lock().fail_swaps = true;
        let replies = swap(&mut c, &mut server, window);
        assert_eq!(testing::error_code(&replies), Some(9));
        let state = &server.dri2.as_ref().unwrap().drawable(window).unwrap().swap;
        assert_eq!(state.sbc, 0);
        assert_eq!(state.outstanding_swaps, 0);
    }

    #[test]
    fn test_remote_clients_only_get_version() {
        let (mut server, _, _, window) = setup();
        let mut remote = testing::connect(&mut server, false);
        let replies = remote.request(
            &mut server,
            Request::Dri2(Dri2Request::QueryVersion { major: 1, minor: 9 }),
        );
        assert_eq!(
            testing::reply(&replies),
            Some(Reply::Version { major: 1, minor: 4 })
        );
        assert_eq!(testing::error_code(&swap(&mut remote, &mut server, window)), Some(1));
    }

    #[test]
    fn test_front_left_withheld_for_windows() {
        let (mut server, _, mut c, window) = setup();
        let replies = c.request(
            &mut server,
            Request::Dri2(Dri2Request::GetBuffers {
                drawable: window,
                attachments: vec![FRONT_LEFT, BACK_LEFT],
            }),
        );
        match testing::reply(&replies) {
            Some(Reply::Buffers { width, buffers, .. }) => {
                assert_eq!(width, 100);
                assert_eq!(buffers.len(), 1);
                assert_eq!(buffers[0].attachment, BACK_LEFT);
            }
            other => panic!("unexpected {:?}", other),
        }

        // pixmaps get their front buffer
        let pixmap = c.base() | 9;
        c.request(
            &mut server,
            Request::Core(CoreRequest::CreatePixmap {
                pid: pixmap,
                drawable: window,
                width: 8,
                height: 8,
                depth: 24,
            }),
        );
        let replies = c.request(
            &mut server,
            Request::Dri2(Dri2Request::GetBuffers {
                drawable: pixmap,
                attachments: vec![FRONT_LEFT],
            }),
        );
        assert!(matches!(
            testing::reply(&replies),
            Some(Reply::Buffers { buffers, .. }) if buffers.len() == 1
        ));
    }

    #[test]
    fn test_buffers_are_reused_until_resize() {
        let (mut server, mocks, mut c, window) = setup();
        let get = |c: &mut FakeClient, server: &mut Server| {
            c.request(
                server,
                Request::Dri2(Dri2Request::GetBuffers {
                    drawable: window,
                    attachments: vec![BACK_LEFT],
                }),
            )
        };
        let first = testing::reply(&get(&mut c, &mut server));
        let second = testing::reply(&get(&mut c, &mut server));
        assert_eq!(first, second);
        assert_eq!(mocks.dri2.lock().live_buffers, 1);
    }

    #[test]
    fn test_invalidate_goes_to_referencing_clients() {
        let (mut server, _, mut c, window) = setup();
        let mut watcher = testing::connect(&mut server, true);
        watcher.request(
            &mut server,
            Request::Dri2(Dri2Request::CreateDrawable { drawable: window }),
        );
        swap(&mut c, &mut server, window);
        assert_eq!(
            testing::events(&watcher.drain()),
            vec![Event::InvalidateBuffers { drawable: window }]
        );

        // the reference dies with its client
        server.disconnect(watcher.id);
        let state = server.dri2.as_ref().unwrap().drawable(window).unwrap();
        assert!(state.refs.is_empty());
    }

    #[test]
    fn test_repeated_create_drawable_keeps_one_reference() {
        let (mut server, _, mut c, window) = setup();
        let mut watcher = testing::connect(&mut server, true);
        for _ in 0..2 {
            let msgs = watcher.request(
                &mut server,
                Request::Dri2(Dri2Request::CreateDrawable { drawable: window }),
            );
            assert_eq!(testing::error_code(&msgs), None);
        }
        let state = server.dri2.as_ref().unwrap().drawable(window).unwrap();
        assert_eq!(state.refs.len(), 1);

        swap(&mut c, &mut server, window);
        assert_eq!(
            testing::events(&watcher.drain()),
            vec![Event::InvalidateBuffers { drawable: window }]
        );
    }

    #[test]
    fn test_wait_msc_defers_until_vblank() {
        let (mut server, mocks, mut c, window) = setup();
        mocks.dri2.set_msc(100, 10);
        let wait = Request::Dri2(Dri2Request::WaitMSC {
            drawable: window,
            target_msc_hi: 0,
            target_msc_lo: 12,
            divisor_hi: 0,
            divisor_lo: 0,
            remainder_hi: 0,
            remainder_lo: 0,
        });
        assert!(c.request(&mut server, wait).is_empty());

        // queued behind the wait
        let queued = c.request(
            &mut server,
            Request::Core(CoreRequest::QueryExtension {
                name: "DRI2".to_string(),
            }),
        );
        assert!(queued.is_empty());

        testing::vblank(&mut server, 0, 110, 11);
        assert!(c.drain().is_empty());

        testing::vblank(&mut server, 0, 120, 12);
        let replies = c.drain();
        assert_eq!(replies.len(), 2);
        match &replies[0] {
            ServerMessage::Reply {
                sequence,
                reply: Reply::Msc { msc_lo, .. },
            } => {
                assert_eq!(*sequence, 2);
                assert_eq!(*msc_lo, 12);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(replies[1], ServerMessage::Reply { sequence: 3, .. }));
    }

    #[test]
    fn test_wait_msc_already_reached_replies_now() {
        let (mut server, mocks, mut c, window) = setup();
        mocks.dri2.set_msc(100, 20);
        let replies = c.request(
            &mut server,
            Request::Dri2(Dri2Request::WaitMSC {
                drawable: window,
                target_msc_hi: 0,
                target_msc_lo: 5,
                divisor_hi: 0,
                divisor_lo: 0,
                remainder_hi: 0,
                remainder_lo: 0,
            }),
        );
        assert!(matches!(
            testing::reply(&replies),
            Some(Reply::Msc { msc_lo: 20, .. })
        ));
    }

    #[test]
    fn test_wait_sbc_resumes_on_completion() {
        let (mut server, _, mut c, window) = setup();
        let sbc = receipt(&swap(&mut c, &mut server, window));
        let replies = c.request(
            &mut server,
            Request::Dri2(Dri2Request::WaitSBC {
                drawable: window,
                target_sbc_hi: 0,
                target_sbc_lo: 0,
            }),
        );
        assert!(replies.is_empty());

        testing::complete_swap(&mut server, window, sbc, 5000, 3);
        let replies = c.drain();
        assert!(replies.iter().any(|m| matches!(
            m,
            ServerMessage::Reply { reply: Reply::Msc { sbc_lo: 1, msc_lo: 3, .. }, .. }
        )));
    }

    #[test]
    fn test_destroyed_drawable_wakes_waiters_with_error() {
        let (mut server, _, mut c, window) = setup();
        receipt(&swap(&mut c, &mut server, window));
        c.request(
            &mut server,
            Request::Dri2(Dri2Request::WaitSBC {
                drawable: window,
                target_sbc_hi: 0,
                target_sbc_lo: 1,
            }),
        );

        // a second client tears the window down
        let mut other = testing::connect(&mut server, true);
        other.request(
            &mut server,
            Request::Core(CoreRequest::DestroyWindow { window }),
        );
        assert_eq!(testing::error_code(&c.drain()), Some(9));
        assert!(!server.clients.get(c.id).unwrap().suspended);
        assert!(server.dri2.as_ref().unwrap().drawable(window).is_none());
    }

    #[test]
    fn test_swap_interval_sets_default_target() {
        let (mut server, mocks, mut c, window) = setup();
        c.request(
            &mut server,
            Request::Dri2(Dri2Request::SwapInterval {
                drawable: window,
                interval: 2,
            }),
        );
        let sbc = receipt(&swap(&mut c, &mut server, window));
        testing::complete_swap(&mut server, window, sbc, 0, 2);
        swap(&mut c, &mut server, window);
        let targets: Vec<u64> = mocks
            .dri2
            .lock()
            .scheduled
            .iter()
            .map(|s| s.target_msc)
            .collect();
        assert_eq!(targets, vec![2, 4]);
    }

    #[test]
    fn test_get_param() {
        let (mut server, _, mut c, window) = setup();
        let mut param = |param| {
            testing::reply(&c.request(
                &mut server,
                Request::Dri2(Dri2Request::GetParam {
                    drawable: window,
                    param,
                }),
            ))
        };
        assert_eq!(
            param(0),
            Some(Reply::Param {
                recognized: true,
                value_hi: 0,
                value_lo: 1
            })
        );
        assert!(matches!(param(0x0100_0000), Some(Reply::Param { recognized: false, .. })));
        assert!(matches!(
            param(0x0200_0001),
            Some(Reply::Param { recognized: true, value_lo: 42, .. })
        ));
    }
}
