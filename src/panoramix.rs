//! Multi-Screen Fan-out
//!
//! With several physical screens presented as one logical screen, a client
//! id names one physical object per screen. The first screen's object keeps
//! the client's id; the others get server-chosen ids in the client's range.
//!
//! Requests that fan out apply the single-screen operation to each screen
//! in turn and stop at the first error. Screens already done stay done.

use std::collections::{HashMap, HashSet};
use tracing::debug;
use xdix_proto::{CompositeRequest, CoreRequest, Reply, Xid};

use crate::composite;
use crate::dix::resource::free_resource;
use crate::dix::window::{self, Screen};
use crate::dix::{Access, ClientId, DixError, DixResult, Response};
use crate::server::Server;

/// Order in which screens are visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Creation-style requests
    Forward,
    /// Teardown-style requests, the reverse of the matching creation
    Backward,
}

impl Walk {
    pub fn order(self, count: usize) -> Vec<usize> {
        match self {
            Walk::Forward => (0..count).collect(),
            Walk::Backward => (0..count).rev().collect(),
        }
    }
}

pub struct PanoramiX {
    /// Logical id to physical ids, indexed by screen
    table: HashMap<Xid, Vec<Xid>>,
    /// Server-chosen physical ids a client may register
    siblings: HashSet<Xid>,
    /// Left edge of each screen in the logical screen
    offsets: Vec<i32>,
}

impl PanoramiX {
    /// Screens are laid out left to right; their roots form one logical root
    pub fn new(screens: &[Screen]) -> Self {
        let mut offsets = Vec::with_capacity(screens.len());
        let mut x = 0i32;
        for screen in screens {
            offsets.push(x);
            x += i32::from(screen.width);
        }
        let mut table = HashMap::new();
        if let Some(first) = screens.first() {
            table.insert(first.root, screens.iter().map(|s| s.root).collect());
        }
        Self {
            table,
            siblings: HashSet::new(),
            offsets,
        }
    }

    pub fn num_screens(&self) -> usize {
        self.offsets.len()
    }

    pub fn physical(&self, logical: Xid) -> Option<&[Xid]> {
        self.table.get(&logical).map(Vec::as_slice)
    }

    pub fn is_sibling(&self, id: Xid) -> bool {
        self.siblings.contains(&id)
    }

    fn drop_entry(&mut self, logical: Xid) -> Option<Vec<Xid>> {
        let ids = self.table.remove(&logical)?;
        for id in ids.iter().skip(1) {
            self.siblings.remove(id);
        }
        Some(ids)
    }
}

/// Run `op` once per screen in `walk` order, stopping at the first error
pub fn for_each_screen<F>(server: &mut Server, walk: Walk, mut op: F) -> DixResult<()>
where
    F: FnMut(&mut Server, usize) -> DixResult<()>,
{
    let count = server.panoramix.as_ref().map_or(1, PanoramiX::num_screens);
    for screen in walk.order(count) {
        if let Err(e) = op(server, screen) {
            debug!("Fan-out stopped at screen {}: {}", screen, e);
            return Err(e);
        }
    }
    Ok(())
}

fn physical(server: &Server, logical: Xid, absent: DixError) -> DixResult<Vec<Xid>> {
    server
        .panoramix
        .as_ref()
        .and_then(|p| p.physical(logical))
        .map(<[Xid]>::to_vec)
        .ok_or(absent)
}

/// Claim a new logical id and its per-screen siblings
fn reserve(server: &mut Server, client: ClientId, logical: Xid) -> DixResult<Vec<Xid>> {
    let legal = server
        .clients
        .get(client)
        .is_some_and(|c| c.legal_new_id(logical));
    if !legal {
        return Err(DixError::BadIdChoice(logical));
    }
    if server.resources.contains(logical) {
        return Err(DixError::IdInUse(logical));
    }
    let count = server.panoramix.as_ref().map_or(1, PanoramiX::num_screens);
    let mut ids = vec![logical];
    for _ in 1..count {
        let id = server
            .clients
            .get_mut(client)
            .map(|c| c.fake_id())
            .ok_or(DixError::BadAlloc("client gone"))?;
        ids.push(id);
    }
    let p = server.panoramix.as_mut().ok_or(DixError::BadRequest)?;
    p.siblings.extend(ids.iter().skip(1).copied());
    p.table.insert(logical, ids.clone());
    Ok(ids)
}

/// Drop a reservation when not even the first screen was created
fn unreserve_unused(server: &mut Server, logical: Xid) {
    if server.resources.contains(logical) {
        return;
    }
    if let Some(p) = server.panoramix.as_mut() {
        p.drop_entry(logical);
    }
}

/// A logical object died; take its siblings with it
pub fn forget(server: &mut Server, id: Xid) {
    let Some(ids) = server.panoramix.as_mut().and_then(|p| p.drop_entry(id)) else {
        return;
    };
    for sibling in ids.into_iter().skip(1) {
        if server.resources.contains(sibling) {
            if let Err(e) = free_resource(server, sibling) {
                debug!("Sibling 0x{:08x} of 0x{:08x} not freed: {}", sibling, id, e);
            }
        }
    }
}

// ----------------------------------------------------------------------
// Core requests
// ----------------------------------------------------------------------

pub fn dispatch_core(server: &mut Server, client: ClientId, req: CoreRequest) -> DixResult<Response> {
    match req {
        CoreRequest::CreateWindow {
            wid,
            parent,
            screen,
            x,
            y,
            width,
            height,
        } => {
            if screen != 0 {
                return Err(DixError::BadValue(screen));
            }
            let logical_root = server.screens.first().map(|s| s.root).unwrap_or(0);
            let parent = if parent == 0 { logical_root } else { parent };
            window::lookup_window(server, client, parent, Access::ADD)?;
            let parents = physical(server, parent, DixError::bad_window(parent))?;
            let top_level = parent == logical_root;

            let ids = reserve(server, client, wid)?;
            let result = for_each_screen(server, Walk::Forward, |server, s| {
                let parent = window::lookup_window(server, client, parents[s], Access::ADD)?;
                let x = if top_level {
                    let offset = server
                        .panoramix
                        .as_ref()
                        .and_then(|p| p.offsets.get(s).copied())
                        .unwrap_or(0);
                    (i32::from(x) - offset).clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
                } else {
                    x
                };
                window::create_window(server, client, ids[s], parent, (x, y, width, height))?;
                Ok(())
            });
            unreserve_unused(server, wid);
            result?;
        }
        CoreRequest::MapWindow { window } => map_all(server, client, window, true)?,
        CoreRequest::UnmapWindow { window } => map_all(server, client, window, false)?,
        CoreRequest::DestroyWindow { window } => {
            let ids = physical(server, window, DixError::bad_window(window))?;
            for_each_screen(server, Walk::Backward, |server, s| {
                // an earlier screen's destruction may have cascaded here
                if !server.resources.contains(ids[s]) {
                    return Ok(());
                }
                window::destroy_window_request(server, client, ids[s])
            })?;
        }
        CoreRequest::CreatePixmap {
            pid,
            drawable,
            width,
            height,
            depth,
        } => {
            let drawables = physical(server, drawable, DixError::bad_drawable(drawable))?;
            let ids = reserve(server, client, pid)?;
            let result = for_each_screen(server, Walk::Forward, |server, s| {
                let target = window::lookup_drawable(server, client, drawables[s], Access::GET_ATTR)?;
                window::create_pixmap(server, client, ids[s], target, width, height, depth)?;
                Ok(())
            });
            unreserve_unused(server, pid);
            result?;
        }
        CoreRequest::FreePixmap { pixmap } => {
            let ids = physical(server, pixmap, DixError::bad_pixmap(pixmap))?;
            for_each_screen(server, Walk::Backward, |server, s| {
                if !server.resources.contains(ids[s]) {
                    return Ok(());
                }
                window::free_pixmap(server, client, ids[s])
            })?;
        }
        CoreRequest::QueryExtension { name } => {
            return Ok(Response::Reply(server.extensions.query(&name)));
        }
    }
    Ok(Response::None)
}

fn map_all(server: &mut Server, client: ClientId, window: Xid, mapped: bool) -> DixResult<()> {
    let ids = physical(server, window, DixError::bad_window(window))?;
    for_each_screen(server, Walk::Forward, |server, s| {
        window::set_mapped(server, client, ids[s], mapped)
    })
}

// ----------------------------------------------------------------------
// Composite
// ----------------------------------------------------------------------

/// Composite requests that are applied per screen
pub fn fans_out(req: &CompositeRequest) -> bool {
    walk_of(req).is_some()
}

pub fn walk_of(req: &CompositeRequest) -> Option<Walk> {
    match req {
        CompositeRequest::RedirectWindow { .. }
        | CompositeRequest::RedirectSubwindows { .. }
        | CompositeRequest::NameWindowPixmap { .. }
        | CompositeRequest::GetOverlayWindow { .. } => Some(Walk::Forward),
        CompositeRequest::UnredirectWindow { .. }
        | CompositeRequest::UnredirectSubwindows { .. }
        | CompositeRequest::ReleaseOverlayWindow { .. } => Some(Walk::Backward),
        CompositeRequest::QueryVersion { .. } | CompositeRequest::CreateRegionFromBorderClip { .. } => None,
    }
}

pub fn dispatch_composite(
    server: &mut Server,
    client: ClientId,
    req: CompositeRequest,
) -> DixResult<Response> {
    let Some(walk) = walk_of(&req) else {
        return Err(DixError::BadRequest);
    };
    match req {
        CompositeRequest::RedirectWindow { window, update } => {
            let ids = physical(server, window, DixError::bad_window(window))?;
            for_each_screen(server, walk, |server, s| {
                composite::redirect_window(server, client, ids[s], update)
            })?;
        }
        CompositeRequest::RedirectSubwindows { window, update } => {
            let ids = physical(server, window, DixError::bad_window(window))?;
            for_each_screen(server, walk, |server, s| {
                composite::redirect_subwindows(server, client, ids[s], update)
            })?;
        }
        CompositeRequest::UnredirectWindow { window, update } => {
            let ids = physical(server, window, DixError::bad_window(window))?;
            for_each_screen(server, walk, |server, s| {
                composite::unredirect_window(server, client, ids[s], update)
            })?;
        }
        CompositeRequest::UnredirectSubwindows { window, update } => {
            let ids = physical(server, window, DixError::bad_window(window))?;
            for_each_screen(server, walk, |server, s| {
                composite::unredirect_subwindows(server, client, ids[s], update)
            })?;
        }
        CompositeRequest::NameWindowPixmap { window, pixmap } => {
            let windows = physical(server, window, DixError::bad_window(window))?;
            let pixmaps = reserve(server, client, pixmap)?;
            let result = for_each_screen(server, walk, |server, s| {
                composite::name_window_pixmap(server, client, windows[s], pixmaps[s])
            });
            unreserve_unused(server, pixmap);
            result?;
        }
        CompositeRequest::GetOverlayWindow { window } => {
            let windows = physical(server, window, DixError::bad_window(window))?;
            let mut overlays = Vec::with_capacity(windows.len());
            for_each_screen(server, walk, |server, s| {
                overlays.push(composite::get_overlay_window(server, client, windows[s])?);
                Ok(())
            })?;
            let overlay_win = overlays.first().copied().unwrap_or(0);
            if let Some(p) = server.panoramix.as_mut() {
                p.table.entry(overlay_win).or_insert(overlays);
            }
            return Ok(Response::Reply(Reply::OverlayWindow { overlay_win }));
        }
        CompositeRequest::ReleaseOverlayWindow { window } => {
            let windows = physical(server, window, DixError::bad_window(window))?;
            for_each_screen(server, walk, |server, s| {
                composite::release_overlay_window(server, client, windows[s])
            })?;
        }
        CompositeRequest::QueryVersion { .. } | CompositeRequest::CreateRegionFromBorderClip { .. } => {}
    }
    Ok(Response::None)
}
