//! Composite Extension
//!
//! Redirection of window trees into per-window backing pixmaps, and the
//! per-screen overlay window.
//!
//! Every redirection a client makes is a resource in that client's id
//! range, so disconnecting drops it through the ordinary destructor path.
//! A redirected window keeps one reference on its backing pixmap; every
//! id naming that pixmap holds another.

use std::collections::HashMap;
use tracing::debug;
use xdix_proto::{CompositeRequest, Rect, Reply, Request, Update, Xid, COMPOSITE_NAME};

use crate::dix::extension::query_version;
use crate::dix::resource::free_resource;
use crate::dix::window::{self, Window};
use crate::dix::{Access, Arena, ClientId, DixError, DixResult, ErrorCode, Handle, ResourceType, Response};
use crate::server::Server;
use crate::xfixes::{self, Region};

pub const VERSION: (u32, u32) = (0, 4);

const BACKING_DEPTH: u8 = 24;

/// One client's redirection of one window (or of a window's children)
#[derive(Debug, Clone, Copy)]
struct Redirect {
    client: ClientId,
    update: Update,
    /// Resource id holding the redirection
    id: Xid,
}

#[derive(Debug)]
struct Record {
    window: Handle,
    subwindows: bool,
}

#[derive(Debug)]
pub struct CompWindow {
    redirects: Vec<Redirect>,
    pub update: Update,
    pub pixmap: Handle,
}

#[derive(Debug)]
struct OverlayClaim {
    screen: usize,
    client: ClientId,
    id: Xid,
}

#[derive(Debug, Default)]
struct OverlayScreen {
    window: Option<(Xid, Handle)>,
    claims: Vec<Handle>,
}

pub struct Composite {
    window_type: ResourceType,
    subwindows_type: ResourceType,
    overlay_type: ResourceType,
    windows: HashMap<Handle, CompWindow>,
    subwindows: HashMap<Handle, Vec<Redirect>>,
    records: Arena<Record>,
    claims: Arena<OverlayClaim>,
    overlays: Vec<OverlayScreen>,
}

impl Composite {
    pub fn window(&self, window: Handle) -> Option<&CompWindow> {
        self.windows.get(&window)
    }

    pub fn overlay_window(&self, screen: usize) -> Option<Xid> {
        self.overlays.get(screen)?.window.map(|(id, _)| id)
    }
}

fn combined_update(redirects: &[Redirect]) -> Update {
    if redirects.iter().any(|r| r.update == Update::Manual) {
        Update::Manual
    } else {
        Update::Automatic
    }
}

pub fn init(server: &mut Server) -> DixResult<()> {
    let resources = &mut server.resources;
    let window_type = resources.register_type(
        "CompositeClientWindow",
        destroy_client_window,
        ErrorCode::Core(crate::dix::error::BAD_VALUE),
    )?;
    let subwindows_type = resources.register_type(
        "CompositeClientSubwindows",
        destroy_client_window,
        ErrorCode::Core(crate::dix::error::BAD_VALUE),
    )?;
    let overlay_type = resources.register_type(
        "CompositeClientOverlay",
        destroy_overlay_claim,
        ErrorCode::Core(crate::dix::error::BAD_VALUE),
    )?;
    server
        .extensions
        .add_extension(COMPOSITE_NAME, 0, 0, VERSION, dispatch)?;
    server.composite = Some(Composite {
        window_type,
        subwindows_type,
        overlay_type,
        windows: HashMap::new(),
        subwindows: HashMap::new(),
        records: Arena::new(),
        claims: Arena::new(),
        overlays: server.screens.iter().map(|_| OverlayScreen::default()).collect(),
    });
    Ok(())
}

fn composite_mut(server: &mut Server) -> DixResult<&mut Composite> {
    server.composite.as_mut().ok_or(DixError::BadRequest)
}

fn dispatch(server: &mut Server, client: ClientId, request: Request) -> DixResult<Response> {
    let Request::Composite(req) = request else {
        return Err(DixError::BadRequest);
    };
    if let CompositeRequest::QueryVersion { major, minor } = req {
        return query_version(server, client, COMPOSITE_NAME, (major, minor));
    }
    if server.panoramix.is_some() && crate::panoramix::fans_out(&req) {
        return crate::panoramix::dispatch_composite(server, client, req);
    }

    match req {
        CompositeRequest::RedirectWindow { window, update } => {
            redirect_window(server, client, window, update)?
        }
        CompositeRequest::RedirectSubwindows { window, update } => {
            redirect_subwindows(server, client, window, update)?
        }
        CompositeRequest::UnredirectWindow { window, update } => {
            unredirect_window(server, client, window, update)?
        }
        CompositeRequest::UnredirectSubwindows { window, update } => {
            unredirect_subwindows(server, client, window, update)?
        }
        CompositeRequest::CreateRegionFromBorderClip { region, window } => {
            let handle = window::lookup_window(server, client, window, Access::GET_ATTR)?;
            let rects = border_clip(server, handle);
            xfixes::create_region(server, client, region, Region::new(rects))?;
        }
        CompositeRequest::NameWindowPixmap { window, pixmap } => {
            name_window_pixmap(server, client, window, pixmap)?
        }
        CompositeRequest::GetOverlayWindow { window } => {
            let overlay_win = get_overlay_window(server, client, window)?;
            return Ok(Response::Reply(Reply::OverlayWindow { overlay_win }));
        }
        CompositeRequest::ReleaseOverlayWindow { window } => {
            release_overlay_window(server, client, window)?
        }
        CompositeRequest::QueryVersion { .. } => {}
    }
    Ok(Response::None)
}

fn lookup_redirectable(server: &Server, client: ClientId, window: Xid) -> DixResult<Handle> {
    window::lookup_window(
        server,
        client,
        window,
        Access::SET_ATTR | Access::MANAGE | Access::BLEND,
    )
}

fn is_root(server: &Server, window: Handle) -> bool {
    server
        .drawables
        .windows
        .get(window)
        .is_some_and(Window::is_root)
}

/// Redirect one physical window for `client`
pub fn redirect_window(server: &mut Server, client: ClientId, window: Xid, update: Update) -> DixResult<()> {
    let handle = lookup_redirectable(server, client, window)?;
    if is_root(server, handle) {
        return Err(DixError::BadMatch("root windows cannot be redirected"));
    }
    attach_redirect(server, client, handle, update)
}

fn attach_redirect(server: &mut Server, client: ClientId, window: Handle, update: Update) -> DixResult<()> {
    let (screen, width, height) = server
        .drawables
        .windows
        .get(window)
        .map(|w| (w.screen, w.width, w.height))
        .ok_or(DixError::BadMatch("window is gone"))?;
    let comp = composite_mut(server)?;
    if let Some(cw) = comp.windows.get(&window) {
        if cw.redirects.iter().any(|r| r.client == client) {
            return Err(DixError::BadAccess("window already redirected by this client"));
        }
        if update == Update::Manual && cw.update == Update::Manual {
            return Err(DixError::BadAccess("window already has a manual redirection"));
        }
    }
    let record = comp.records.insert(Record {
        window,
        subwindows: false,
    });
    let rtype = comp.window_type;
    let id = match server.add_fake_resource(client, rtype, record) {
        Ok(id) => id,
        Err(e) => {
            composite_mut(server)?.records.remove(record);
            return Err(e);
        }
    };

    let comp = server.composite.as_mut().ok_or(DixError::BadRequest)?;
    let drawables = &mut server.drawables;
    let cw = comp.windows.entry(window).or_insert_with(|| CompWindow {
        redirects: Vec::new(),
        update: Update::Automatic,
        pixmap: drawables.new_pixmap(screen, width, height, BACKING_DEPTH),
    });
    cw.redirects.push(Redirect { client, update, id });
    cw.update = combined_update(&cw.redirects);
    debug!("Window {} redirected ({:?})", window.raw(), update);
    Ok(())
}

/// Redirect every current and future child of one physical window
pub fn redirect_subwindows(
    server: &mut Server,
    client: ClientId,
    window: Xid,
    update: Update,
) -> DixResult<()> {
    let handle = lookup_redirectable(server, client, window)?;
    let comp = composite_mut(server)?;
    if let Some(existing) = comp.subwindows.get(&handle) {
        if existing.iter().any(|r| r.client == client) {
            return Err(DixError::BadAccess("subwindows already redirected by this client"));
        }
        if update == Update::Manual && combined_update(existing) == Update::Manual {
            return Err(DixError::BadAccess("subwindows already have a manual redirection"));
        }
    }
    let record = comp.records.insert(Record {
        window: handle,
        subwindows: true,
    });
    let rtype = comp.subwindows_type;
    let id = match server.add_fake_resource(client, rtype, record) {
        Ok(id) => id,
        Err(e) => {
            composite_mut(server)?.records.remove(record);
            return Err(e);
        }
    };

    let children = server
        .drawables
        .windows
        .get(handle)
        .map(|w| w.children.clone())
        .unwrap_or_default();
    for (done, child) in children.iter().enumerate() {
        if let Err(e) = attach_redirect(server, client, *child, update) {
            for undone in &children[..done] {
                detach_redirect(server, client, *undone, update);
            }
            if let Err(free) = free_resource(server, id) {
                debug!("Subwindow record 0x{:08x} already gone: {}", id, free);
            }
            return Err(e);
        }
    }

    composite_mut(server)?
        .subwindows
        .entry(handle)
        .or_default()
        .push(Redirect { client, update, id });
    Ok(())
}

/// Free the redirection `client` made of `window` with `update`, if any
fn detach_redirect(server: &mut Server, client: ClientId, window: Handle, update: Update) -> bool {
    let id = server.composite.as_ref().and_then(|c| {
        c.windows
            .get(&window)?
            .redirects
            .iter()
            .find(|r| r.client == client && r.update == update)
            .map(|r| r.id)
    });
    match id {
        Some(id) => free_resource(server, id).is_ok(),
        None => false,
    }
}

pub fn unredirect_window(server: &mut Server, client: ClientId, window: Xid, update: Update) -> DixResult<()> {
    let handle = lookup_redirectable(server, client, window)?;
    if detach_redirect(server, client, handle, update) {
        Ok(())
    } else {
        Err(DixError::BadValue(window))
    }
}

pub fn unredirect_subwindows(
    server: &mut Server,
    client: ClientId,
    window: Xid,
    update: Update,
) -> DixResult<()> {
    let handle = lookup_redirectable(server, client, window)?;
    let id = server.composite.as_ref().and_then(|c| {
        c.subwindows
            .get(&handle)?
            .iter()
            .find(|r| r.client == client && r.update == update)
            .map(|r| r.id)
    });
    let id = id.ok_or(DixError::BadValue(window))?;
    free_resource(server, id)
}

/// Visible part of the window border, relative to the window origin
fn border_clip(server: &Server, window: Handle) -> Vec<Rect> {
    let drawables = &server.drawables;
    if !drawables.is_viewable(window) {
        return Vec::new();
    }
    let (ox, oy) = drawables.origin(window);
    let Some(w) = drawables.windows.get(window) else {
        return Vec::new();
    };
    let (mut x1, mut y1) = (ox, oy);
    let (mut x2, mut y2) = (ox + i32::from(w.width), oy + i32::from(w.height));

    let mut ancestor = w.parent;
    while let Some(handle) = ancestor {
        let Some(a) = drawables.windows.get(handle) else { break };
        let (ax, ay) = drawables.origin(handle);
        x1 = x1.max(ax);
        y1 = y1.max(ay);
        x2 = x2.min(ax + i32::from(a.width));
        y2 = y2.min(ay + i32::from(a.height));
        ancestor = a.parent;
    }
    if x2 <= x1 || y2 <= y1 {
        return Vec::new();
    }
    vec![Rect {
        x: (x1 - ox) as i16,
        y: (y1 - oy) as i16,
        width: (x2 - x1) as u16,
        height: (y2 - y1) as u16,
    }]
}

/// Give the backing pixmap of a redirected window a client id
pub fn name_window_pixmap(server: &mut Server, client: ClientId, window: Xid, pixmap: Xid) -> DixResult<()> {
    let handle = window::lookup_window(server, client, window, Access::GET_ATTR)?;
    if !server.drawables.is_viewable(handle) {
        return Err(DixError::BadMatch("window is not viewable"));
    }
    let backing = server
        .composite
        .as_ref()
        .and_then(|c| c.windows.get(&handle))
        .map(|cw| cw.pixmap)
        .ok_or(DixError::BadMatch("window is not redirected"))?;
    let p = server
        .drawables
        .pixmaps
        .get_mut(backing)
        .ok_or(DixError::BadMatch("window has no backing pixmap"))?;
    p.refcnt += 1;
    if let Err(e) = server.add_resource(client, pixmap, server.drawables.pixmap_type, backing) {
        server.drawables.unref_pixmap(backing);
        return Err(e);
    }
    Ok(())
}

/// Claim the overlay window of the window's screen, creating it if needed
pub fn get_overlay_window(server: &mut Server, client: ClientId, window: Xid) -> DixResult<Xid> {
    let handle = window::lookup_window(server, client, window, Access::GET_ATTR)?;
    let screen = server
        .drawables
        .windows
        .get(handle)
        .map(|w| w.screen)
        .ok_or(DixError::bad_window(window))?;

    let comp = composite_mut(server)?;
    let claim = comp.claims.insert(OverlayClaim {
        screen,
        client,
        id: 0,
    });
    let rtype = comp.overlay_type;
    let claim_id = match server.add_fake_resource(client, rtype, claim) {
        Ok(id) => id,
        Err(e) => {
            composite_mut(server)?.claims.remove(claim);
            return Err(e);
        }
    };
    let comp = composite_mut(server)?;
    if let Some(c) = comp.claims.get_mut(claim) {
        c.id = claim_id;
    }
    if let Some(overlay) = comp.overlays.get_mut(screen) {
        overlay.claims.push(claim);
        if let Some((id, _)) = overlay.window {
            return Ok(id);
        }
    }

    match create_overlay(server, screen) {
        Ok(id) => Ok(id),
        Err(e) => {
            if let Err(free) = free_resource(server, claim_id) {
                debug!("Overlay claim 0x{:08x} already gone: {}", claim_id, free);
            }
            Err(e)
        }
    }
}

fn create_overlay(server: &mut Server, screen: usize) -> DixResult<Xid> {
    let Some((root, width, height)) = server
        .screens
        .get(screen)
        .map(|s| (s.root_window, s.width, s.height))
    else {
        return Err(DixError::BadValue(screen as u32));
    };
    let id = server.clients.server_id();
    let handle = server.drawables.windows.insert(Window {
        id,
        screen,
        parent: Some(root),
        children: Vec::new(),
        x: 0,
        y: 0,
        width,
        height,
        mapped: true,
    });
    if let Err(e) = server.resources.add(id, server.drawables.window_type, handle) {
        server.drawables.windows.remove(handle);
        return Err(e);
    }
    if let Some(r) = server.drawables.windows.get_mut(root) {
        r.children.push(handle);
    }
    if let Some(overlay) = composite_mut(server)?.overlays.get_mut(screen) {
        overlay.window = Some((id, handle));
    }
    debug!("Overlay window 0x{:08x} created on screen {}", id, screen);
    Ok(id)
}

pub fn release_overlay_window(server: &mut Server, client: ClientId, window: Xid) -> DixResult<()> {
    let handle = window::lookup_window(server, client, window, Access::GET_ATTR)?;
    let screen = server
        .drawables
        .windows
        .get(handle)
        .map(|w| w.screen)
        .ok_or(DixError::bad_window(window))?;
    let claim_id = server.composite.as_ref().and_then(|c| {
        c.overlays.get(screen)?.claims.iter().find_map(|h| {
            c.claims
                .get(*h)
                .filter(|claim| claim.client == client)
                .map(|claim| claim.id)
        })
    });
    let claim_id = claim_id.ok_or(DixError::BadMatch("overlay window was never claimed"))?;
    free_resource(server, claim_id)
}

/// New windows inherit their parent's subwindow redirections
pub fn window_created(server: &mut Server, window: Handle) {
    let Some(parent) = server.drawables.windows.get(window).and_then(|w| w.parent) else {
        return;
    };
    let inherited: Vec<Redirect> = server
        .composite
        .as_ref()
        .and_then(|c| c.subwindows.get(&parent))
        .cloned()
        .unwrap_or_default();
    for r in inherited {
        if let Err(e) = attach_redirect(server, r.client, window, r.update) {
            debug!("Automatic redirection of window {} failed: {}", window.raw(), e);
        }
    }
}

/// Drop every redirection of a window that is being destroyed
pub fn window_destroyed(server: &mut Server, window: Handle) {
    let Some(comp) = server.composite.as_mut() else { return };
    let mut ids: Vec<Xid> = Vec::new();
    if let Some(cw) = comp.windows.get(&window) {
        ids.extend(cw.redirects.iter().map(|r| r.id));
    }
    if let Some(subs) = comp.subwindows.get(&window) {
        ids.extend(subs.iter().map(|r| r.id));
    }
    for overlay in &mut comp.overlays {
        if overlay.window.is_some_and(|(_, h)| h == window) {
            overlay.window = None;
        }
    }
    for id in ids {
        if let Err(e) = free_resource(server, id) {
            debug!("Redirect record 0x{:08x} already gone: {}", id, e);
        }
    }
}

fn destroy_client_window(server: &mut Server, handle: Handle, id: Xid) -> DixResult<()> {
    let Some(comp) = server.composite.as_mut() else {
        return Ok(());
    };
    let Some(record) = comp.records.remove(handle) else {
        return Ok(());
    };

    if record.subwindows {
        let mut removed = None;
        if let Some(subs) = comp.subwindows.get_mut(&record.window) {
            if let Some(pos) = subs.iter().position(|r| r.id == id) {
                removed = Some(subs.remove(pos));
            }
            if subs.is_empty() {
                comp.subwindows.remove(&record.window);
            }
        }
        // children lose the redirection they inherited
        if let Some(r) = removed {
            let children = server
                .drawables
                .windows
                .get(record.window)
                .map(|w| w.children.clone())
                .unwrap_or_default();
            for child in children {
                detach_redirect(server, r.client, child, r.update);
            }
        }
        return Ok(());
    }

    let mut released = None;
    if let Some(cw) = comp.windows.get_mut(&record.window) {
        cw.redirects.retain(|r| r.id != id);
        cw.update = combined_update(&cw.redirects);
        if cw.redirects.is_empty() {
            released = comp.windows.remove(&record.window).map(|cw| cw.pixmap);
        }
    }
    if let Some(pixmap) = released {
        server.drawables.unref_pixmap(pixmap);
        debug!("Window {} no longer redirected", record.window.raw());
    }
    Ok(())
}

fn destroy_overlay_claim(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    let Some(comp) = server.composite.as_mut() else {
        return Ok(());
    };
    let Some(claim) = comp.claims.remove(handle) else {
        return Ok(());
    };
    let Some(overlay) = comp.overlays.get_mut(claim.screen) else {
        return Ok(());
    };
    overlay.claims.retain(|h| *h != handle);
    if !overlay.claims.is_empty() {
        return Ok(());
    }
    if let Some((id, _)) = overlay.window.take() {
        debug!("Last overlay claim on screen {} released", claim.screen);
        if server.resources.contains(id) {
            free_resource(server, id)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{self, FakeClient};
    use xdix_proto::{CoreRequest, ServerMessage};

    fn redirect(c: &mut FakeClient, server: &mut Server, window: Xid, update: Update) -> Vec<ServerMessage> {
        c.request(
            server,
            Request::Composite(CompositeRequest::RedirectWindow { window, update }),
        )
    }

    fn handle(server: &Server, window: Xid) -> Handle {
        server
            .resources
            .lookup(window, server.drawables.window_type)
            .unwrap()
    }

    #[test]
    fn test_redirect_rules() {
        let (mut server, _) = testing::server();
        let mut a = testing::connect(&mut server, true);
        let mut b = testing::connect(&mut server, true);
        let window = a.base() | 1;
        a.create_window(&mut server, window, 0);
        let root = server.screens[0].root;

        assert_eq!(testing::error_code(&redirect(&mut a, &mut server, root, Update::Automatic)), Some(8));
        assert_eq!(testing::error_code(&redirect(&mut a, &mut server, window, Update::Manual)), None);
        assert_eq!(testing::error_code(&redirect(&mut a, &mut server, window, Update::Automatic)), Some(10));
        assert_eq!(testing::error_code(&redirect(&mut b, &mut server, window, Update::Manual)), Some(10));
        assert_eq!(testing::error_code(&redirect(&mut b, &mut server, window, Update::Automatic)), None);

        let replies = b.request(
            &mut server,
            Request::Composite(CompositeRequest::UnredirectWindow {
                window,
                update: Update::Manual,
            }),
        );
        assert_eq!(testing::error_code(&replies), Some(2));

        // disconnecting the manual redirector leaves b's redirection
        server.disconnect(a.id);
        assert!(!server.resources.contains(window));
    }

    #[test]
    fn test_backing_pixmap_is_shared_with_its_names() {
        let (mut server, _) = testing::server();
        let mut c = testing::connect(&mut server, true);
        let window = c.base() | 1;
        let pixmap = c.base() | 2;
        c.create_window(&mut server, window, 0);

        let name = |c: &mut FakeClient, server: &mut Server| {
            c.request(
                server,
                Request::Composite(CompositeRequest::NameWindowPixmap { window, pixmap }),
            )
        };
        // not viewable yet
        assert_eq!(testing::error_code(&name(&mut c, &mut server)), Some(8));
        c.map(&mut server, window);
        // not redirected
        assert_eq!(testing::error_code(&name(&mut c, &mut server)), Some(8));

        redirect(&mut c, &mut server, window, Update::Automatic);
        assert_eq!(testing::error_code(&name(&mut c, &mut server)), None);
        let backing = server.resources.lookup(pixmap, server.drawables.pixmap_type).unwrap();
        assert_eq!(server.drawables.pixmaps.get(backing).unwrap().refcnt, 2);

        // the name keeps the pixmap alive after unredirecting
        c.request(
            &mut server,
            Request::Composite(CompositeRequest::UnredirectWindow {
                window,
                update: Update::Automatic,
            }),
        );
        assert_eq!(server.drawables.pixmaps.get(backing).unwrap().refcnt, 1);
        c.request(&mut server, Request::Core(CoreRequest::FreePixmap { pixmap }));
        assert!(server.drawables.pixmaps.get(backing).is_none());
    }

    #[test]
    fn test_subwindow_redirection_reaches_new_children() {
        let (mut server, _) = testing::server();
        let mut c = testing::connect(&mut server, true);
        let top = c.base() | 1;
        let old_child = c.base() | 2;
        let new_child = c.base() | 3;
        c.create_window(&mut server, top, 0);
        c.create_window(&mut server, old_child, top);

        c.request(
            &mut server,
            Request::Composite(CompositeRequest::RedirectSubwindows {
                window: top,
                update: Update::Automatic,
            }),
        );
        c.create_window(&mut server, new_child, top);
        let comp = server.composite.as_ref().unwrap();
        assert!(comp.window(handle(&server, old_child)).is_some());
        assert!(comp.window(handle(&server, new_child)).is_some());
        assert!(comp.window(handle(&server, top)).is_none());

        c.request(
            &mut server,
            Request::Composite(CompositeRequest::UnredirectSubwindows {
                window: top,
                update: Update::Automatic,
            }),
        );
        let comp = server.composite.as_ref().unwrap();
        assert!(comp.window(handle(&server, old_child)).is_none());
        assert!(comp.window(handle(&server, new_child)).is_none());
    }

    #[test]
    fn test_overlay_lifecycle() {
        let (mut server, _) = testing::server();
        let mut a = testing::connect(&mut server, true);
        let mut b = testing::connect(&mut server, true);
        let root = server.screens[0].root;
        let get = Request::Composite(CompositeRequest::GetOverlayWindow { window: root });
        let release = Request::Composite(CompositeRequest::ReleaseOverlayWindow { window: root });

        assert_eq!(testing::error_code(&a.request(&mut server, release.clone())), Some(8));

        let first = testing::reply(&a.request(&mut server, get.clone()));
        let second = testing::reply(&b.request(&mut server, get));
        assert_eq!(first, second);
        let Some(Reply::OverlayWindow { overlay_win }) = first else {
            panic!("expected overlay reply");
        };
        assert!(server.resources.contains(overlay_win));

        a.request(&mut server, release.clone());
        assert!(server.resources.contains(overlay_win));
        // the last claim goes with its client
        server.disconnect(b.id);
        assert!(!server.resources.contains(overlay_win));
        assert_eq!(server.composite.as_ref().unwrap().overlay_window(0), None);
    }

    #[test]
    fn test_border_clip_is_window_relative_and_clipped() {
        let (mut server, _) = testing::server();
        let mut c = testing::connect(&mut server, true);
        let top = c.base() | 1;
        let child = c.base() | 2;
        let region = c.base() | 3;
        c.create_window(&mut server, top, 0);
        // 100x100 at (10, 10) inside a 100x100 parent
        c.create_window(&mut server, child, top);
        c.map(&mut server, top);
        c.map(&mut server, child);

        c.request(
            &mut server,
            Request::Composite(CompositeRequest::CreateRegionFromBorderClip { region, window: child }),
        );
        let rects = xfixes::region_rects(&server, c.id, region).unwrap();
        assert_eq!(
            rects,
            vec![Rect {
                x: 0,
                y: 0,
                width: 90,
                height: 90
            }]
        );
    }
}
