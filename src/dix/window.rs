//! Screens, Windows and Pixmaps
//!
//! Just enough of the core drawable model for extension requests to have
//! something to validate: a window tree under each screen's root and
//! reference-counted pixmaps that several ids (or none) may name.

use tracing::debug;
use xdix_proto::{CoreRequest, Xid};

use super::arena::{Arena, Handle};
use super::client::ClientId;
use super::error::{DixError, DixResult, ErrorCode, BAD_DRAWABLE, BAD_PIXMAP, BAD_WINDOW};
use super::extension::Response;
use super::resource::{free_resource, Access, Registry, ResourceType};
use crate::config::ScreenConfig;
use crate::server::Server;

const DEPTHS: [u8; 7] = [1, 4, 8, 15, 16, 24, 32];

#[derive(Debug)]
pub struct Screen {
    pub index: usize,
    pub root: Xid,
    pub root_window: Handle,
    pub width: u16,
    pub height: u16,
    pub refresh_hz: u32,
}

#[derive(Debug)]
pub struct Window {
    pub id: Xid,
    pub screen: usize,
    pub parent: Option<Handle>,
    pub children: Vec<Handle>,
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
    pub mapped: bool,
}

impl Window {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[derive(Debug)]
pub struct Pixmap {
    pub screen: usize,
    pub width: u16,
    pub height: u16,
    pub depth: u8,
    /// One per id naming the pixmap plus one per internal holder
    pub refcnt: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrawableRef {
    Window(Handle),
    Pixmap(Handle),
}

/// Drawable position in screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub screen: usize,
    pub x: i32,
    pub y: i32,
    pub width: u16,
    pub height: u16,
    pub is_window: bool,
}

pub struct Drawables {
    pub windows: Arena<Window>,
    pub pixmaps: Arena<Pixmap>,
    pub window_type: ResourceType,
    pub pixmap_type: ResourceType,
}

impl Drawables {
    pub fn new(registry: &mut Registry) -> DixResult<Self> {
        Ok(Self {
            windows: Arena::new(),
            pixmaps: Arena::new(),
            window_type: registry.register_type(
                "Window",
                destroy_window,
                ErrorCode::Core(BAD_WINDOW),
            )?,
            pixmap_type: registry.register_type(
                "Pixmap",
                destroy_pixmap,
                ErrorCode::Core(BAD_PIXMAP),
            )?,
        })
    }

    /// Mapped, and every ancestor mapped
    pub fn is_viewable(&self, window: Handle) -> bool {
        let mut current = Some(window);
        while let Some(handle) = current {
            match self.windows.get(handle) {
                Some(w) if w.mapped => current = w.parent,
                _ => return false,
            }
        }
        true
    }

    /// Window origin in screen coordinates
    pub fn origin(&self, window: Handle) -> (i32, i32) {
        let (mut x, mut y) = (0i32, 0i32);
        let mut current = Some(window);
        while let Some(handle) = current {
            let Some(w) = self.windows.get(handle) else { break };
            x += i32::from(w.x);
            y += i32::from(w.y);
            current = w.parent;
        }
        (x, y)
    }

    pub fn geometry(&self, drawable: DrawableRef) -> Option<Geometry> {
        match drawable {
            DrawableRef::Window(h) => {
                let w = self.windows.get(h)?;
                let (x, y) = self.origin(h);
                Some(Geometry {
                    screen: w.screen,
                    x,
                    y,
                    width: w.width,
                    height: w.height,
                    is_window: true,
                })
            }
            DrawableRef::Pixmap(h) => {
                let p = self.pixmaps.get(h)?;
                Some(Geometry {
                    screen: p.screen,
                    x: 0,
                    y: 0,
                    width: p.width,
                    height: p.height,
                    is_window: false,
                })
            }
        }
    }

    pub fn new_pixmap(&mut self, screen: usize, width: u16, height: u16, depth: u8) -> Handle {
        self.pixmaps.insert(Pixmap {
            screen,
            width,
            height,
            depth,
            refcnt: 1,
        })
    }

    /// Drop one reference, freeing the pixmap with the last one
    pub fn unref_pixmap(&mut self, pixmap: Handle) {
        let Some(p) = self.pixmaps.get_mut(pixmap) else { return };
        p.refcnt = p.refcnt.saturating_sub(1);
        if p.refcnt == 0 {
            self.pixmaps.remove(pixmap);
            debug!("Pixmap {} released", pixmap.raw());
        }
    }
}

/// Create the root window of every configured screen
pub fn init_screens(server: &mut Server, screens: &[ScreenConfig]) -> DixResult<()> {
    for (index, config) in screens.iter().enumerate() {
        let root = server.clients.server_id();
        let root_window = server.drawables.windows.insert(Window {
            id: root,
            screen: index,
            parent: None,
            children: Vec::new(),
            x: 0,
            y: 0,
            width: config.width,
            height: config.height,
            mapped: true,
        });
        server
            .resources
            .add(root, server.drawables.window_type, root_window)?;
        server.screens.push(Screen {
            index,
            root,
            root_window,
            width: config.width,
            height: config.height,
            refresh_hz: config.refresh_hz,
        });
    }
    Ok(())
}

pub fn lookup_window(
    server: &Server,
    client: ClientId,
    id: Xid,
    access: Access,
) -> DixResult<Handle> {
    server.lookup(client, id, server.drawables.window_type, access)
}

pub fn lookup_drawable(
    server: &Server,
    client: ClientId,
    id: Xid,
    access: Access,
) -> DixResult<DrawableRef> {
    let types = [server.drawables.window_type, server.drawables.pixmap_type];
    let absent = DixError::BadResource {
        id,
        what: "drawable",
        code: ErrorCode::Core(BAD_DRAWABLE),
    };
    let (rtype, handle) = server.lookup_class(client, id, &types, absent, access)?;
    if rtype == server.drawables.window_type {
        Ok(DrawableRef::Window(handle))
    } else {
        Ok(DrawableRef::Pixmap(handle))
    }
}

pub fn dispatch_core(server: &mut Server, client: ClientId, req: CoreRequest) -> DixResult<Response> {
    if let CoreRequest::QueryExtension { name } = &req {
        return Ok(Response::Reply(server.extensions.query(name)));
    }
    if server.panoramix.is_some() {
        return crate::panoramix::dispatch_core(server, client, req);
    }
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
            let parent = resolve_parent(server, client, parent, screen)?;
            create_window(server, client, wid, parent, (x, y, width, height))?;
        }
        CoreRequest::MapWindow { window } => set_mapped(server, client, window, true)?,
        CoreRequest::UnmapWindow { window } => set_mapped(server, client, window, false)?,
        CoreRequest::DestroyWindow { window } => destroy_window_request(server, client, window)?,
        CoreRequest::CreatePixmap {
            pid,
            drawable,
            width,
            height,
            depth,
        } => {
            let drawable = lookup_drawable(server, client, drawable, Access::GET_ATTR)?;
            create_pixmap(server, client, pid, drawable, width, height, depth)?;
        }
        CoreRequest::FreePixmap { pixmap } => free_pixmap(server, client, pixmap)?,
        CoreRequest::QueryExtension { .. } => {}
    }
    Ok(Response::None)
}

/// Parent 0 means the root of `screen`
pub fn resolve_parent(
    server: &Server,
    client: ClientId,
    parent: Xid,
    screen: u32,
) -> DixResult<Handle> {
    if parent == 0 {
        return server
            .screens
            .get(screen as usize)
            .map(|s| s.root_window)
            .ok_or(DixError::BadValue(screen));
    }
    lookup_window(server, client, parent, Access::ADD)
}

pub fn create_window(
    server: &mut Server,
    client: ClientId,
    wid: Xid,
    parent: Handle,
    (x, y, width, height): (i16, i16, u16, u16),
) -> DixResult<Handle> {
    if width == 0 || height == 0 {
        return Err(DixError::BadValue(0));
    }
    let screen = server
        .drawables
        .windows
        .get(parent)
        .map(|p| p.screen)
        .ok_or(DixError::bad_window(wid))?;
    let handle = server.drawables.windows.insert(Window {
        id: wid,
        screen,
        parent: Some(parent),
        children: Vec::new(),
        x,
        y,
        width,
        height,
        mapped: false,
    });
    if let Err(e) = server.add_resource(client, wid, server.drawables.window_type, handle) {
        server.drawables.windows.remove(handle);
        return Err(e);
    }
    if let Some(p) = server.drawables.windows.get_mut(parent) {
        p.children.push(handle);
    }
    crate::composite::window_created(server, handle);
    Ok(handle)
}

pub fn set_mapped(server: &mut Server, client: ClientId, window: Xid, mapped: bool) -> DixResult<()> {
    let handle = lookup_window(server, client, window, Access::SET_ATTR)?;
    if let Some(w) = server.drawables.windows.get_mut(handle) {
        if !w.is_root() {
            w.mapped = mapped;
        }
    }
    Ok(())
}

pub fn destroy_window_request(server: &mut Server, client: ClientId, window: Xid) -> DixResult<()> {
    let handle = lookup_window(server, client, window, Access::DESTROY)?;
    let is_root = server
        .drawables
        .windows
        .get(handle)
        .is_some_and(Window::is_root);
    if is_root {
        return Ok(());
    }
    free_resource(server, window)
}

pub fn create_pixmap(
    server: &mut Server,
    client: ClientId,
    pid: Xid,
    drawable: DrawableRef,
    width: u16,
    height: u16,
    depth: u8,
) -> DixResult<Handle> {
    if width == 0 || height == 0 {
        return Err(DixError::BadValue(0));
    }
    if !DEPTHS.contains(&depth) {
        return Err(DixError::BadValue(u32::from(depth)));
    }
    let screen = server
        .drawables
        .geometry(drawable)
        .map(|g| g.screen)
        .ok_or(DixError::bad_drawable(pid))?;
    let handle = server.drawables.new_pixmap(screen, width, height, depth);
    if let Err(e) = server.add_resource(client, pid, server.drawables.pixmap_type, handle) {
        server.drawables.pixmaps.remove(handle);
        return Err(e);
    }
    Ok(handle)
}

pub fn free_pixmap(server: &mut Server, client: ClientId, pixmap: Xid) -> DixResult<()> {
    server.lookup(client, pixmap, server.drawables.pixmap_type, Access::DESTROY)?;
    free_resource(server, pixmap)
}

/// Children first, then extension state, then the window itself
fn destroy_window(server: &mut Server, handle: Handle, id: Xid) -> DixResult<()> {
    let children = server
        .drawables
        .windows
        .get(handle)
        .map(|w| w.children.clone())
        .unwrap_or_default();
    for child in children.into_iter().rev() {
        let Some(child_id) = server.drawables.windows.get(child).map(|w| w.id) else {
            continue;
        };
        if server.resources.contains(child_id) {
            free_resource(server, child_id)?;
        }
    }

    crate::dri2::drawable_gone(server, id);
    crate::xf86dri::drawable_gone(server, id);
    crate::composite::window_destroyed(server, handle);
    crate::panoramix::forget(server, id);

    if let Some(window) = server.drawables.windows.remove(handle) {
        if let Some(parent) = window.parent.and_then(|p| server.drawables.windows.get_mut(p)) {
            parent.children.retain(|c| *c != handle);
        }
    }
    Ok(())
}

fn destroy_pixmap(server: &mut Server, handle: Handle, id: Xid) -> DixResult<()> {
    crate::dri2::drawable_gone(server, id);
    crate::panoramix::forget(server, id);
    server.drawables.unref_pixmap(handle);
    Ok(())
}
