//! XVideo-MotionCompensation
//!
//! Hardware decode contexts with surfaces and subpictures chained to them.
//!
//! A context starts with one reference held by its id. Each surface or
//! subpicture adds one and gives it back when destroyed. Freeing the
//! context id drops only the id's reference, so a context with live
//! children stays allocated (unreachable by id) until its last child goes.

mod driver;

pub use driver::{ContextAlloc, SoftwareDriver, SubpictureAlloc, XvmcDriver};

use tracing::{debug, info};
use xdix_proto::{AdaptorInfo, ImageFormat, Reply, Request, XvmcRequest, Xid, XVMC_NAME};

use crate::config::{SurfaceTypeConfig, XvmcConfig};
use crate::dix::error::{BAD_IMPLEMENTATION, BAD_VALUE};
use crate::dix::resource::free_resource;
use crate::dix::{Access, Arena, ClientId, DixError, DixResult, ErrorCode, Handle, ResourceType, Response};
use crate::server::Server;

pub const VERSION: (u32, u32) = (1, 1);

const BAD_CONTEXT: u8 = 0;
const BAD_SURFACE: u8 = 1;
const BAD_SUBPICTURE: u8 = 2;
const NUM_ERRORS: u8 = 3;

#[derive(Debug)]
pub struct Adaptor {
    pub port: Xid,
    pub name: String,
    pub screen: usize,
    pub surfaces: Vec<SurfaceTypeConfig>,
    pub formats: Vec<ImageFormat>,
}

impl Adaptor {
    fn surface(&self, surface_type_id: u32) -> Option<&SurfaceTypeConfig> {
        self.surfaces
            .iter()
            .find(|s| s.surface_type_id == surface_type_id)
    }

    fn format(&self, id: u32) -> Option<&ImageFormat> {
        self.formats.iter().find(|f| f.id == id)
    }
}

#[derive(Debug, Clone)]
pub struct XvmcContext {
    pub id: Xid,
    pub adaptor: usize,
    pub surface_type_id: u32,
    pub width: u16,
    pub height: u16,
    pub flags: u32,
    pub refcnt: u32,
}

#[derive(Debug, Clone)]
pub struct XvmcSurface {
    pub id: Xid,
    /// Back-reference; the context's refcnt counts this surface
    pub context: Handle,
}

#[derive(Debug, Clone)]
pub struct XvmcSubpicture {
    pub id: Xid,
    pub context: Handle,
    pub xvimage_id: u32,
    pub width: u16,
    pub height: u16,
}

pub struct Xvmc {
    driver: Box<dyn XvmcDriver>,
    pub adaptors: Vec<Adaptor>,
    ports: Arena<usize>,
    contexts: Arena<XvmcContext>,
    surfaces: Arena<XvmcSurface>,
    subpictures: Arena<XvmcSubpicture>,
    port_type: ResourceType,
    context_type: ResourceType,
    surface_type: ResourceType,
    subpicture_type: ResourceType,
    client_driver_name: String,
    bus_id: String,
    driver_version: (u32, u32, u32),
}

impl Xvmc {
    pub fn context(&self, handle: Handle) -> Option<&XvmcContext> {
        self.contexts.get(handle)
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }
}

fn ext_error(offset: u8) -> ErrorCode {
    ErrorCode::Extension {
        name: XVMC_NAME,
        offset,
    }
}

pub fn init(server: &mut Server, config: &XvmcConfig, driver: Box<dyn XvmcDriver>) -> DixResult<()> {
    let resources = &mut server.resources;
    let port_type = resources.register_type("XvPort", destroy_port, ErrorCode::Core(BAD_VALUE))?;
    let context_type =
        resources.register_type("XvMCContext", destroy_context, ext_error(BAD_CONTEXT))?;
    let surface_type =
        resources.register_type("XvMCSurface", destroy_surface, ext_error(BAD_SURFACE))?;
    let subpicture_type =
        resources.register_type("XvMCSubpicture", destroy_subpicture, ext_error(BAD_SUBPICTURE))?;

    let mut xvmc = Xvmc {
        driver,
        adaptors: Vec::new(),
        ports: Arena::new(),
        contexts: Arena::new(),
        surfaces: Arena::new(),
        subpictures: Arena::new(),
        port_type,
        context_type,
        surface_type,
        subpicture_type,
        client_driver_name: config.client_driver_name.clone(),
        bus_id: config.bus_id.clone(),
        driver_version: (
            config.driver_major,
            config.driver_minor,
            config.driver_patch_level,
        ),
    };

    for (index, adaptor) in config.adaptors.iter().enumerate() {
        let port = server.clients.server_id();
        let handle = xvmc.ports.insert(index);
        server.resources.add(port, port_type, handle)?;
        info!(
            "XvMC adaptor {:?} on screen {} as port 0x{:08x}",
            adaptor.name, adaptor.screen, port
        );
        xvmc.adaptors.push(Adaptor {
            port,
            name: adaptor.name.clone(),
            screen: adaptor.screen,
            surfaces: adaptor.surfaces.clone(),
            formats: adaptor.formats.clone(),
        });
    }

    server
        .extensions
        .add_extension(XVMC_NAME, 0, NUM_ERRORS, VERSION, dispatch)?;
    server.xvmc = Some(xvmc);
    Ok(())
}

fn xvmc(server: &Server) -> DixResult<&Xvmc> {
    server.xvmc.as_ref().ok_or(DixError::BadRequest)
}

fn xvmc_mut(server: &mut Server) -> DixResult<&mut Xvmc> {
    server.xvmc.as_mut().ok_or(DixError::BadRequest)
}

fn lookup_port(server: &Server, client: ClientId, port: Xid) -> DixResult<usize> {
    let xvmc = xvmc(server)?;
    let handle = server.lookup(client, port, xvmc.port_type, Access::READ)?;
    xvmc.ports
        .get(handle)
        .copied()
        .ok_or(DixError::BadValue(port))
}

fn lookup_context(server: &Server, client: ClientId, id: Xid, access: Access) -> DixResult<Handle> {
    server.lookup(client, id, xvmc(server)?.context_type, access)
}

fn dispatch(server: &mut Server, client: ClientId, request: Request) -> DixResult<Response> {
    let Request::XvMC(req) = request else {
        return Err(DixError::BadRequest);
    };

    // capability probes are open to everyone
    match req {
        XvmcRequest::QueryVersion => {
            let (major, minor) = VERSION;
            return Ok(Response::Reply(Reply::Version { major, minor }));
        }
        XvmcRequest::QueryAdaptors { screen } => return query_adaptors(server, screen),
        XvmcRequest::ListSurfaceTypes { port } => {
            let adaptor = lookup_port(server, client, port)?;
            let surfaces = xvmc(server)?.adaptors[adaptor]
                .surfaces
                .iter()
                .map(SurfaceTypeConfig::info)
                .collect();
            return Ok(Response::Reply(Reply::SurfaceTypes { surfaces }));
        }
        XvmcRequest::ListSubpictureTypes {
            port,
            surface_type_id,
        } => return list_subpicture_types(server, client, port, surface_type_id),
        _ => {}
    }

    if !server.is_local(client) {
        return Err(DixError::NotLocal {
            code: ErrorCode::Core(BAD_IMPLEMENTATION),
        });
    }

    match req {
        XvmcRequest::CreateContext {
            context_id,
            port,
            surface_type_id,
            width,
            height,
            flags,
        } => create_context(
            server,
            client,
            context_id,
            port,
            surface_type_id,
            (width, height),
            flags,
        ),
        XvmcRequest::DestroyContext { context_id } => {
            lookup_context(server, client, context_id, Access::DESTROY)?;
            free_resource(server, context_id)?;
            Ok(Response::None)
        }
        XvmcRequest::CreateSurface {
            surface_id,
            context_id,
        } => create_surface(server, client, surface_id, context_id),
        XvmcRequest::DestroySurface { surface_id } => {
            server.lookup(client, surface_id, xvmc(server)?.surface_type, Access::DESTROY)?;
            free_resource(server, surface_id)?;
            Ok(Response::None)
        }
        XvmcRequest::CreateSubpicture {
            subpicture_id,
            context_id,
            xvimage_id,
            width,
            height,
        } => create_subpicture(
            server,
            client,
            subpicture_id,
            context_id,
            xvimage_id,
            (width, height),
        ),
        XvmcRequest::DestroySubpicture { subpicture_id } => {
            server.lookup(
                client,
                subpicture_id,
                xvmc(server)?.subpicture_type,
                Access::DESTROY,
            )?;
            free_resource(server, subpicture_id)?;
            Ok(Response::None)
        }
        XvmcRequest::GetDRInfo { port, .. } => {
            lookup_port(server, client, port)?;
            let xvmc = xvmc(server)?;
            let (major, minor, patch_level) = xvmc.driver_version;
            Ok(Response::Reply(Reply::DrInfo {
                major,
                minor,
                patch_level,
                client_driver_name: xvmc.client_driver_name.clone(),
                bus_id: xvmc.bus_id.clone(),
                is_local: server.is_local(client),
            }))
        }
        XvmcRequest::QueryVersion
        | XvmcRequest::QueryAdaptors { .. }
        | XvmcRequest::ListSurfaceTypes { .. }
        | XvmcRequest::ListSubpictureTypes { .. } => Err(DixError::BadRequest),
    }
}

fn query_adaptors(server: &Server, screen: u32) -> DixResult<Response> {
    if screen as usize >= server.screens.len() {
        return Err(DixError::BadValue(screen));
    }
    let adaptors = xvmc(server)?
        .adaptors
        .iter()
        .filter(|a| a.screen == screen as usize)
        .map(|a| AdaptorInfo {
            port: a.port,
            name: a.name.clone(),
            num_surfaces: a.surfaces.len() as u32,
        })
        .collect();
    Ok(Response::Reply(Reply::Adaptors { adaptors }))
}

fn list_subpicture_types(
    server: &Server,
    client: ClientId,
    port: Xid,
    surface_type_id: u32,
) -> DixResult<Response> {
    let index = lookup_port(server, client, port)?;
    let adaptor = &xvmc(server)?.adaptors[index];
    let surface = adaptor
        .surface(surface_type_id)
        .ok_or(DixError::BadMatch("surface type not offered by port"))?;
    let formats = surface
        .compatible_subpictures
        .iter()
        .map(|id| {
            adaptor
                .format(*id)
                .cloned()
                .ok_or(DixError::BadImplementation("subpicture format not listed"))
        })
        .collect::<DixResult<Vec<_>>>()?;
    Ok(Response::Reply(Reply::SubpictureTypes { formats }))
}

fn create_context(
    server: &mut Server,
    client: ClientId,
    context_id: Xid,
    port: Xid,
    surface_type_id: u32,
    (width, height): (u16, u16),
    flags: u32,
) -> DixResult<Response> {
    server.check_new_id(client, context_id)?;
    let adaptor = lookup_port(server, client, port)?;
    let xvmc = xvmc_mut(server)?;
    let surface = xvmc.adaptors[adaptor]
        .surface(surface_type_id)
        .ok_or(DixError::BadMatch("surface type not offered by port"))?;
    if width > surface.max_width || height > surface.max_height {
        return Err(DixError::BadValue(u32::from(width.max(height))));
    }

    let mut context = XvmcContext {
        id: context_id,
        adaptor,
        surface_type_id,
        width,
        height,
        flags,
        refcnt: 1,
    };
    let alloc = xvmc.driver.create_context(&context)?;
    context.width = alloc.width;
    context.height = alloc.height;
    context.flags = alloc.flags;
    let handle = xvmc.contexts.insert(context);
    let context_type = xvmc.context_type;

    if let Err(e) = server.add_resource(client, context_id, context_type, handle) {
        let xvmc = xvmc_mut(server)?;
        if let Some(context) = xvmc.contexts.remove(handle) {
            xvmc.driver.destroy_context(&context);
        }
        return Err(e);
    }
    debug!("XvMC context 0x{:08x} created", context_id);

    Ok(Response::Reply(Reply::XvmcContext {
        width_actual: alloc.width,
        height_actual: alloc.height,
        flags_return: alloc.flags,
        priv_data: alloc.priv_data,
    }))
}

fn create_surface(
    server: &mut Server,
    client: ClientId,
    surface_id: Xid,
    context_id: Xid,
) -> DixResult<Response> {
    let context = lookup_context(server, client, context_id, Access::USE)?;
    let xvmc = xvmc_mut(server)?;
    let ctx = xvmc
        .contexts
        .get(context)
        .cloned()
        .ok_or(DixError::BadImplementation("context without storage"))?;
    let surface = XvmcSurface {
        id: surface_id,
        context,
    };
    let priv_data = xvmc.driver.create_surface(&ctx, &surface)?;
    let handle = xvmc.surfaces.insert(surface);
    let surface_type = xvmc.surface_type;

    if let Err(e) = server.add_resource(client, surface_id, surface_type, handle) {
        let xvmc = xvmc_mut(server)?;
        if let Some(surface) = xvmc.surfaces.remove(handle) {
            xvmc.driver.destroy_surface(&surface);
        }
        return Err(e);
    }
    if let Some(ctx) = xvmc_mut(server)?.contexts.get_mut(context) {
        ctx.refcnt += 1;
    }
    Ok(Response::Reply(Reply::XvmcSurface { priv_data }))
}

fn create_subpicture(
    server: &mut Server,
    client: ClientId,
    subpicture_id: Xid,
    context_id: Xid,
    xvimage_id: u32,
    (width, height): (u16, u16),
) -> DixResult<Response> {
    let context = lookup_context(server, client, context_id, Access::USE)?;
    let xvmc = xvmc_mut(server)?;
    let ctx = xvmc
        .contexts
        .get(context)
        .cloned()
        .ok_or(DixError::BadImplementation("context without storage"))?;
    let adaptor = &xvmc.adaptors[ctx.adaptor];
    let surface = adaptor
        .surface(ctx.surface_type_id)
        .ok_or(DixError::BadMatch("context surface type vanished"))?;
    if !surface.compatible_subpictures.contains(&xvimage_id) {
        return Err(DixError::BadMatch("image format not compatible with surface"));
    }
    let format = adaptor
        .format(xvimage_id)
        .cloned()
        .ok_or(DixError::BadMatch("unknown image format"))?;
    if width > surface.subpicture_max_width || height > surface.subpicture_max_height {
        return Err(DixError::BadValue(u32::from(width.max(height))));
    }

    let mut sub = XvmcSubpicture {
        id: subpicture_id,
        context,
        xvimage_id,
        width,
        height,
    };
    let alloc = xvmc.driver.create_subpicture(&ctx, &sub, &format)?;
    sub.width = alloc.width;
    sub.height = alloc.height;
    let handle = xvmc.subpictures.insert(sub);
    let subpicture_type = xvmc.subpicture_type;

    if let Err(e) = server.add_resource(client, subpicture_id, subpicture_type, handle) {
        let xvmc = xvmc_mut(server)?;
        if let Some(sub) = xvmc.subpictures.remove(handle) {
            xvmc.driver.destroy_subpicture(&sub);
        }
        return Err(e);
    }
    if let Some(ctx) = xvmc_mut(server)?.contexts.get_mut(context) {
        ctx.refcnt += 1;
    }
    Ok(Response::Reply(Reply::XvmcSubpicture {
        width_actual: alloc.width,
        height_actual: alloc.height,
        num_palette_entries: alloc.num_palette_entries,
        entry_bytes: alloc.entry_bytes,
        component_order: alloc.component_order,
        priv_data: alloc.priv_data,
    }))
}

/// Drop one context reference, tearing it down with the last
fn release_context(xvmc: &mut Xvmc, handle: Handle) {
    let Some(ctx) = xvmc.contexts.get_mut(handle) else {
        return;
    };
    ctx.refcnt = ctx.refcnt.saturating_sub(1);
    if ctx.refcnt > 0 {
        return;
    }
    if let Some(ctx) = xvmc.contexts.remove(handle) {
        xvmc.driver.destroy_context(&ctx);
        debug!("XvMC context 0x{:08x} freed", ctx.id);
    }
}

fn destroy_context(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    if let Some(xvmc) = server.xvmc.as_mut() {
        release_context(xvmc, handle);
    }
    Ok(())
}

fn destroy_surface(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    let Some(xvmc) = server.xvmc.as_mut() else {
        return Ok(());
    };
    if let Some(surface) = xvmc.surfaces.remove(handle) {
        xvmc.driver.destroy_surface(&surface);
        release_context(xvmc, surface.context);
    }
    Ok(())
}

fn destroy_subpicture(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    let Some(xvmc) = server.xvmc.as_mut() else {
        return Ok(());
    };
    if let Some(sub) = xvmc.subpictures.remove(handle) {
        xvmc.driver.destroy_subpicture(&sub);
        release_context(xvmc, sub.context);
    }
    Ok(())
}

fn destroy_port(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    if let Some(xvmc) = server.xvmc.as_mut() {
        xvmc.ports.remove(handle);
    }
    Ok(())
}
