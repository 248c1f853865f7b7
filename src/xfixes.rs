//! XFIXES Regions
//!
//! Region resources as a flat list of rectangles. Only the operations other
//! extensions and clients need to move regions around are served here;
//! union and intersection are left to whoever consumes the rectangles.

use xdix_proto::{Rect, Reply, Request, XFixesRequest, Xid, XFIXES_NAME};

use crate::dix::extension::query_version;
use crate::dix::resource::{free_resource, Registry};
use crate::dix::{Access, Arena, ClientId, DixError, DixResult, ErrorCode, Handle, ResourceType, Response};
use crate::server::Server;

pub const VERSION: (u32, u32) = (5, 0);

/// BadRegion
const BAD_REGION: u8 = 0;
const NUM_EVENTS: u8 = 2;
const NUM_ERRORS: u8 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Region {
    pub rects: Vec<Rect>,
}

impl Region {
    pub fn new(rects: impl IntoIterator<Item = Rect>) -> Self {
        Self {
            rects: rects
                .into_iter()
                .filter(|r| r.width > 0 && r.height > 0)
                .collect(),
        }
    }

    /// Bounding box; all zero for an empty region
    pub fn extents(&self) -> Rect {
        let Some(first) = self.rects.first() else {
            return Rect::default();
        };
        let (mut x1, mut y1) = (i32::from(first.x), i32::from(first.y));
        let (mut x2, mut y2) = (x1 + i32::from(first.width), y1 + i32::from(first.height));
        for r in &self.rects[1..] {
            x1 = x1.min(i32::from(r.x));
            y1 = y1.min(i32::from(r.y));
            x2 = x2.max(i32::from(r.x) + i32::from(r.width));
            y2 = y2.max(i32::from(r.y) + i32::from(r.height));
        }
        Rect {
            x: x1 as i16,
            y: y1 as i16,
            width: (x2 - x1).min(i32::from(u16::MAX)) as u16,
            height: (y2 - y1).min(i32::from(u16::MAX)) as u16,
        }
    }

    pub fn translate(&mut self, dx: i16, dy: i16) {
        for r in &mut self.rects {
            r.x = r.x.saturating_add(dx);
            r.y = r.y.saturating_add(dy);
        }
    }
}

pub struct XFixes {
    pub regions: Arena<Region>,
    pub region_type: ResourceType,
}

impl XFixes {
    /// Registered before the other extensions so they can name regions
    pub fn new(registry: &mut Registry) -> DixResult<Self> {
        let region_type = registry.register_type("Region", destroy_region, bad_region())?;
        Ok(Self {
            regions: Arena::new(),
            region_type,
        })
    }
}

fn bad_region() -> ErrorCode {
    ErrorCode::Extension {
        name: XFIXES_NAME,
        offset: BAD_REGION,
    }
}

pub fn init(server: &mut Server) -> DixResult<()> {
    server
        .extensions
        .add_extension(XFIXES_NAME, NUM_EVENTS, NUM_ERRORS, VERSION, dispatch)?;
    Ok(())
}

fn lookup(server: &Server, client: ClientId, id: Xid, access: Access) -> DixResult<Handle> {
    server.lookup(client, id, server.xfixes.region_type, access)
}

fn region_mut(server: &mut Server, handle: Handle) -> DixResult<&mut Region> {
    server
        .xfixes
        .regions
        .get_mut(handle)
        .ok_or(DixError::BadImplementation("region without storage"))
}

/// Rectangles of a region, for other extensions
pub fn region_rects(server: &Server, client: ClientId, id: Xid) -> DixResult<Vec<Rect>> {
    let handle = lookup(server, client, id, Access::READ)?;
    Ok(server
        .xfixes
        .regions
        .get(handle)
        .map(|r| r.rects.clone())
        .unwrap_or_default())
}

/// Create a region under a client-chosen id
pub fn create_region(server: &mut Server, client: ClientId, id: Xid, region: Region) -> DixResult<()> {
    let handle = server.xfixes.regions.insert(region);
    if let Err(e) = server.add_resource(client, id, server.xfixes.region_type, handle) {
        server.xfixes.regions.remove(handle);
        return Err(e);
    }
    Ok(())
}

fn dispatch(server: &mut Server, client: ClientId, request: Request) -> DixResult<Response> {
    let Request::XFixes(req) = request else {
        return Err(DixError::BadRequest);
    };
    match req {
        XFixesRequest::QueryVersion { major, minor } => {
            return query_version(server, client, XFIXES_NAME, (major, minor));
        }
        XFixesRequest::CreateRegion { region, rects } => {
            create_region(server, client, region, Region::new(rects))?;
        }
        XFixesRequest::DestroyRegion { region } => {
            lookup(server, client, region, Access::DESTROY)?;
            free_resource(server, region)?;
        }
        XFixesRequest::SetRegion { region, rects } => {
            let handle = lookup(server, client, region, Access::WRITE)?;
            *region_mut(server, handle)? = Region::new(rects);
        }
        XFixesRequest::CopyRegion {
            source,
            destination,
        } => {
            let src = lookup(server, client, source, Access::READ)?;
            let dst = lookup(server, client, destination, Access::WRITE)?;
            let copy = server.xfixes.regions.get(src).cloned().unwrap_or_default();
            *region_mut(server, dst)? = copy;
        }
        XFixesRequest::TranslateRegion { region, dx, dy } => {
            let handle = lookup(server, client, region, Access::WRITE)?;
            region_mut(server, handle)?.translate(dx, dy);
        }
        XFixesRequest::RegionExtents {
            source,
            destination,
        } => {
            let src = lookup(server, client, source, Access::READ)?;
            let dst = lookup(server, client, destination, Access::WRITE)?;
            let extents = server
                .xfixes
                .regions
                .get(src)
                .map(Region::extents)
                .unwrap_or_default();
            *region_mut(server, dst)? = Region::new([extents]);
        }
        XFixesRequest::FetchRegion { region } => {
            let handle = lookup(server, client, region, Access::READ)?;
            let region = server.xfixes.regions.get(handle).cloned().unwrap_or_default();
            return Ok(Response::Reply(Reply::FetchRegion {
                extents: region.extents(),
                rects: region.rects,
            }));
        }
    }
    Ok(Response::None)
}

fn destroy_region(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    server.xfixes.regions.remove(handle);
    Ok(())
}
