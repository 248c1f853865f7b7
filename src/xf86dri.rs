//! XFree86-DRI
//!
//! The pre-DRI2 direct rendering handshake. There is no kernel behind it:
//! connection handles, framebuffer layout and driver identity come from the
//! `[dri]` config section, and hardware context/drawable handles are plain
//! counters. Contexts are registry resources so they die with their client.

use std::collections::HashMap;
use tracing::debug;
use xdix_proto::{split_u64, Rect, Reply, Request, XF86DriRequest, Xid, XF86DRI_NAME};

use crate::config::DriConfig;
use crate::dix::extension::query_version;
use crate::dix::resource::free_resource;
use crate::dix::window::{self, DrawableRef};
use crate::dix::{Access, Arena, ClientId, DixError, DixResult, ErrorCode, Handle, ResourceType, Response};
use crate::server::Server;

pub const VERSION: (u32, u32) = (4, 1);

const CLIENT_NOT_LOCAL: u8 = 0;
const NUM_ERRORS: u8 = 2;

#[derive(Debug)]
struct HwContext {
    screen: usize,
    hw: u32,
}

#[derive(Debug)]
struct HwDrawable {
    hw: u32,
    /// CreateDrawable calls not yet matched by DestroyDrawable
    refs: u32,
    stamp: u32,
}

pub struct Dri {
    config: DriConfig,
    context_type: ResourceType,
    contexts: Arena<HwContext>,
    drawables: HashMap<Xid, HwDrawable>,
    open: Vec<bool>,
    next_hw: u32,
}

impl Dri {
    fn alloc_hw(&mut self) -> u32 {
        self.next_hw = self.next_hw.wrapping_add(1).max(1);
        self.next_hw
    }

    pub fn is_open(&self, screen: usize) -> bool {
        self.open.get(screen).copied().unwrap_or(false)
    }

    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }
}

pub fn init(server: &mut Server, config: &DriConfig) -> DixResult<()> {
    let context_type = server.resources.register_type(
        "DRIContext",
        destroy_context,
        ErrorCode::Core(crate::dix::error::BAD_VALUE),
    )?;
    server
        .extensions
        .add_extension(XF86DRI_NAME, 0, NUM_ERRORS, VERSION, dispatch)?;
    server.dri = Some(Dri {
        config: config.clone(),
        context_type,
        contexts: Arena::new(),
        drawables: HashMap::new(),
        open: vec![false; server.screens.len()],
        next_hw: 0,
    });
    Ok(())
}

fn dri_mut(server: &mut Server) -> DixResult<&mut Dri> {
    server.dri.as_mut().ok_or(DixError::BadRequest)
}

fn check_screen(server: &Server, screen: u32) -> DixResult<usize> {
    let index = screen as usize;
    if index < server.screens.len() {
        Ok(index)
    } else {
        Err(DixError::BadValue(screen))
    }
}

fn dispatch(server: &mut Server, client: ClientId, request: Request) -> DixResult<Response> {
    let Request::XF86Dri(req) = request else {
        return Err(DixError::BadRequest);
    };
    match req {
        XF86DriRequest::QueryVersion => {
            return query_version(server, client, XF86DRI_NAME, VERSION);
        }
        XF86DriRequest::QueryDirectRenderingCapable { screen } => {
            check_screen(server, screen)?;
            return Ok(Response::Reply(Reply::DirectRenderingCapable {
                capable: server.is_local(client),
            }));
        }
        _ => {}
    }
    if !server.is_local(client) {
        return Err(DixError::NotLocal {
            code: ErrorCode::Extension {
                name: XF86DRI_NAME,
                offset: CLIENT_NOT_LOCAL,
            },
        });
    }

    let reply = match req {
        XF86DriRequest::QueryVersion | XF86DriRequest::QueryDirectRenderingCapable { .. } => {
            return Err(DixError::BadRequest);
        }
        XF86DriRequest::OpenConnection { screen } => {
            let index = check_screen(server, screen)?;
            let dri = dri_mut(server)?;
            if let Some(open) = dri.open.get_mut(index) {
                *open = true;
            }
            let (sarea_hi, sarea_lo) = split_u64(dri.config.sarea_handle);
            Reply::DriConnection {
                sarea_hi,
                sarea_lo,
                bus_id: dri.config.bus_id.clone(),
            }
        }
        XF86DriRequest::CloseConnection { screen } => {
            let index = check_screen(server, screen)?;
            if let Some(open) = dri_mut(server)?.open.get_mut(index) {
                *open = false;
            }
            return Ok(Response::None);
        }
        XF86DriRequest::AuthConnection { screen, magic } => {
            check_screen(server, screen)?;
            Reply::Authenticate {
                authenticated: magic != 0,
            }
        }
        XF86DriRequest::GetClientDriverName { screen } => {
            check_screen(server, screen)?;
            let config = &dri_mut(server)?.config;
            Reply::ClientDriverName {
                major: config.driver_major,
                minor: config.driver_minor,
                patch: config.driver_patch,
                name: config.client_driver_name.clone(),
            }
        }
        XF86DriRequest::CreateContext {
            screen,
            visual,
            context,
        } => {
            let index = check_screen(server, screen)?;
            let hw_context = create_context(server, client, index, context)?;
            debug!("DRI context 0x{:08x} for visual 0x{:x}", context, visual);
            Reply::HwContext { hw_context }
        }
        XF86DriRequest::DestroyContext { screen, context } => {
            check_screen(server, screen)?;
            let rtype = dri_mut(server)?.context_type;
            server
                .lookup(client, context, rtype, Access::DESTROY)
                .map_err(|_| DixError::BadValue(context))?;
            free_resource(server, context)?;
            return Ok(Response::None);
        }
        XF86DriRequest::CreateDrawable { screen, drawable } => {
            check_screen(server, screen)?;
            window::lookup_drawable(server, client, drawable, Access::READ)?;
            let dri = dri_mut(server)?;
            let hw_drawable = match dri.drawables.get_mut(&drawable) {
                Some(d) => {
                    d.refs += 1;
                    d.hw
                }
                None => {
                    let hw = dri.alloc_hw();
                    dri.drawables.insert(
                        drawable,
                        HwDrawable {
                            hw,
                            refs: 1,
                            stamp: 1,
                        },
                    );
                    hw
                }
            };
            Reply::HwDrawable { hw_drawable }
        }
        XF86DriRequest::DestroyDrawable { screen, drawable } => {
            check_screen(server, screen)?;
            window::lookup_drawable(server, client, drawable, Access::READ)?;
            let dri = dri_mut(server)?;
            let d = dri
                .drawables
                .get_mut(&drawable)
                .ok_or(DixError::BadValue(drawable))?;
            d.refs = d.refs.saturating_sub(1);
            if d.refs == 0 {
                dri.drawables.remove(&drawable);
            }
            return Ok(Response::None);
        }
        XF86DriRequest::GetDrawableInfo { screen, drawable } => {
            let index = check_screen(server, screen)?;
            drawable_info(server, client, index, drawable)?
        }
        XF86DriRequest::GetDeviceInfo { screen } => {
            check_screen(server, screen)?;
            let config = &dri_mut(server)?.config;
            let (framebuffer_hi, framebuffer_lo) = split_u64(config.framebuffer_handle);
            Reply::DeviceInfo {
                framebuffer_hi,
                framebuffer_lo,
                framebuffer_origin: config.framebuffer_origin,
                framebuffer_size: config.framebuffer_size,
                framebuffer_stride: config.framebuffer_stride,
                dev_private: Vec::new(),
            }
        }
    };
    Ok(Response::Reply(reply))
}

fn create_context(server: &mut Server, client: ClientId, screen: usize, id: Xid) -> DixResult<u32> {
    let dri = dri_mut(server)?;
    let hw = dri.alloc_hw();
    let handle = dri.contexts.insert(HwContext { screen, hw });
    let rtype = dri.context_type;
    if let Err(e) = server.add_resource(client, id, rtype, handle) {
        dri_mut(server)?.contexts.remove(handle);
        return Err(e);
    }
    Ok(hw)
}

fn destroy_context(server: &mut Server, handle: Handle, _id: Xid) -> DixResult<()> {
    if let Some(ctx) = server.dri.as_mut().and_then(|d| d.contexts.remove(handle)) {
        debug!("DRI hardware context {} on screen {} released", ctx.hw, ctx.screen);
    }
    Ok(())
}

fn clamp_to_screen(rect: Rect, width: u16, height: u16) -> Option<Rect> {
    let x1 = i32::from(rect.x).max(0);
    let y1 = i32::from(rect.y).max(0);
    let x2 = (i32::from(rect.x) + i32::from(rect.width)).min(i32::from(width));
    let y2 = (i32::from(rect.y) + i32::from(rect.height)).min(i32::from(height));
    (x2 > x1 && y2 > y1).then(|| Rect {
        x: x1 as i16,
        y: y1 as i16,
        width: (x2 - x1) as u16,
        height: (y2 - y1) as u16,
    })
}

fn drawable_info(server: &mut Server, client: ClientId, screen: usize, id: Xid) -> DixResult<Reply> {
    let drawable = window::lookup_drawable(server, client, id, Access::GET_ATTR)?;
    let geometry = server
        .drawables
        .geometry(drawable)
        .ok_or(DixError::bad_drawable(id))?;
    let viewable = match drawable {
        DrawableRef::Window(h) => server.drawables.is_viewable(h),
        DrawableRef::Pixmap(_) => false,
    };
    let (width, height) = server
        .screens
        .get(screen)
        .map(|s| (s.width, s.height))
        .ok_or(DixError::BadValue(screen as u32))?;

    let dri = dri_mut(server)?;
    let d = dri.drawables.get(&id).ok_or(DixError::BadValue(id))?;
    let x = geometry.x.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    let y = geometry.y.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
    let back_clip_rects: Vec<Rect> = if viewable {
        vec![Rect {
            x,
            y,
            width: geometry.width,
            height: geometry.height,
        }]
    } else {
        Vec::new()
    };
    let clip_rects = back_clip_rects
        .iter()
        .filter_map(|r| clamp_to_screen(*r, width, height))
        .collect();

    Ok(Reply::DrawableInfo {
        index: d.hw,
        stamp: d.stamp,
        x,
        y,
        width: geometry.width,
        height: geometry.height,
        clip_rects,
        back_x: x,
        back_y: y,
        back_clip_rects,
    })
}

/// Forget the hardware drawable of a destroyed window or pixmap
pub fn drawable_gone(server: &mut Server, id: Xid) {
    if let Some(dri) = server.dri.as_mut() {
        if dri.drawables.remove(&id).is_some() {
            debug!("DRI drawable 0x{:08x} dropped with its window", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::testing::{self, FakeClient};

    fn dri(c: &mut FakeClient, server: &mut Server, req: XF86DriRequest) -> Vec<xdix_proto::ServerMessage> {
        c.request(server, Request::XF86Dri(req))
    }

    #[test]
    fn test_remote_clients_only_probe() {
        let (mut server, _) = testing::server();
        let mut remote = testing::connect(&mut server, false);

        let replies = dri(
            &mut remote,
            &mut server,
            XF86DriRequest::QueryDirectRenderingCapable { screen: 0 },
        );
        assert_eq!(
            testing::reply(&replies),
            Some(Reply::DirectRenderingCapable { capable: false })
        );

        let replies = dri(&mut remote, &mut server, XF86DriRequest::OpenConnection { screen: 0 });
        let not_local = server.extensions.get(XF86DRI_NAME).unwrap().first_error;
        assert_eq!(testing::error_code(&replies), Some(not_local));
        assert!(!server.dri.as_ref().unwrap().is_open(0));
    }

    #[test]
    fn test_screen_out_of_range() {
        let (mut server, _) = testing::server();
        let mut c = testing::connect(&mut server, true);
        for req in [
            XF86DriRequest::QueryDirectRenderingCapable { screen: 3 },
            XF86DriRequest::OpenConnection { screen: 1 },
            XF86DriRequest::GetDeviceInfo { screen: 9 },
        ] {
            assert_eq!(testing::error_code(&dri(&mut c, &mut server, req)), Some(2));
        }
    }

    #[test]
    fn test_contexts_die_with_their_client() {
        let (mut server, _) = testing::server();
        let mut c = testing::connect(&mut server, true);
        let context = c.base() | 1;
        let replies = dri(
            &mut c,
            &mut server,
            XF86DriRequest::CreateContext {
                screen: 0,
                visual: 0x21,
                context,
            },
        );
        assert!(matches!(testing::reply(&replies), Some(Reply::HwContext { .. })));
        assert_eq!(server.dri.as_ref().unwrap().live_contexts(), 1);

        server.disconnect(c.id);
        assert_eq!(server.dri.as_ref().unwrap().live_contexts(), 0);
        assert!(!server.resources.contains(context));
    }

    #[test]
    fn test_drawable_info_clamps_front_clip() {
        let (mut server, _) = testing::server();
        let mut c = testing::connect(&mut server, true);
        let window = c.base() | 1;
        c.request(
            &mut server,
            Request::Core(xdix_proto::CoreRequest::CreateWindow {
                wid: window,
                parent: 0,
                screen: 0,
                x: -20,
                y: 400,
                width: 100,
                height: 100,
            }),
        );
        c.map(&mut server, window);

        let info = dri(
            &mut c,
            &mut server,
            XF86DriRequest::GetDrawableInfo { screen: 0, drawable: window },
        );
        // not registered yet
        assert_eq!(testing::error_code(&info), Some(2));

        dri(&mut c, &mut server, XF86DriRequest::CreateDrawable { screen: 0, drawable: window });
        let info = dri(
            &mut c,
            &mut server,
            XF86DriRequest::GetDrawableInfo { screen: 0, drawable: window },
        );
        let Some(Reply::DrawableInfo {
            clip_rects,
            back_clip_rects,
            ..
        }) = testing::reply(&info)
        else {
            panic!("expected drawable info, got {:?}", info);
        };
        assert_eq!(
            clip_rects,
            vec![Rect {
                x: 0,
                y: 400,
                width: 80,
                height: 80
            }]
        );
        assert_eq!(back_clip_rects[0].x, -20);

        // destroying the window drops the hardware drawable
        c.request(
            &mut server,
            Request::Core(xdix_proto::CoreRequest::DestroyWindow { window }),
        );
        assert!(server.dri.as_ref().unwrap().drawables.is_empty());
    }

    #[test]
    fn test_fully_offscreen_window_has_no_front_clip() {
        assert_eq!(
            clamp_to_screen(
                Rect {
                    x: 700,
                    y: 0,
                    width: 10,
                    height: 10
                },
                640,
                480
            ),
            None
        );
    }
}
