//! xdix Wire Protocol
//!
//! Message types exchanged between the `xdix` server and its clients.
//! Requests are grouped per extension and carry the same fields as their X
//! counterparts; 64-bit counters travel as (hi, lo) halves like on the X wire.

use serde::{Deserialize, Serialize};

/// Resource identifier
pub type Xid = u32;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

pub const DRI2_NAME: &str = "DRI2";
pub const XVMC_NAME: &str = "XVideo-MotionCompensation";
pub const COMPOSITE_NAME: &str = "Composite";
pub const XFIXES_NAME: &str = "XFIXES";
pub const XF86DRI_NAME: &str = "XFree86-DRI";

/// Socket path for local connections
pub fn socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));
    std::path::PathBuf::from(runtime_dir).join("xdix.sock")
}

/// Split a 64-bit counter into (hi, lo) halves
pub fn split_u64(value: u64) -> (u32, u32) {
    ((value >> 32) as u32, value as u32)
}

/// Rebuild a 64-bit counter from its (hi, lo) halves
pub fn join_u64(hi: u32, lo: u32) -> u64 {
    (u64::from(hi) << 32) | u64::from(lo)
}

/// Rectangle in X coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i16,
    pub y: i16,
    pub width: u16,
    pub height: u16,
}

// ============================================================================
// Client → Server Requests
// ============================================================================

/// A request, tagged with the extension that serves it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "ext", content = "req")]
pub enum Request {
    Core(CoreRequest),
    #[serde(rename = "DRI2")]
    Dri2(Dri2Request),
    #[serde(rename = "XVideo-MotionCompensation")]
    XvMC(XvmcRequest),
    Composite(CompositeRequest),
    #[serde(rename = "XFIXES")]
    XFixes(XFixesRequest),
    #[serde(rename = "XFree86-DRI")]
    XF86Dri(XF86DriRequest),
}

impl Request {
    /// Extension serving this request, `None` for core requests
    pub fn extension_name(&self) -> Option<&'static str> {
        match self {
            Request::Core(_) => None,
            Request::Dri2(_) => Some(DRI2_NAME),
            Request::XvMC(_) => Some(XVMC_NAME),
            Request::Composite(_) => Some(COMPOSITE_NAME),
            Request::XFixes(_) => Some(XFIXES_NAME),
            Request::XF86Dri(_) => Some(XF86DRI_NAME),
        }
    }

    /// Minor opcode as numbered by the X extension
    pub fn minor_opcode(&self) -> u16 {
        match self {
            Request::Core(r) => r.opcode() as u16,
            Request::Dri2(r) => r.minor_opcode(),
            Request::XvMC(r) => r.minor_opcode(),
            Request::Composite(r) => r.minor_opcode(),
            Request::XFixes(r) => r.minor_opcode(),
            Request::XF86Dri(r) => r.minor_opcode(),
        }
    }
}

/// Core protocol subset needed to create drawables
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum CoreRequest {
    QueryExtension { name: String },
    /// `parent == 0` creates a top-level window on `screen`
    CreateWindow {
        wid: Xid,
        parent: Xid,
        #[serde(default)]
        screen: u32,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
    },
    MapWindow { window: Xid },
    UnmapWindow { window: Xid },
    DestroyWindow { window: Xid },
    CreatePixmap {
        pid: Xid,
        drawable: Xid,
        width: u16,
        height: u16,
        depth: u8,
    },
    FreePixmap { pixmap: Xid },
}

impl CoreRequest {
    pub fn opcode(&self) -> u8 {
        match self {
            CoreRequest::CreateWindow { .. } => 1,
            CoreRequest::DestroyWindow { .. } => 4,
            CoreRequest::MapWindow { .. } => 8,
            CoreRequest::UnmapWindow { .. } => 10,
            CoreRequest::CreatePixmap { .. } => 53,
            CoreRequest::FreePixmap { .. } => 54,
            CoreRequest::QueryExtension { .. } => 98,
        }
    }
}

/// Attachment/format pair for `GetBuffersWithFormat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentFormat {
    pub attachment: u32,
    pub format: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum Dri2Request {
    QueryVersion { major: u32, minor: u32 },
    Connect { window: Xid, driver_type: u32 },
    Authenticate { window: Xid, magic: u32 },
    CreateDrawable { drawable: Xid },
    DestroyDrawable { drawable: Xid },
    GetBuffers { drawable: Xid, attachments: Vec<u32> },
    CopyRegion { drawable: Xid, region: Xid, dest: u32, src: u32 },
    GetBuffersWithFormat { drawable: Xid, attachments: Vec<AttachmentFormat> },
    SwapBuffers {
        drawable: Xid,
        target_msc_hi: u32,
        target_msc_lo: u32,
        divisor_hi: u32,
        divisor_lo: u32,
        remainder_hi: u32,
        remainder_lo: u32,
    },
    GetMSC { drawable: Xid },
    WaitMSC {
        drawable: Xid,
        target_msc_hi: u32,
        target_msc_lo: u32,
        divisor_hi: u32,
        divisor_lo: u32,
        remainder_hi: u32,
        remainder_lo: u32,
    },
    WaitSBC { drawable: Xid, target_sbc_hi: u32, target_sbc_lo: u32 },
    SwapInterval { drawable: Xid, interval: u32 },
    GetParam { drawable: Xid, param: u32 },
}

impl Dri2Request {
    pub fn minor_opcode(&self) -> u16 {
        match self {
            Dri2Request::QueryVersion { .. } => 0,
            Dri2Request::Connect { .. } => 1,
            Dri2Request::Authenticate { .. } => 2,
            Dri2Request::CreateDrawable { .. } => 3,
            Dri2Request::DestroyDrawable { .. } => 4,
            Dri2Request::GetBuffers { .. } => 5,
            Dri2Request::CopyRegion { .. } => 6,
            Dri2Request::GetBuffersWithFormat { .. } => 7,
            Dri2Request::SwapBuffers { .. } => 8,
            Dri2Request::GetMSC { .. } => 9,
            Dri2Request::WaitMSC { .. } => 10,
            Dri2Request::WaitSBC { .. } => 11,
            Dri2Request::SwapInterval { .. } => 12,
            Dri2Request::GetParam { .. } => 13,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum XvmcRequest {
    QueryVersion,
    ListSurfaceTypes { port: Xid },
    CreateContext {
        context_id: Xid,
        port: Xid,
        surface_type_id: u32,
        width: u16,
        height: u16,
        flags: u32,
    },
    DestroyContext { context_id: Xid },
    CreateSurface { surface_id: Xid, context_id: Xid },
    DestroySurface { surface_id: Xid },
    CreateSubpicture {
        subpicture_id: Xid,
        context_id: Xid,
        xvimage_id: u32,
        width: u16,
        height: u16,
    },
    DestroySubpicture { subpicture_id: Xid },
    ListSubpictureTypes { port: Xid, surface_type_id: u32 },
    GetDRInfo { port: Xid, shm_key: u32, magic: u32 },
    /// Port discovery, normally served by the Xv extension
    QueryAdaptors { screen: u32 },
}

impl XvmcRequest {
    pub fn minor_opcode(&self) -> u16 {
        match self {
            XvmcRequest::QueryVersion => 0,
            XvmcRequest::ListSurfaceTypes { .. } => 1,
            XvmcRequest::CreateContext { .. } => 2,
            XvmcRequest::DestroyContext { .. } => 3,
            XvmcRequest::CreateSurface { .. } => 4,
            XvmcRequest::DestroySurface { .. } => 5,
            XvmcRequest::CreateSubpicture { .. } => 6,
            XvmcRequest::DestroySubpicture { .. } => 7,
            XvmcRequest::ListSubpictureTypes { .. } => 8,
            XvmcRequest::GetDRInfo { .. } => 9,
            XvmcRequest::QueryAdaptors { .. } => 10,
        }
    }
}

/// Composite redirection update mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Update {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum CompositeRequest {
    QueryVersion { major: u32, minor: u32 },
    RedirectWindow { window: Xid, update: Update },
    RedirectSubwindows { window: Xid, update: Update },
    UnredirectWindow { window: Xid, update: Update },
    UnredirectSubwindows { window: Xid, update: Update },
    CreateRegionFromBorderClip { region: Xid, window: Xid },
    NameWindowPixmap { window: Xid, pixmap: Xid },
    GetOverlayWindow { window: Xid },
    ReleaseOverlayWindow { window: Xid },
}

impl CompositeRequest {
    pub fn minor_opcode(&self) -> u16 {
        match self {
            CompositeRequest::QueryVersion { .. } => 0,
            CompositeRequest::RedirectWindow { .. } => 1,
            CompositeRequest::RedirectSubwindows { .. } => 2,
            CompositeRequest::UnredirectWindow { .. } => 3,
            CompositeRequest::UnredirectSubwindows { .. } => 4,
            CompositeRequest::CreateRegionFromBorderClip { .. } => 5,
            CompositeRequest::NameWindowPixmap { .. } => 6,
            CompositeRequest::GetOverlayWindow { .. } => 7,
            CompositeRequest::ReleaseOverlayWindow { .. } => 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum XFixesRequest {
    QueryVersion { major: u32, minor: u32 },
    CreateRegion { region: Xid, rects: Vec<Rect> },
    DestroyRegion { region: Xid },
    SetRegion { region: Xid, rects: Vec<Rect> },
    CopyRegion { source: Xid, destination: Xid },
    TranslateRegion { region: Xid, dx: i16, dy: i16 },
    RegionExtents { source: Xid, destination: Xid },
    FetchRegion { region: Xid },
}

impl XFixesRequest {
    pub fn minor_opcode(&self) -> u16 {
        match self {
            XFixesRequest::QueryVersion { .. } => 0,
            XFixesRequest::CreateRegion { .. } => 5,
            XFixesRequest::DestroyRegion { .. } => 10,
            XFixesRequest::SetRegion { .. } => 11,
            XFixesRequest::CopyRegion { .. } => 12,
            XFixesRequest::TranslateRegion { .. } => 17,
            XFixesRequest::RegionExtents { .. } => 18,
            XFixesRequest::FetchRegion { .. } => 19,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum XF86DriRequest {
    QueryVersion,
    QueryDirectRenderingCapable { screen: u32 },
    OpenConnection { screen: u32 },
    CloseConnection { screen: u32 },
    GetClientDriverName { screen: u32 },
    CreateContext { screen: u32, visual: u32, context: Xid },
    DestroyContext { screen: u32, context: Xid },
    CreateDrawable { screen: u32, drawable: Xid },
    DestroyDrawable { screen: u32, drawable: Xid },
    GetDrawableInfo { screen: u32, drawable: Xid },
    GetDeviceInfo { screen: u32 },
    AuthConnection { screen: u32, magic: u32 },
}

impl XF86DriRequest {
    pub fn minor_opcode(&self) -> u16 {
        match self {
            XF86DriRequest::QueryVersion => 0,
            XF86DriRequest::QueryDirectRenderingCapable { .. } => 1,
            XF86DriRequest::OpenConnection { .. } => 2,
            XF86DriRequest::CloseConnection { .. } => 3,
            XF86DriRequest::GetClientDriverName { .. } => 4,
            XF86DriRequest::CreateContext { .. } => 5,
            XF86DriRequest::DestroyContext { .. } => 6,
            XF86DriRequest::CreateDrawable { .. } => 7,
            XF86DriRequest::DestroyDrawable { .. } => 8,
            XF86DriRequest::GetDrawableInfo { .. } => 9,
            XF86DriRequest::GetDeviceInfo { .. } => 10,
            XF86DriRequest::AuthConnection { .. } => 11,
        }
    }
}

// ============================================================================
// Server → Client Replies and Events
// ============================================================================

/// Buffer descriptor returned by `GetBuffers`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferInfo {
    pub attachment: u32,
    pub name: u32,
    pub pitch: u32,
    pub cpp: u32,
    pub flags: u32,
}

/// XvMC surface type description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SurfaceInfo {
    pub surface_type_id: u32,
    pub chroma_format: u16,
    pub max_width: u16,
    pub max_height: u16,
    pub subpicture_max_width: u16,
    pub subpicture_max_height: u16,
    pub mc_type: u32,
    pub flags: u32,
}

/// Xv image format usable as an XvMC subpicture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFormat {
    pub id: u32,
    /// "rgb" or "yuv"
    pub kind: String,
    pub bits_per_pixel: u8,
    pub num_planes: u8,
    pub depth: u8,
    pub red_mask: u32,
    pub green_mask: u32,
    pub blue_mask: u32,
    pub packed: bool,
    /// Palette size for indexed formats, zero otherwise
    #[serde(default)]
    pub palette_entries: u16,
    #[serde(default)]
    pub component_order: String,
}

/// XvMC-capable port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdaptorInfo {
    pub port: Xid,
    pub name: String,
    pub num_surfaces: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenInfo {
    pub root: Xid,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    QueryExtension {
        present: bool,
        major_opcode: u8,
        first_event: u8,
        first_error: u8,
    },
    Version { major: u32, minor: u32 },
    Dri2Connect { driver_name: String, device_name: String },
    Authenticate { authenticated: bool },
    Buffers { width: u32, height: u32, buffers: Vec<BufferInfo> },
    CopyRegion,
    SwapBuffers { swap_hi: u32, swap_lo: u32 },
    Msc {
        ust_hi: u32,
        ust_lo: u32,
        msc_hi: u32,
        msc_lo: u32,
        sbc_hi: u32,
        sbc_lo: u32,
    },
    Param { recognized: bool, value_hi: u32, value_lo: u32 },
    SurfaceTypes { surfaces: Vec<SurfaceInfo> },
    XvmcContext {
        width_actual: u16,
        height_actual: u16,
        flags_return: u32,
        priv_data: Vec<u32>,
    },
    XvmcSurface { priv_data: Vec<u32> },
    XvmcSubpicture {
        width_actual: u16,
        height_actual: u16,
        num_palette_entries: u16,
        entry_bytes: u16,
        component_order: [u8; 4],
        priv_data: Vec<u32>,
    },
    SubpictureTypes { formats: Vec<ImageFormat> },
    DrInfo {
        major: u32,
        minor: u32,
        patch_level: u32,
        client_driver_name: String,
        bus_id: String,
        is_local: bool,
    },
    Adaptors { adaptors: Vec<AdaptorInfo> },
    OverlayWindow { overlay_win: Xid },
    FetchRegion { extents: Rect, rects: Vec<Rect> },
    DirectRenderingCapable { capable: bool },
    DriConnection { sarea_hi: u32, sarea_lo: u32, bus_id: String },
    ClientDriverName {
        major: u32,
        minor: u32,
        patch: u32,
        name: String,
    },
    HwContext { hw_context: u32 },
    HwDrawable { hw_drawable: u32 },
    DrawableInfo {
        index: u32,
        stamp: u32,
        x: i16,
        y: i16,
        width: u16,
        height: u16,
        clip_rects: Vec<Rect>,
        back_x: i16,
        back_y: i16,
        back_clip_rects: Vec<Rect>,
    },
    DeviceInfo {
        framebuffer_hi: u32,
        framebuffer_lo: u32,
        framebuffer_origin: u32,
        framebuffer_size: u32,
        framebuffer_stride: u32,
        dev_private: Vec<u8>,
    },
}

/// Asynchronous notifications
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// The drawable's buffer set changed, re-fetch before rendering
    InvalidateBuffers { drawable: Xid },
    BufferSwapComplete {
        event_type: u16,
        drawable: Xid,
        ust_hi: u32,
        ust_lo: u32,
        msc_hi: u32,
        msc_lo: u32,
        sbc_hi: u32,
        sbc_lo: u32,
    },
}

/// Everything the server writes to a connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ServerMessage {
    /// First message on every connection
    Setup {
        resource_id_base: u32,
        resource_id_mask: u32,
        screens: Vec<ScreenInfo>,
    },
    Reply { sequence: u16, reply: Reply },
    Error {
        sequence: u16,
        code: u8,
        major_opcode: u8,
        minor_opcode: u16,
        bad_value: u32,
        message: String,
    },
    Event { code: u8, event: Event },
}

// ============================================================================
// Message Framing
// ============================================================================

/// A framed message with length prefix for reliable socket reads
#[derive(Debug)]
pub struct FramedMessage {
    pub data: Vec<u8>,
}

impl FramedMessage {
    /// Create a new framed message from serializable data
    pub fn new<T: Serialize>(msg: &T) -> anyhow::Result<Self> {
        let data = serde_json::to_vec(msg)?;
        Ok(Self { data })
    }

    /// Encode message with length prefix (4 bytes, big-endian)
    pub fn encode(&self) -> Vec<u8> {
        let len = self.data.len() as u32;
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    /// Decode a client request from bytes
    pub fn decode_request(data: &[u8]) -> anyhow::Result<Request> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Decode a server message from bytes
    pub fn decode_server_message(data: &[u8]) -> anyhow::Result<ServerMessage> {
        Ok(serde_json::from_slice(data)?)
    }
}
