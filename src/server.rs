//! Request Loop
//!
//! `Server` owns every piece of mutable state. A single task drives it:
//! each tick first drains backend completions, then runs at most one
//! inbound message to completion. Nothing else mutates the registry.

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xdix_proto::{Event, Request, ScreenInfo, ServerMessage, Xid};

use crate::completion::{Completion, CompletionQueue, CompletionSender};
use crate::composite::{self, Composite};
use crate::config::Config;
use crate::dix::client::{client_index_of, ClientTable, RESOURCE_ID_MASK};
use crate::dix::error::{DixError, DixResult};
use crate::dix::extension::{ExtensionTable, Response};
use crate::dix::resource::{
    free_all_resources, free_client_resources, Access, AccessHook, AllowAll, Registry,
    ResourceType, MAX_RESOURCE_TYPES,
};
use crate::dix::window::{self, Drawables, Screen};
use crate::dix::{ClientId, Handle};
use crate::dri2::{self, Dri2, Dri2Backend};
use crate::listener::Inbound;
use crate::panoramix::PanoramiX;
use crate::xf86dri::{self, Dri};
use crate::xfixes::{self, XFixes};
use crate::xvmc::{self, SoftwareDriver, Xvmc, XvmcDriver};

/// Hardware backends handed to the extensions at startup
#[derive(Default)]
pub struct Backends {
    pub dri2: Option<Box<dyn Dri2Backend>>,
    pub xvmc: Option<Box<dyn XvmcDriver>>,
}

pub struct Server {
    pub clients: ClientTable,
    pub resources: Registry,
    pub access: Box<dyn AccessHook>,
    pub extensions: ExtensionTable,
    pub screens: Vec<Screen>,
    pub drawables: Drawables,
    pub panoramix: Option<PanoramiX>,
    pub xfixes: XFixes,
    pub composite: Option<Composite>,
    pub dri2: Option<Dri2>,
    pub xvmc: Option<Xvmc>,
    pub dri: Option<Dri>,
    max_backlog: usize,
    completions: CompletionQueue,
}

impl Server {
    pub fn new(config: &Config, backends: Backends, completions: CompletionQueue) -> Result<Self> {
        let mut resources = Registry::new(MAX_RESOURCE_TYPES);
        let drawables =
            Drawables::new(&mut resources).context("Failed to register core resource types")?;
        let xfixes = XFixes::new(&mut resources).context("Failed to register region type")?;

        let mut server = Self {
            clients: ClientTable::new(config.server.max_clients),
            resources,
            access: Box::new(AllowAll),
            extensions: ExtensionTable::default(),
            screens: Vec::new(),
            drawables,
            panoramix: None,
            xfixes,
            composite: None,
            dri2: None,
            xvmc: None,
            dri: None,
            max_backlog: config.server.max_backlog,
            completions,
        };

        window::init_screens(&mut server, &config.screens).context("Failed to create screens")?;
        if config.server.xinerama {
            server.panoramix = Some(PanoramiX::new(&server.screens));
            info!("Fan-out enabled across {} screens", server.screens.len());
        }

        xfixes::init(&mut server).context("Failed to initialise XFIXES")?;
        if config.composite.enabled {
            composite::init(&mut server).context("Failed to initialise Composite")?;
        }
        if config.dri2.enabled {
            match backends.dri2 {
                Some(backend) => dri2::init(&mut server, &config.dri2, backend)
                    .context("Failed to initialise DRI2")?,
                None => warn!("DRI2 enabled but no backend available"),
            }
        }
        if config.xvmc.enabled {
            let driver = backends
                .xvmc
                .unwrap_or_else(|| Box::new(SoftwareDriver::default()));
            xvmc::init(&mut server, &config.xvmc, driver).context("Failed to initialise XvMC")?;
        }
        if config.dri.enabled {
            xf86dri::init(&mut server, &config.dri).context("Failed to initialise XFree86-DRI")?;
        }

        Ok(server)
    }

    pub fn completion_sender(&self) -> CompletionSender {
        self.completions.sender()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    pub fn connect(
        &mut self,
        id: ClientId,
        local: bool,
        outbound: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let screens = self.setup_screens();
        match self.clients.connect(id, local, outbound) {
            Ok(client) => {
                client.send(ServerMessage::Setup {
                    resource_id_base: client.resource_base(),
                    resource_id_mask: RESOURCE_ID_MASK,
                    screens,
                });
                info!(
                    "Client {} connected ({})",
                    client.index,
                    if local { "local" } else { "remote" }
                );
            }
            Err(e) => warn!("Refusing connection: {}", e),
        }
    }

    /// Screens as clients see them; fan-out presents one logical screen
    fn setup_screens(&self) -> Vec<ScreenInfo> {
        let physical = self.screens.iter().map(|s| ScreenInfo {
            root: s.root,
            width: s.width,
            height: s.height,
        });
        if self.panoramix.is_none() {
            return physical.collect();
        }
        let width = self.screens.iter().map(|s| u32::from(s.width)).sum::<u32>();
        let height = self.screens.iter().map(|s| s.height).max().unwrap_or(0);
        vec![ScreenInfo {
            root: self.screens.first().map(|s| s.root).unwrap_or(0),
            width: width.min(u32::from(u16::MAX)) as u16,
            height,
        }]
    }

    pub fn disconnect(&mut self, id: ClientId) {
        let Some(index) = self.clients.get(id).map(|c| c.index) else {
            return;
        };
        free_client_resources(self, index);
        dri2::client_gone(self, id);
        self.clients.remove(id);
        info!("Client {} disconnected", index);
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    pub fn handle_request(&mut self, id: ClientId, request: Request) {
        let Some(client) = self.clients.get_mut(id) else {
            debug!("Request from departed client dropped");
            return;
        };
        if client.suspended {
            if client.backlog.len() >= self.max_backlog {
                warn!(
                    "Client {} queued {} requests while suspended, disconnecting",
                    client.index,
                    client.backlog.len()
                );
                self.disconnect(id);
                return;
            }
            client.backlog.push_back(request);
            return;
        }
        client.sequence = client.sequence.wrapping_add(1);
        let sequence = client.sequence;
        let (major, minor) = self.opcodes(&request);

        let result = self.dispatch(id, request);
        self.finish(id, sequence, major, minor, result);
    }

    fn opcodes(&self, request: &Request) -> (u8, u16) {
        match request {
            Request::Core(req) => (req.opcode(), 0),
            other => {
                let major = other
                    .extension_name()
                    .and_then(|name| self.extensions.get(name))
                    .map(|e| e.major_opcode)
                    .unwrap_or(0);
                (major, other.minor_opcode())
            }
        }
    }

    fn dispatch(&mut self, id: ClientId, request: Request) -> DixResult<Response> {
        match request {
            Request::Core(req) => window::dispatch_core(self, id, req),
            other => {
                let dispatch = other
                    .extension_name()
                    .and_then(|name| self.extensions.dispatch_for(name))
                    .ok_or(DixError::BadRequest)?;
                dispatch(self, id, other)
            }
        }
    }

    fn finish(
        &mut self,
        id: ClientId,
        sequence: u16,
        major: u8,
        minor: u16,
        result: DixResult<Response>,
    ) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        match result {
            Ok(Response::Reply(reply)) => client.send_reply(sequence, reply),
            Ok(Response::None) => {}
            Ok(Response::Deferred) => client.suspended = true,
            Err(e) => {
                debug!("Request {}:{} from client {} failed: {}", major, minor, client.index, e);
                client.send(ServerMessage::Error {
                    sequence,
                    code: self.extensions.error_code(e.code()),
                    major_opcode: major,
                    minor_opcode: minor,
                    bad_value: e.bad_value(),
                    message: e.to_string(),
                });
            }
        }
    }

    /// Answer a deferred request and let the client's backlog run
    pub fn resume_client(
        &mut self,
        id: ClientId,
        sequence: u16,
        major: u8,
        minor: u16,
        result: DixResult<xdix_proto::Reply>,
    ) {
        match self.clients.get_mut(id) {
            Some(client) => client.suspended = false,
            None => return,
        }
        self.finish(id, sequence, major, minor, result.map(Response::Reply));

        loop {
            let Some(client) = self.clients.get_mut(id) else { return };
            if client.suspended {
                return;
            }
            let Some(request) = client.backlog.pop_front() else { return };
            self.handle_request(id, request);
        }
    }

    fn malformed(&mut self, id: ClientId, reason: &str) {
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        client.sequence = client.sequence.wrapping_add(1);
        warn!("Malformed request from client {}: {}", client.index, reason);
        let sequence = client.sequence;
        self.finish(id, sequence, 0, 0, Err(DixError::BadRequest));
    }

    // ------------------------------------------------------------------
    // Loop
    // ------------------------------------------------------------------

    pub fn process_completions(&mut self) {
        for completion in self.completions.drain() {
            match completion {
                Completion::SwapComplete {
                    drawable,
                    ust,
                    msc,
                    sbc,
                    kind,
                } => dri2::swap_complete(self, drawable, ust, msc, sbc, kind),
                Completion::Vblank { screen, ust, msc } => dri2::vblank(self, screen, ust, msc),
            }
        }
    }

    pub fn tick(&mut self, inbound: Option<Inbound>) {
        self.process_completions();
        match inbound {
            Some(Inbound::Connected {
                client,
                local,
                outbound,
            }) => self.connect(client, local, outbound),
            Some(Inbound::Request { client, request }) => self.handle_request(client, request),
            Some(Inbound::Malformed { client, reason }) => self.malformed(client, &reason),
            Some(Inbound::Disconnected { client }) => self.disconnect(client),
            None => {}
        }
    }

    pub async fn run(mut self, mut inbound: mpsc::Receiver<Inbound>, mut shutdown: mpsc::Receiver<()>) {
        let waiter = self.completions.waiter();
        info!("Request loop running");
        loop {
            tokio::select! {
                msg = inbound.recv() => match msg {
                    Some(msg) => self.tick(Some(msg)),
                    None => {
                        info!("All listeners closed");
                        break;
                    }
                },
                () = waiter.wait() => self.tick(None),
                _ = shutdown.recv() => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }
        self.shutdown();
    }

    /// Disconnect everyone, then free the server's own resources
    pub fn shutdown(&mut self) {
        for id in self.clients.ids() {
            self.disconnect(id);
        }
        free_all_resources(self);
        info!("Server state torn down");
    }

    // ------------------------------------------------------------------
    // Helpers for request handlers
    // ------------------------------------------------------------------

    pub fn is_local(&self, id: ClientId) -> bool {
        self.clients.get(id).is_some_and(|c| c.local)
    }

    fn check_access(&self, id: ClientId, xid: Xid, rtype: ResourceType, access: Access) -> DixResult<()> {
        let Some(client) = self.clients.get(id) else {
            return Ok(());
        };
        if self
            .access
            .check(client, xid, self.resources.type_name(rtype), access)
        {
            Ok(())
        } else {
            Err(DixError::BadAccess("denied by security policy"))
        }
    }

    pub fn lookup(
        &self,
        id: ClientId,
        xid: Xid,
        rtype: ResourceType,
        access: Access,
    ) -> DixResult<Handle> {
        let handle = self.resources.lookup(xid, rtype)?;
        self.check_access(id, xid, rtype, access)?;
        Ok(handle)
    }

    pub fn lookup_class(
        &self,
        id: ClientId,
        xid: Xid,
        types: &[ResourceType],
        absent: DixError,
        access: Access,
    ) -> DixResult<(ResourceType, Handle)> {
        let (rtype, handle) = self.resources.lookup_class(xid, types, absent)?;
        self.check_access(id, xid, rtype, access)?;
        Ok((rtype, handle))
    }

    /// Whether `xid` is free for the client to create
    pub fn check_new_id(&self, id: ClientId, xid: Xid) -> DixResult<()> {
        // per-screen siblings under fan-out use ids the server picked
        let legal = self.clients.get(id).is_some_and(|c| {
            c.legal_new_id(xid)
                || (client_index_of(xid) == c.index
                    && self.panoramix.as_ref().is_some_and(|p| p.is_sibling(xid)))
        });
        if !legal {
            return Err(DixError::BadIdChoice(xid));
        }
        if self.resources.contains(xid) {
            return Err(DixError::IdInUse(xid));
        }
        Ok(())
    }

    /// Register a client-chosen id
    pub fn add_resource(
        &mut self,
        id: ClientId,
        xid: Xid,
        rtype: ResourceType,
        value: Handle,
    ) -> DixResult<()> {
        self.check_new_id(id, xid)?;
        self.resources.add(xid, rtype, value)
    }

    /// Register a server-chosen id owned by the client
    pub fn add_fake_resource(
        &mut self,
        id: ClientId,
        rtype: ResourceType,
        value: Handle,
    ) -> DixResult<Xid> {
        let xid = self
            .clients
            .get_mut(id)
            .map(|c| c.fake_id())
            .ok_or(DixError::BadAlloc("client gone"))?;
        self.resources.add(xid, rtype, value)?;
        Ok(xid)
    }

    pub fn send_event(&self, id: ClientId, extension: &str, offset: u8, event: Event) {
        if let Some(client) = self.clients.get(id) {
            client.send_event(self.extensions.event_code(extension, offset), event);
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Mock backends and in-process fake clients

    use super::*;
    use crate::completion::SwapKind;
    use crate::config::{AdaptorConfig, ScreenConfig, SurfaceTypeConfig};
    use crate::dri2::SwapRequest;
    use crate::xvmc::{ContextAlloc, SubpictureAlloc, XvmcContext, XvmcSubpicture, XvmcSurface};
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio::sync::mpsc::error::TryRecvError;
    use xdix_proto::{BufferInfo, CoreRequest, ImageFormat, Rect, Reply};

    pub const SURFACE_TYPE: u32 = 0x3231_5659;

    // ------------------------------------------------------------------
    // DRI2
    // ------------------------------------------------------------------

    #[derive(Debug, Default)]
    pub struct MockDri2State {
        pub scheduled: Vec<SwapRequest>,
        pub cancelled: Vec<Xid>,
        pub fail_swaps: bool,
        pub fail_alloc: bool,
        pub ust: u64,
        pub msc: u64,
        pub next_name: u32,
        pub live_buffers: usize,
        pub copies: usize,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockDri2 {
        pub state: Arc<Mutex<MockDri2State>>,
    }

    impl MockDri2 {
        pub fn lock(&self) -> MutexGuard<'_, MockDri2State> {
            self.state.lock().unwrap()
        }

        pub fn set_msc(&self, ust: u64, msc: u64) {
            let mut state = self.lock();
            state.ust = ust;
            state.msc = msc;
        }
    }

    impl Dri2Backend for MockDri2 {
        fn authenticate(&mut self, _screen: usize, magic: u32) -> bool {
            magic != 0
        }

        fn create_buffer(
            &mut self,
            _screen: usize,
            attachment: u32,
            _format: u32,
            width: u16,
            _height: u16,
        ) -> DixResult<BufferInfo> {
            let mut state = self.lock();
            if state.fail_alloc {
                return Err(DixError::BadAlloc("mock buffer"));
            }
            state.next_name += 1;
            state.live_buffers += 1;
            Ok(BufferInfo {
                attachment,
                name: state.next_name,
                pitch: u32::from(width) * 4,
                cpp: 4,
                flags: 0,
            })
        }

        fn destroy_buffer(&mut self, _buffer: &BufferInfo) {
            let mut state = self.lock();
            state.live_buffers = state.live_buffers.saturating_sub(1);
        }

        fn copy_region(&mut self, _drawable: Xid, _rects: &[Rect], _dest: u32, _src: u32) -> DixResult<()> {
            self.lock().copies += 1;
            Ok(())
        }

        fn schedule_swap(&mut self, swap: SwapRequest) -> DixResult<u64> {
            let mut state = self.lock();
            if state.fail_swaps {
                return Err(DixError::bad_drawable(swap.drawable));
            }
            let target = swap.target_msc;
            state.scheduled.push(swap);
            Ok(target)
        }

        fn cancel_swaps(&mut self, drawable: Xid) {
            let mut state = self.lock();
            state.cancelled.push(drawable);
            state.scheduled.retain(|s| s.drawable != drawable);
        }

        fn msc(&self, _screen: usize) -> (u64, u64) {
            let state = self.lock();
            (state.ust, state.msc)
        }

        fn buffer_age(&self) -> bool {
            true
        }

        fn get_param(&self, param: u32) -> Option<u64> {
            (param == 0x0200_0001).then_some(42)
        }
    }

    // ------------------------------------------------------------------
    // XvMC
    // ------------------------------------------------------------------

    #[derive(Debug, Default)]
    pub struct MockXvmcState {
        pub contexts: usize,
        pub surfaces: usize,
        pub subpictures: usize,
        /// Every context the driver was asked for, including torn-down ones
        pub contexts_created: usize,
        pub fail_next: bool,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MockXvmc {
        pub state: Arc<Mutex<MockXvmcState>>,
    }

    impl MockXvmc {
        pub fn lock(&self) -> MutexGuard<'_, MockXvmcState> {
            self.state.lock().unwrap()
        }

        fn take_failure(&self) -> DixResult<()> {
            let mut state = self.lock();
            if std::mem::take(&mut state.fail_next) {
                return Err(DixError::BadAlloc("mock driver"));
            }
            Ok(())
        }
    }

    impl XvmcDriver for MockXvmc {
        fn create_context(&mut self, ctx: &XvmcContext) -> DixResult<ContextAlloc> {
            self.take_failure()?;
            let mut state = self.lock();
            state.contexts += 1;
            state.contexts_created += 1;
            drop(state);
            Ok(ContextAlloc {
                width: ctx.width,
                height: ctx.height,
                flags: ctx.flags,
                priv_data: vec![0xc0de],
            })
        }

        fn destroy_context(&mut self, _ctx: &XvmcContext) {
            self.lock().contexts -= 1;
        }

        fn create_surface(&mut self, _ctx: &XvmcContext, _surface: &XvmcSurface) -> DixResult<Vec<u32>> {
            self.take_failure()?;
            self.lock().surfaces += 1;
            Ok(Vec::new())
        }

        fn destroy_surface(&mut self, _surface: &XvmcSurface) {
            self.lock().surfaces -= 1;
        }

        fn create_subpicture(
            &mut self,
            _ctx: &XvmcContext,
            sub: &XvmcSubpicture,
            format: &ImageFormat,
        ) -> DixResult<SubpictureAlloc> {
            self.take_failure()?;
            self.lock().subpictures += 1;
            Ok(SubpictureAlloc {
                width: sub.width,
                height: sub.height,
                num_palette_entries: format.palette_entries,
                entry_bytes: 3,
                component_order: *b"YUV\0",
                priv_data: Vec::new(),
            })
        }

        fn destroy_subpicture(&mut self, _sub: &XvmcSubpicture) {
            self.lock().subpictures -= 1;
        }
    }

    // ------------------------------------------------------------------
    // Servers and clients
    // ------------------------------------------------------------------

    pub struct Mocks {
        pub dri2: MockDri2,
        pub xvmc: MockXvmc,
    }

    /// One 640x480 screen, XvMC limited to 64x64 surfaces
    pub fn config() -> Config {
        let mut config = Config::default_with_screen();
        config.screens = vec![ScreenConfig {
            width: 640,
            height: 480,
            refresh_hz: 60,
        }];
        config.dri.enabled = true;
        config.xvmc.adaptors = vec![AdaptorConfig {
            surfaces: vec![SurfaceTypeConfig {
                surface_type_id: SURFACE_TYPE,
                max_width: 64,
                max_height: 64,
                subpicture_max_width: 32,
                subpicture_max_height: 32,
                ..SurfaceTypeConfig::default()
            }],
            ..AdaptorConfig::default()
        }];
        config
    }

    pub fn server() -> (Server, Mocks) {
        server_with(config())
    }

    pub fn server_with(config: Config) -> (Server, Mocks) {
        let mocks = Mocks {
            dri2: MockDri2::default(),
            xvmc: MockXvmc::default(),
        };
        let backends = Backends {
            dri2: Some(Box::new(mocks.dri2.clone())),
            xvmc: Some(Box::new(mocks.xvmc.clone())),
        };
        let server = Server::new(&config, backends, CompletionQueue::new()).unwrap();
        (server, mocks)
    }

    /// Two side-by-side screens with fan-out enabled
    pub fn xinerama_server() -> (Server, Mocks) {
        let mut config = config();
        config.screens.push(ScreenConfig {
            width: 640,
            height: 480,
            refresh_hz: 60,
        });
        config.server.xinerama = true;
        server_with(config)
    }

    pub struct FakeClient {
        pub id: ClientId,
        base: Xid,
        rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    pub fn connect(server: &mut Server, local: bool) -> FakeClient {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ClientId::next();
        server.connect(id, local, tx);
        let base = match rx.try_recv() {
            Ok(ServerMessage::Setup {
                resource_id_base, ..
            }) => resource_id_base,
            other => panic!("expected setup, got {:?}", other),
        };
        FakeClient { id, base, rx }
    }

    impl FakeClient {
        pub fn base(&self) -> Xid {
            self.base
        }

        pub fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            loop {
                match self.rx.try_recv() {
                    Ok(msg) => out.push(msg),
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            out
        }

        pub fn request(&mut self, server: &mut Server, request: Request) -> Vec<ServerMessage> {
            server.handle_request(self.id, request);
            self.drain()
        }

        /// Create a 100x100 window at (10, 10); parent 0 is the root
        pub fn create_window(&mut self, server: &mut Server, wid: Xid, parent: Xid) {
            let replies = self.request(
                server,
                Request::Core(CoreRequest::CreateWindow {
                    wid,
                    parent,
                    screen: 0,
                    x: 10,
                    y: 10,
                    width: 100,
                    height: 100,
                }),
            );
            assert_eq!(error_code(&replies), None, "{:?}", replies);
        }

        pub fn map(&mut self, server: &mut Server, window: Xid) {
            let replies = self.request(server, Request::Core(CoreRequest::MapWindow { window }));
            assert_eq!(error_code(&replies), None, "{:?}", replies);
        }
    }

    pub fn error_code(msgs: &[ServerMessage]) -> Option<u8> {
        msgs.iter().find_map(|m| match m {
            ServerMessage::Error { code, .. } => Some(*code),
            _ => None,
        })
    }

    pub fn reply(msgs: &[ServerMessage]) -> Option<Reply> {
        msgs.iter().find_map(|m| match m {
            ServerMessage::Reply { reply, .. } => Some(reply.clone()),
            _ => None,
        })
    }

    pub fn events(msgs: &[ServerMessage]) -> Vec<Event> {
        msgs.iter()
            .filter_map(|m| match m {
                ServerMessage::Event { event, .. } => Some(event.clone()),
                _ => None,
            })
            .collect()
    }

    /// Feed a swap completion through the hand-off queue
    pub fn complete_swap(server: &mut Server, drawable: Xid, sbc: u64, ust: u64, msc: u64) {
        server.completion_sender().push(Completion::SwapComplete {
            drawable,
            ust,
            msc,
            sbc,
            kind: SwapKind::Exchange,
        });
        server.tick(None);
    }

    pub fn vblank(server: &mut Server, screen: usize, ust: u64, msc: u64) {
        server
            .completion_sender()
            .push(Completion::Vblank { screen, ust, msc });
        server.tick(None);
    }
}
