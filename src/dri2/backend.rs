//! DRI2 Backends
//!
//! `Dri2Backend` is what the swap pipeline needs from a display driver.
//! `VirtualCrtc` is a software implementation: a tokio task per screen
//! advances the MSC at the configured refresh rate, completes due swaps
//! and reports vblanks through the completion queue.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use xdix_proto::{BufferInfo, Rect, Xid};

use super::scheduler::next_msc;
use crate::completion::{Completion, CompletionSender, SwapKind};
use crate::config::ScreenConfig;
use crate::dix::{DixError, DixResult};

/// Swap as handed to the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapRequest {
    pub drawable: Xid,
    pub screen: usize,
    pub target_msc: u64,
    pub divisor: u64,
    pub remainder: u64,
    pub sbc: u64,
}

pub trait Dri2Backend: Send {
    fn authenticate(&mut self, screen: usize, magic: u32) -> bool;

    fn create_buffer(
        &mut self,
        screen: usize,
        attachment: u32,
        format: u32,
        width: u16,
        height: u16,
    ) -> DixResult<BufferInfo>;

    fn destroy_buffer(&mut self, buffer: &BufferInfo);

    fn copy_region(&mut self, drawable: Xid, rects: &[Rect], dest: u32, src: u32) -> DixResult<()>;

    /// Queue a swap; returns the MSC it will complete at
    ///
    /// Completion is reported later as `Completion::SwapComplete`.
    fn schedule_swap(&mut self, swap: SwapRequest) -> DixResult<u64>;

    /// Forget queued swaps for a drawable that is going away
    fn cancel_swaps(&mut self, drawable: Xid);

    /// Current (ust, msc) of a screen
    fn msc(&self, screen: usize) -> (u64, u64);

    fn buffer_age(&self) -> bool;

    /// Driver-specific parameters
    fn get_param(&self, param: u32) -> Option<u64>;
}

#[derive(Debug, Default)]
struct Crtc {
    ust: u64,
    msc: u64,
    queued: Vec<(SwapRequest, u64)>,
}

#[derive(Debug)]
struct CrtcState {
    crtcs: Vec<Crtc>,
    next_name: u32,
}

/// Software CRTC driven by timers
#[derive(Clone)]
pub struct VirtualCrtc {
    state: Arc<Mutex<CrtcState>>,
    refresh: Vec<u32>,
    sender: CompletionSender,
    epoch: Instant,
}

impl VirtualCrtc {
    pub fn new(screens: &[ScreenConfig], sender: CompletionSender) -> Self {
        Self {
            state: Arc::new(Mutex::new(CrtcState {
                crtcs: screens.iter().map(|_| Crtc::default()).collect(),
                next_name: 0,
            })),
            refresh: screens.iter().map(|s| s.refresh_hz.max(1)).collect(),
            sender,
            epoch: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CrtcState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start one vblank task per screen
    pub fn spawn(&self) -> Vec<JoinHandle<()>> {
        (0..self.refresh.len())
            .map(|screen| {
                let crtc = self.clone();
                let period = Duration::from_secs_f64(1.0 / f64::from(self.refresh[screen]));
                tokio::spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                    loop {
                        interval.tick().await;
                        crtc.vblank(screen);
                    }
                })
            })
            .collect()
    }

    /// Advance one screen's MSC and report what became due
    fn vblank(&self, screen: usize) {
        let ust = self.epoch.elapsed().as_micros() as u64;
        let (msc, due) = {
            let mut state = self.lock();
            let Some(crtc) = state.crtcs.get_mut(screen) else { return };
            crtc.msc = crtc.msc.wrapping_add(1);
            crtc.ust = ust;
            let msc = crtc.msc;
            let (due, waiting): (Vec<_>, Vec<_>) =
                crtc.queued.drain(..).partition(|(_, target)| *target <= msc);
            crtc.queued = waiting;
            (msc, due)
        };

        for (swap, _) in due {
            trace!("Swap {} on 0x{:08x} done at msc {}", swap.sbc, swap.drawable, msc);
            self.sender.push(Completion::SwapComplete {
                drawable: swap.drawable,
                ust,
                msc,
                sbc: swap.sbc,
                kind: SwapKind::Blit,
            });
        }
        self.sender.push(Completion::Vblank { screen, ust, msc });
    }
}

fn bytes_per_pixel(format: u32) -> u32 {
    match format {
        8 => 1,
        15 | 16 => 2,
        _ => 4,
    }
}

impl Dri2Backend for VirtualCrtc {
    fn authenticate(&mut self, _screen: usize, magic: u32) -> bool {
        magic != 0
    }

    fn create_buffer(
        &mut self,
        _screen: usize,
        attachment: u32,
        format: u32,
        width: u16,
        _height: u16,
    ) -> DixResult<BufferInfo> {
        let cpp = bytes_per_pixel(format);
        let pitch = (u32::from(width) * cpp + 63) & !63;
        let mut state = self.lock();
        state.next_name = state
            .next_name
            .checked_add(1)
            .ok_or(DixError::BadAlloc("buffer names exhausted"))?;
        Ok(BufferInfo {
            attachment,
            name: state.next_name,
            pitch,
            cpp,
            flags: 0,
        })
    }

    fn destroy_buffer(&mut self, buffer: &BufferInfo) {
        debug!("Released buffer {}", buffer.name);
    }

    fn copy_region(&mut self, drawable: Xid, rects: &[Rect], dest: u32, src: u32) -> DixResult<()> {
        debug!(
            "Copy {} rects on 0x{:08x} from attachment {} to {}",
            rects.len(),
            drawable,
            src,
            dest
        );
        Ok(())
    }

    fn schedule_swap(&mut self, swap: SwapRequest) -> DixResult<u64> {
        let mut state = self.lock();
        let crtc = state
            .crtcs
            .get_mut(swap.screen)
            .ok_or(DixError::bad_drawable(swap.drawable))?;
        // never complete before the next vblank
        let earliest = crtc.msc.saturating_add(1);
        let target = next_msc(earliest, swap.target_msc, swap.divisor, swap.remainder).max(earliest);
        crtc.queued.push((swap, target));
        Ok(target)
    }

    fn cancel_swaps(&mut self, drawable: Xid) {
        let mut state = self.lock();
        for crtc in &mut state.crtcs {
            crtc.queued.retain(|(swap, _)| swap.drawable != drawable);
        }
    }

    fn msc(&self, screen: usize) -> (u64, u64) {
        let state = self.lock();
        state
            .crtcs
            .get(screen)
            .map(|c| (c.ust, c.msc))
            .unwrap_or((0, 0))
    }

    fn buffer_age(&self) -> bool {
        false
    }

    fn get_param(&self, _param: u32) -> Option<u64> {
        None
    }
}
