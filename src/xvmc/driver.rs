//! XvMC Drivers
//!
//! The driver allocates the hardware side of contexts, surfaces and
//! subpictures and may hand back private words the client library needs.

use tracing::debug;
use xdix_proto::ImageFormat;

use super::{XvmcContext, XvmcSubpicture, XvmcSurface};
use crate::dix::DixResult;

/// What the driver made of a context request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextAlloc {
    pub width: u16,
    pub height: u16,
    pub flags: u32,
    pub priv_data: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubpictureAlloc {
    pub width: u16,
    pub height: u16,
    pub num_palette_entries: u16,
    pub entry_bytes: u16,
    pub component_order: [u8; 4],
    pub priv_data: Vec<u32>,
}

pub trait XvmcDriver: Send {
    fn create_context(&mut self, ctx: &XvmcContext) -> DixResult<ContextAlloc>;

    fn destroy_context(&mut self, ctx: &XvmcContext);

    /// Returns driver-private words for the reply
    fn create_surface(&mut self, ctx: &XvmcContext, surface: &XvmcSurface) -> DixResult<Vec<u32>>;

    fn destroy_surface(&mut self, surface: &XvmcSurface);

    fn create_subpicture(
        &mut self,
        ctx: &XvmcContext,
        sub: &XvmcSubpicture,
        format: &ImageFormat,
    ) -> DixResult<SubpictureAlloc>;

    fn destroy_subpicture(&mut self, sub: &XvmcSubpicture);
}

/// Macroblock alignment used for decode buffers
const ALIGN: u16 = 16;

fn align(value: u16) -> u16 {
    value.div_ceil(ALIGN).saturating_mul(ALIGN)
}

/// Driver with no hardware behind it; sizes are rounded to macroblocks
#[derive(Debug, Default)]
pub struct SoftwareDriver {
    live: usize,
}

impl XvmcDriver for SoftwareDriver {
    fn create_context(&mut self, ctx: &XvmcContext) -> DixResult<ContextAlloc> {
        self.live += 1;
        debug!("Software XvMC context {}x{}", ctx.width, ctx.height);
        Ok(ContextAlloc {
            width: align(ctx.width),
            height: align(ctx.height),
            flags: ctx.flags,
            priv_data: Vec::new(),
        })
    }

    fn destroy_context(&mut self, _ctx: &XvmcContext) {
        self.live = self.live.saturating_sub(1);
    }

    fn create_surface(&mut self, _ctx: &XvmcContext, _surface: &XvmcSurface) -> DixResult<Vec<u32>> {
        self.live += 1;
        Ok(Vec::new())
    }

    fn destroy_surface(&mut self, _surface: &XvmcSurface) {
        self.live = self.live.saturating_sub(1);
    }

    fn create_subpicture(
        &mut self,
        _ctx: &XvmcContext,
        sub: &XvmcSubpicture,
        format: &ImageFormat,
    ) -> DixResult<SubpictureAlloc> {
        self.live += 1;
        let mut component_order = [0u8; 4];
        for (slot, byte) in component_order
            .iter_mut()
            .zip(format.component_order.bytes())
        {
            *slot = byte;
        }
        Ok(SubpictureAlloc {
            width: sub.width,
            height: sub.height,
            num_palette_entries: format.palette_entries,
            entry_bytes: if format.palette_entries > 0 { 3 } else { 0 },
            component_order,
            priv_data: Vec::new(),
        })
    }

    fn destroy_subpicture(&mut self, _sub: &XvmcSubpicture) {
        self.live = self.live.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dix::Arena;

    #[test]
    fn test_software_driver_rounds_to_macroblocks() {
        let mut driver = SoftwareDriver::default();
        let ctx = XvmcContext {
            id: 1,
            adaptor: 0,
            surface_type_id: 0,
            width: 33,
            height: 16,
            flags: 7,
            refcnt: 1,
        };
        let alloc = driver.create_context(&ctx).unwrap();
        assert_eq!((alloc.width, alloc.height, alloc.flags), (48, 16, 7));

        let sub = XvmcSubpicture {
            id: 2,
            context: Arena::new().insert(()),
            xvimage_id: 0,
            width: 8,
            height: 8,
        };
        let format = ImageFormat {
            id: 0,
            kind: "yuv".to_string(),
            bits_per_pixel: 8,
            num_planes: 1,
            depth: 8,
            red_mask: 0,
            green_mask: 0,
            blue_mask: 0,
            packed: true,
            palette_entries: 16,
            component_order: "YUV".to_string(),
        };
        let alloc = driver.create_subpicture(&ctx, &sub, &format).unwrap();
        assert_eq!(alloc.component_order, *b"YUV\0");
        assert_eq!(alloc.entry_bytes, 3);

        driver.destroy_subpicture(&sub);
        driver.destroy_context(&ctx);
        assert_eq!(driver.live, 0);
    }
}
