//! Block rasterization.
//!
//! Remaps the hardware block order so that consecutive blocks walk a panel of
//! `panel_size` grid columns before moving on, keeping the operand rows they
//! share resident in L2. Panels alternate direction (serpentine). This is a
//! launch-order permutation only; it never changes which blocks run.

use crate::ir::Kernel;

/// Grid coordinate `(x, y)` of the `linear`-th launched block in a
/// `gx × gy` plane.
pub fn remap(linear: u64, gx: u32, gy: u32, panel_size: u32) -> (u32, u32) {
    let (gx64, gy64) = (gx.max(1) as u64, gy.max(1) as u64);
    let panel = panel_size.clamp(1, gx.max(1)) as u64;
    let full_panels = gx64 / panel;
    let per_panel = panel * gy64;

    let index = linear / per_panel;
    let within = linear % per_panel;
    let width = if index < full_panels {
        panel
    } else {
        gx64 - full_panels * panel
    };
    let x = index * panel + within % width;
    let mut y = within / width;
    if index % 2 == 1 {
        y = gy64 - 1 - y;
    }
    (x as u32, y as u32)
}

/// Block coordinates in launch order, produced lazily.
pub fn launch_order(kernel: &Kernel) -> impl Iterator<Item = [u32; 3]> {
    let [gx, gy, gz] = kernel.grid;
    let plane = gx as u64 * gy as u64;
    let swizzle = kernel
        .rasterization
        .filter(|r| r.enable && r.panel_size > 0);
    (0..gz).flat_map(move |z| {
        (0..plane).map(move |linear| {
            let (x, y) = match swizzle {
                Some(r) => remap(linear, gx, gy, r.panel_size),
                None => ((linear % gx as u64) as u32, (linear / gx as u64) as u32),
            };
            [x, y, z]
        })
    })
}
