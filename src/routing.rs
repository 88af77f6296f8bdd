//! Routing table: which producer goes where in the composite.
//!
//! Routing is closed-world. There is one main slot and four
//! picture-in-picture corners, or grid mode, which tiles every connected
//! producer and ignores the slots.

use crate::gpu::Viewport;

/// Inset of PIP viewports from the output edges, in pixels.
pub const PIP_MARGIN: f32 = 10.0;

/// Number of PIP slots.
pub const PIP_SLOTS: usize = 4;

/// Picture-in-picture corner. Slot order is the declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipCorner {
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
}

impl PipCorner {
    pub const ALL: [PipCorner; PIP_SLOTS] = [
        PipCorner::TopLeft,
        PipCorner::TopRight,
        PipCorner::BottomLeft,
        PipCorner::BottomRight,
    ];

    fn slot(self) -> usize {
        match self {
            PipCorner::TopLeft => 0,
            PipCorner::TopRight => 1,
            PipCorner::BottomLeft => 2,
            PipCorner::BottomRight => 3,
        }
    }

    /// A quarter of the output in each dimension, inset by [`PIP_MARGIN`].
    pub fn viewport(self, output_width: u32, output_height: u32) -> Viewport {
        let w = output_width as f32;
        let h = output_height as f32;
        let pw = (output_width / 4) as f32;
        let ph = (output_height / 4) as f32;

        let x = match self {
            PipCorner::TopLeft | PipCorner::BottomLeft => PIP_MARGIN,
            PipCorner::TopRight | PipCorner::BottomRight => w - pw - PIP_MARGIN,
        };
        let y = match self {
            PipCorner::TopLeft | PipCorner::TopRight => PIP_MARGIN,
            PipCorner::BottomLeft | PipCorner::BottomRight => h - ph - PIP_MARGIN,
        };
        Viewport::new(x, y, pw, ph)
    }
}

/// Role -> PID bindings, or grid mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    main: Option<u32>,
    pips: [Option<u32>; PIP_SLOTS],
    grid: bool,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn main(&self) -> Option<u32> {
        self.main
    }

    pub fn pip(&self, corner: PipCorner) -> Option<u32> {
        self.pips[corner.slot()]
    }

    pub fn is_grid(&self) -> bool {
        self.grid
    }

    /// Bound PIP slots in slot order.
    pub fn pips(&self) -> impl Iterator<Item = (PipCorner, u32)> + '_ {
        PipCorner::ALL
            .iter()
            .filter_map(move |&corner| self.pip(corner).map(|pid| (corner, pid)))
    }

    /// Every PID the table refers to, main first.
    pub fn routed_pids(&self) -> impl Iterator<Item = u32> + '_ {
        self.main.into_iter().chain(self.pips.iter().flatten().copied())
    }

    /// Replace all slot bindings from a priority list: entry 0 is main, entries
    /// 1..=4 are the PIP corners in slot order. PID 0 leaves a slot unbound and
    /// entries past the last slot are ignored.
    pub fn set_priority_list(&mut self, pids: &[u32]) {
        let bind = |pid: u32| (pid != 0).then_some(pid);
        self.main = pids.first().copied().and_then(bind);
        for (slot, value) in self.pips.iter_mut().enumerate() {
            *value = pids.get(slot + 1).copied().and_then(bind);
        }
        if pids.len() > PIP_SLOTS + 1 {
            log::debug!(
                "[ROUTING] Priority list has {} entries, ignoring {}",
                pids.len(),
                pids.len() - PIP_SLOTS - 1
            );
        }
    }

    /// PID 0 unbinds main.
    pub fn set_main(&mut self, pid: u32) {
        self.main = (pid != 0).then_some(pid);
    }

    /// Bind a corner. PID 0 unbinds it.
    pub fn set_pip(&mut self, corner: PipCorner, pid: u32) {
        self.pips[corner.slot()] = (pid != 0).then_some(pid);
    }

    pub fn set_grid(&mut self, grid: bool) {
        self.grid = grid;
    }

    /// Drop every binding and leave grid mode.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Equal cells for `count` tiles: `ceil(sqrt(n))` columns and as many rows as
/// needed, filled row by row.
pub fn grid_cells(count: usize, output_width: u32, output_height: u32) -> Vec<Viewport> {
    if count == 0 {
        return Vec::new();
    }
    let cols = (count as f64).sqrt().ceil() as usize;
    let rows = count.div_ceil(cols);
    let cell_w = output_width as f32 / cols as f32;
    let cell_h = output_height as f32 / rows as f32;

    (0..count)
        .map(|i| {
            let col = i % cols;
            let row = i / cols;
            Viewport::new(col as f32 * cell_w, row as f32 * cell_h, cell_w, cell_h)
        })
        .collect()
}
