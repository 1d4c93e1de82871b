use thiserror::Error;
use tracing::debug;

/// Terminal size in character cells plus the pixel size of one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Geometry {
    pub cols: u16,
    pub rows: u16,
    pub cell_width: f32,
    pub cell_height: f32,
}

impl Geometry {
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }
}

/// A rendering surface that can be measured.
pub trait RenderSurface {
    /// Pixel size of a single glyph cell, or `None` while the surface has not
    /// rendered anything yet.
    fn cell_size(&self) -> Option<(f32, f32)>;

    /// Pixel size of the visible area.
    fn viewport(&self) -> (f32, f32);
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GeometryError {
    #[error("rendering surface has not been measured yet")]
    SurfaceNotReady,
}

/// Converts a surface's pixel viewport into terminal columns and rows.
///
/// The cell size is measured on first success and cached until `reset`;
/// viewport size is re-read on every call.
#[derive(Debug, Default)]
pub struct GeometryResolver {
    cell: Option<(f32, f32)>,
    last: Option<Geometry>,
}

impl GeometryResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measure(&mut self, surface: &dyn RenderSurface) -> Result<Geometry, GeometryError> {
        let (cell_width, cell_height) = match self.cell {
            Some(cell) => cell,
            None => match surface.cell_size().filter(|&(w, h)| usable(w) && usable(h)) {
                Some(cell) => {
                    self.cell = Some(cell);
                    cell
                }
                None => {
                    debug!(target: "shellrelay::geometry", "cell size unavailable");
                    return self.last.ok_or(GeometryError::SurfaceNotReady);
                }
            },
        };

        let (width, height) = surface.viewport();
        let geometry = Geometry {
            cols: cells(width, cell_width),
            rows: cells(height, cell_height),
            cell_width,
            cell_height,
        };
        self.last = Some(geometry);
        Ok(geometry)
    }

    pub fn last(&self) -> Option<Geometry> {
        self.last
    }

    /// Forgets the cached cell size, e.g. after the surface is re-attached
    /// with a different font.
    pub fn reset(&mut self) {
        self.cell = None;
    }
}

fn usable(value: f32) -> bool {
    value.is_finite() && value > 0.0
}

/// Slack for f32 cell sizes derived as `extent / cells`, which can land a
/// hair under the whole number they came from.
const CELL_EPSILON: f64 = 1e-3;

// Never report a zero-sized terminal.
fn cells(extent: f32, cell: f32) -> u16 {
    let count = (f64::from(extent.max(0.0)) / f64::from(cell) + CELL_EPSILON).floor();
    if !count.is_finite() {
        return 1;
    }
    (count as u64).clamp(1, u16::MAX as u64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeSurface {
        cell: Cell<Option<(f32, f32)>>,
        viewport: Cell<(f32, f32)>,
        cell_reads: Cell<usize>,
    }

    impl FakeSurface {
        fn new(cell: Option<(f32, f32)>, viewport: (f32, f32)) -> Self {
            Self {
                cell: Cell::new(cell),
                viewport: Cell::new(viewport),
                cell_reads: Cell::new(0),
            }
        }
    }

    impl RenderSurface for FakeSurface {
        fn cell_size(&self) -> Option<(f32, f32)> {
            self.cell_reads.set(self.cell_reads.get() + 1);
            self.cell.get()
        }

        fn viewport(&self) -> (f32, f32) {
            self.viewport.get()
        }
    }

    #[test]
    fn floors_viewport_into_cells() {
        let surface = FakeSurface::new(Some((9.0, 17.0)), (1280.0, 720.0));
        let geometry = GeometryResolver::new().measure(&surface).unwrap();
        assert_eq!(geometry.size(), (142, 42));
        assert!(f32::from(geometry.cols) * geometry.cell_width <= 1280.0);
        assert!(f32::from(geometry.rows) * geometry.cell_height <= 720.0);
    }

    #[test]
    fn derived_cell_sizes_round_trip_to_the_same_grid() {
        let surface = FakeSurface::new(Some((652.0 / 81.0, 480.0 / 24.0)), (652.0, 480.0));
        assert_eq!(GeometryResolver::new().measure(&surface).unwrap().size(), (81, 24));

        for cols in 1u16..=200 {
            for glyph in 6u16..=12 {
                for padding in 0..glyph {
                    let width = f32::from(cols * glyph + padding);
                    let surface =
                        FakeSurface::new(Some((width / f32::from(cols), 16.0)), (width, 480.0));
                    let geometry = GeometryResolver::new().measure(&surface).unwrap();
                    assert_eq!(geometry.cols, cols, "{width}px over {cols} columns");
                }
            }
        }
    }

    #[test]
    fn never_reports_less_than_one_cell() {
        let cells_px = [0.5_f32, 1.0, 7.25, 9.0, 17.0, 64.0, 1000.0];
        let viewports = [0.0_f32, -5.0, 0.4, 1.0, 8.9, 640.0, 4096.0, f32::NAN];
        for &cw in &cells_px {
            for &ch in &cells_px {
                for &vw in &viewports {
                    for &vh in &viewports {
                        let surface = FakeSurface::new(Some((cw, ch)), (vw, vh));
                        let geometry = GeometryResolver::new().measure(&surface).unwrap();
                        assert!(geometry.cols >= 1, "cols for {vw}/{cw}");
                        assert!(geometry.rows >= 1, "rows for {vh}/{ch}");
                    }
                }
            }
        }
    }

    #[test]
    fn caches_cell_size_after_first_measurement() {
        let surface = FakeSurface::new(Some((10.0, 20.0)), (800.0, 600.0));
        let mut resolver = GeometryResolver::new();
        resolver.measure(&surface).unwrap();

        surface.cell.set(Some((5.0, 5.0)));
        surface.viewport.set((400.0, 200.0));
        let geometry = resolver.measure(&surface).unwrap();

        assert_eq!(geometry.size(), (40, 10));
        assert_eq!(surface.cell_reads.get(), 1);

        resolver.reset();
        assert_eq!(resolver.measure(&surface).unwrap().size(), (80, 40));
    }

    #[test]
    fn unready_surface_returns_sentinel_then_previous_geometry() {
        let surface = FakeSurface::new(None, (800.0, 600.0));
        let mut resolver = GeometryResolver::new();
        assert_eq!(
            resolver.measure(&surface),
            Err(GeometryError::SurfaceNotReady)
        );

        surface.cell.set(Some((10.0, 20.0)));
        let first = resolver.measure(&surface).unwrap();

        resolver.reset();
        surface.cell.set(Some((f32::NAN, 20.0)));
        assert_eq!(resolver.measure(&surface), Ok(first));
    }
}
