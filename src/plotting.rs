//! Figure export.
//!
//! Figures are rendered into RGB bitmaps with plotters. [`multipage`] embeds
//! one bitmap per page in a PDF and can also write each figure as a PNG.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use pdf_writer::{Content, Finish, Name, Pdf, Rect, Ref};
use plotters::backend::BitMapBackend;
use plotters::chart::ChartBuilder;
use plotters::coord::Shift;
use plotters::drawing::{DrawingArea, IntoDrawingArea};
use plotters::series::LineSeries;
use plotters::style::colors::WHITE;
use plotters::style::{Color, IntoFont, Palette, Palette99};
use tracing::debug;

use crate::data::{Evoked, SourceEstimate};
use crate::error::{EsinetError, EsinetResult};

pub const PLOT_WIDTH: u32 = 800;
pub const PLOT_HEIGHT: u32 = 600;
const FONT_SIZE_TITLE: u32 = 24;

// ============================================================================
// Figures
// ============================================================================

/// Anything that can be drawn onto a bitmap of a fixed pixel size.
pub trait Figure {
    /// (width, height) in pixels
    fn size(&self) -> (u32, u32);

    fn draw(&self, area: &DrawingArea<BitMapBackend<'_>, Shift>) -> EsinetResult<()>;
}

fn plot_err(e: impl std::fmt::Display) -> EsinetError {
    EsinetError::Plot(e.to_string())
}

/// Calculate plot range with 15% padding, or a fixed padding for flat data.
pub fn calculate_range(min_val: f64, max_val: f64) -> (f64, f64) {
    let (min, max) = if min_val <= max_val {
        (min_val, max_val)
    } else {
        (max_val, min_val)
    };
    let range = (max - min).abs();
    let padding = if range < 1e-12 { 0.5 } else { range * 0.15 };
    (min - padding, max + padding)
}

/// One line per row of a channels (or dipoles) × times matrix.
#[derive(Clone, Debug)]
pub struct TracesFigure {
    /// Drawn as a caption when set; needs the `ttf` feature
    pub title: Option<String>,
    pub times: Vec<f64>,
    pub traces: Vec<Vec<f64>>,
    pub width: u32,
    pub height: u32,
}

impl TracesFigure {
    pub fn new(times: Vec<f64>, traces: Vec<Vec<f64>>) -> Self {
        Self {
            title: None,
            times,
            traces,
            width: PLOT_WIDTH,
            height: PLOT_HEIGHT,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn from_source_estimate(stc: &SourceEstimate) -> Self {
        Self::new(stc.times(), stc.data.rows().into_iter().map(|r| r.to_vec()).collect())
    }

    pub fn from_evoked(evoked: &Evoked) -> Self {
        Self::new(evoked.times(), evoked.data.rows().into_iter().map(|r| r.to_vec()).collect())
    }

    fn value_range(&self) -> (f64, f64) {
        let (lo, hi) = self
            .traces
            .iter()
            .flatten()
            .filter(|v| v.is_finite())
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if lo > hi {
            calculate_range(0.0, 0.0)
        } else {
            calculate_range(lo, hi)
        }
    }

    fn time_range(&self) -> (f64, f64) {
        match (self.times.first(), self.times.last()) {
            (Some(&first), Some(&last)) if last > first => (first, last),
            (Some(&first), _) => (first - 0.5, first + 0.5),
            _ => (0.0, 1.0),
        }
    }
}

impl Figure for TracesFigure {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn draw(&self, area: &DrawingArea<BitMapBackend<'_>, Shift>) -> EsinetResult<()> {
        area.fill(&WHITE).map_err(plot_err)?;
        let (x_min, x_max) = self.time_range();
        let (y_min, y_max) = self.value_range();

        let mut builder = ChartBuilder::on(area);
        builder.margin(10);
        if let Some(title) = &self.title {
            builder.caption(title, ("sans-serif", FONT_SIZE_TITLE).into_font());
        }
        let mut chart = builder
            .build_cartesian_2d(x_min..x_max, y_min..y_max)
            .map_err(plot_err)?;

        for (i, trace) in self.traces.iter().enumerate() {
            let style = Palette99::pick(i).stroke_width(1);
            let points = self
                .times
                .iter()
                .zip(trace)
                .filter(|(_, v)| v.is_finite())
                .map(|(&t, &v)| (t, v));
            chart
                .draw_series(LineSeries::new(points, style))
                .map_err(plot_err)?;
        }
        Ok(())
    }
}

// ============================================================================
// Export
// ============================================================================

fn render_rgb(fig: &dyn Figure) -> EsinetResult<Vec<u8>> {
    let (w, h) = fig.size();
    if w == 0 || h == 0 {
        return Err(EsinetError::InvalidConfig(format!(
            "figure size must be > 0, got {w}x{h}"
        )));
    }
    let mut buffer = vec![0u8; w as usize * h as usize * 3];
    {
        let root = BitMapBackend::with_buffer(&mut buffer, (w, h)).into_drawing_area();
        fig.draw(&root)?;
        root.present().map_err(plot_err)?;
    }
    Ok(buffer)
}

/// One page per image, each page exactly the image size at `dpi`.
fn build_pdf(pages: &[((u32, u32), Vec<u8>)], dpi: f64) -> Vec<u8> {
    let catalog_id = Ref::new(1);
    let tree_id = Ref::new(2);
    // then (page, contents, image) per figure
    let ids = |i: usize| {
        let base = 3 + 3 * i as i32;
        (Ref::new(base), Ref::new(base + 1), Ref::new(base + 2))
    };
    let image_name = Name(b"Im0");

    let mut pdf = Pdf::new();
    pdf.catalog(catalog_id).pages(tree_id);
    pdf.pages(tree_id)
        .kids((0..pages.len()).map(|i| ids(i).0))
        .count(pages.len() as i32);

    for (i, ((w, h), rgb)) in pages.iter().enumerate() {
        let (page_id, contents_id, image_id) = ids(i);
        let width_pt = (f64::from(*w) * 72.0 / dpi) as f32;
        let height_pt = (f64::from(*h) * 72.0 / dpi) as f32;

        let mut page = pdf.page(page_id);
        page.media_box(Rect::new(0.0, 0.0, width_pt, height_pt));
        page.parent(tree_id);
        page.contents(contents_id);
        page.resources().x_objects().pair(image_name, image_id);
        page.finish();

        let mut image = pdf.image_xobject(image_id, rgb);
        image.width(*w as i32);
        image.height(*h as i32);
        image.color_space().device_rgb();
        image.bits_per_component(8);
        image.finish();

        let mut content = Content::new();
        content.save_state();
        content.transform([width_pt, 0.0, 0.0, height_pt, 0.0, 0.0]);
        content.x_object(image_name);
        content.restore_state();
        pdf.stream(contents_id, &content.finish());
    }
    pdf.finish()
}

/// PNG path for figure `index` of a PDF named `filename`.
pub fn png_path(filename: &Path, index: usize) -> PathBuf {
    let stem = filename
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let dir = filename.parent().unwrap_or_else(|| Path::new(""));
    dir.join(format!("{index}_{stem}.png"))
}

/// Save figures to a multi-page PDF at `filename`, one figure per page.
///
/// `dpi` sets the physical page size of each bitmap. With `png`, every figure
/// is also written to `<index>_<basename>.png` in the same directory.
pub fn multipage(
    filename: impl AsRef<Path>,
    figs: &[&dyn Figure],
    dpi: f64,
    png: bool,
) -> EsinetResult<()> {
    let filename = filename.as_ref();
    if !(dpi.is_finite() && dpi > 0.0) {
        return Err(EsinetError::InvalidConfig(format!("dpi must be > 0, got {dpi}")));
    }

    let mut pages = Vec::with_capacity(figs.len());
    for (i, fig) in figs.iter().enumerate() {
        debug!("saving figure {} to {}", i, filename.display());
        pages.push((fig.size(), render_rgb(*fig)?));

        if png {
            let path = png_path(filename, i);
            let root = BitMapBackend::new(&path, fig.size()).into_drawing_area();
            fig.draw(&root)?;
            root.present().map_err(plot_err)?;
        }
    }

    let bytes = build_pdf(&pages, dpi);
    let mut file = fs::File::create(filename).map_err(|e| EsinetError::io(filename, e))?;
    file.write_all(&bytes)
        .map_err(|e| EsinetError::io(filename, e))?;
    Ok(())
}
