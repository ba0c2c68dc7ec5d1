//! Grid composition: annotate screenshots with a label bar and stitch them
//! into an R×C composite for vision analysis.
//!
//! Geometry contract: every image gets a fixed-height header strip; the first
//! image's dimensions define the grid cell size and later images are placed
//! as-is (sources come from one transcoder, so they are uniform in practice).

use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};
use rusttype::{point, Font, Scale};

use crate::error::{VigilError, VigilResult};
use crate::fetcher::ImageFetcher;
use crate::utils::url_stem;

/// Height of the black label bar added above each image, in pixels.
pub const LABEL_HEIGHT: u32 = 60;

/// Border between grid cells, in pixels.
pub const BORDER_SIZE: u32 = 10;

const LABEL_TEXT_SCALE: f32 = 30.0;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_FILL: Rgb<u8> = Rgb([0, 0, 0]);

/// Well-known font locations probed at startup. The label text is cosmetic,
/// so a missing font degrades to an empty bar rather than failing the grid.
const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

fn load_system_font() -> Option<Font<'static>> {
    for path in FONT_CANDIDATES {
        if let Ok(bytes) = std::fs::read(path) {
            if let Some(font) = Font::try_from_vec(bytes) {
                log::debug!("[Stitcher] Using label font {}", path);
                return Some(font);
            }
        }
    }
    None
}

/// Downloads, annotates, and composes screenshot grids.
pub struct Stitcher {
    fetcher: Arc<dyn ImageFetcher>,
    font: Option<Font<'static>>,
}

impl Stitcher {
    /// Creates a stitcher. Probes for a system font once; when none is found
    /// label bars are rendered without text.
    pub fn new(fetcher: Arc<dyn ImageFetcher>) -> Self {
        let font = load_system_font();
        if font.is_none() {
            log::warn!("[Stitcher] No system font found, grid labels will be empty");
        }
        Self { fetcher, font }
    }

    /// Downloads each URL, annotates it with its basename, composes the
    /// row-major grid, and persists it as a PNG at `output_path`.
    ///
    /// Individual download failures are logged and skipped; the grid is
    /// composed from whatever survived. Fails only when nothing could be
    /// downloaded at all.
    pub async fn stitch(
        &self,
        urls: &[String],
        output_path: &Path,
        rows: u32,
        cols: u32,
    ) -> VigilResult<RgbImage> {
        if urls.is_empty() {
            return Err(VigilError::Network("no image URLs to stitch".into()));
        }
        log::info!(
            "[Stitcher] Composing {} images into a {}x{} grid",
            urls.len(),
            rows,
            cols
        );

        let mut annotated = Vec::with_capacity(urls.len());
        for url in urls {
            match self.fetcher.fetch(url).await {
                Ok(image) => {
                    annotated.push(annotate(&image, url_stem(url), self.font.as_ref()));
                }
                Err(e) => {
                    log::error!("[Stitcher] Skipping {}: {}", url, e);
                }
            }
        }
        if annotated.is_empty() {
            return Err(VigilError::Network(
                "no grid images could be downloaded".into(),
            ));
        }

        let grid = compose_grid(&annotated, rows, cols);

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        grid.save(output_path)
            .map_err(|e| VigilError::Io(std::io::Error::other(e)))?;
        log::info!("[Stitcher] Saved grid {}", output_path.display());

        Ok(grid)
    }
}

/// Adds a label bar of [`LABEL_HEIGHT`] above the image, black fill with the
/// name centered in white when a font is available.
pub(crate) fn annotate(image: &DynamicImage, name: &str, font: Option<&Font<'_>>) -> RgbImage {
    let source = image.to_rgb8();
    let (width, height) = source.dimensions();

    let mut canvas = RgbImage::from_pixel(width, height + LABEL_HEIGHT, BACKGROUND);
    for y in 0..LABEL_HEIGHT {
        for x in 0..width {
            canvas.put_pixel(x, y, LABEL_FILL);
        }
    }
    if let Some(font) = font {
        draw_centered_text(&mut canvas, font, name, width);
    }
    image::imageops::replace(&mut canvas, &source, 0, i64::from(LABEL_HEIGHT));
    canvas
}

/// Renders `text` centered inside the label bar, clipped to the bar.
fn draw_centered_text(canvas: &mut RgbImage, font: &Font<'_>, text: &str, width: u32) {
    let scale = Scale::uniform(LABEL_TEXT_SCALE);
    let v_metrics = font.v_metrics(scale);

    let glyphs: Vec<_> = font.layout(text, scale, point(0.0, v_metrics.ascent)).collect();
    let text_width = glyphs
        .last()
        .map(|g| g.position().x + g.unpositioned().h_metrics().advance_width)
        .unwrap_or(0.0);
    let x_offset = ((width as f32 - text_width) / 2.0).max(0.0);
    let y_offset = ((LABEL_HEIGHT as f32 - LABEL_TEXT_SCALE) / 2.0).max(0.0);

    for glyph in &glyphs {
        let Some(bb) = glyph.pixel_bounding_box() else {
            continue;
        };
        glyph.draw(|gx, gy, coverage| {
            let x = x_offset as i32 + bb.min.x + gx as i32;
            let y = y_offset as i32 + bb.min.y + gy as i32;
            if x >= 0 && (x as u32) < width && y >= 0 && (y as u32) < LABEL_HEIGHT {
                let level = (coverage * 255.0) as u8;
                canvas.put_pixel(x as u32, y as u32, Rgb([level, level, level]));
            }
        });
    }
}

/// Places annotated images in row-major order with [`BORDER_SIZE`] gaps.
/// Cells beyond the provided images keep the default background.
pub(crate) fn compose_grid(images: &[RgbImage], rows: u32, cols: u32) -> RgbImage {
    let (cell_width, cell_height) = images
        .first()
        .map(|i| i.dimensions())
        .expect("compose_grid requires at least one image");

    let total_width = cols * cell_width + (cols - 1) * BORDER_SIZE;
    let total_height = rows * cell_height + (rows - 1) * BORDER_SIZE;
    let mut grid = RgbImage::from_pixel(total_width, total_height, BACKGROUND);

    for (index, image) in images.iter().enumerate() {
        if index as u32 >= rows * cols {
            break;
        }
        let row = index as u32 / cols;
        let col = index as u32 % cols;
        let x = col * (cell_width + BORDER_SIZE);
        let y = row * (cell_height + BORDER_SIZE);
        image::imageops::replace(&mut grid, image, i64::from(x), i64::from(y));
    }

    grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::tempdir;

    fn solid(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb(color))
    }

    #[test]
    fn annotate_prepends_label_bar() {
        let source = DynamicImage::ImageRgb8(solid(8, 8, [200, 10, 10]));
        let annotated = annotate(&source, "cam-1", None);

        assert_eq!(annotated.dimensions(), (8, 8 + LABEL_HEIGHT));
        // Bar is black, original pixels sit below it untouched.
        assert_eq!(*annotated.get_pixel(0, 0), Rgb([0, 0, 0]));
        assert_eq!(*annotated.get_pixel(0, LABEL_HEIGHT), Rgb([200, 10, 10]));
    }

    #[test]
    fn compose_grid_dimensions_include_borders() {
        let images = vec![solid(4, 6, [1, 1, 1]); 6];
        let grid = compose_grid(&images, 2, 3);
        assert_eq!(
            grid.dimensions(),
            (3 * 4 + 2 * BORDER_SIZE, 2 * 6 + BORDER_SIZE)
        );
    }

    #[test]
    fn compose_grid_places_row_major() {
        let images = vec![
            solid(4, 4, [10, 0, 0]),
            solid(4, 4, [20, 0, 0]),
            solid(4, 4, [30, 0, 0]),
            solid(4, 4, [40, 0, 0]),
        ];
        let grid = compose_grid(&images, 2, 2);

        assert_eq!(*grid.get_pixel(0, 0), Rgb([10, 0, 0]));
        assert_eq!(*grid.get_pixel(4 + BORDER_SIZE, 0), Rgb([20, 0, 0]));
        assert_eq!(*grid.get_pixel(0, 4 + BORDER_SIZE), Rgb([30, 0, 0]));
        assert_eq!(
            *grid.get_pixel(4 + BORDER_SIZE, 4 + BORDER_SIZE),
            Rgb([40, 0, 0])
        );
    }

    #[test]
    fn short_grid_leaves_empty_cells_as_background() {
        let images = vec![solid(4, 4, [10, 0, 0]); 4];
        let grid = compose_grid(&images, 2, 3);
        // Last cell of the bottom row was never filled.
        let x = 2 * (4 + BORDER_SIZE);
        let y = 4 + BORDER_SIZE;
        assert_eq!(*grid.get_pixel(x, y), BACKGROUND);
    }

    #[test]
    fn extra_images_beyond_capacity_are_dropped() {
        let images = vec![solid(2, 2, [9, 9, 9]); 5];
        let grid = compose_grid(&images, 2, 2);
        assert_eq!(grid.dimensions(), (2 * 2 + BORDER_SIZE, 2 * 2 + BORDER_SIZE));
    }

    struct ColorFetcher;

    #[async_trait]
    impl ImageFetcher for ColorFetcher {
        async fn fetch(&self, url: &str) -> crate::error::VigilResult<DynamicImage> {
            if url.contains("missing") {
                return Err(VigilError::Network("404".into()));
            }
            let shade = if url.contains("first") { 50 } else { 100 };
            Ok(DynamicImage::ImageRgb8(solid(6, 6, [shade, 0, 0])))
        }
    }

    #[tokio::test]
    async fn stitch_writes_png_and_tolerates_failed_downloads() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("grids/first.png");
        let stitcher = Stitcher {
            fetcher: Arc::new(ColorFetcher),
            font: None,
        };
        let urls = vec![
            "https://store/first.jpg".to_string(),
            "https://store/missing.jpg".to_string(),
            "https://store/second.jpg".to_string(),
        ];

        let grid = stitcher.stitch(&urls, &output, 1, 2).await.unwrap();

        assert!(output.exists());
        // Two images survived the download, placed left-to-right.
        assert_eq!(grid.dimensions(), (2 * 6 + BORDER_SIZE, 6 + LABEL_HEIGHT));
        assert_eq!(*grid.get_pixel(0, LABEL_HEIGHT), Rgb([50, 0, 0]));
        assert_eq!(*grid.get_pixel(6 + BORDER_SIZE, LABEL_HEIGHT), Rgb([100, 0, 0]));
    }

    #[tokio::test]
    async fn stitch_fails_when_nothing_downloads() {
        let dir = tempdir().unwrap();
        let stitcher = Stitcher {
            fetcher: Arc::new(ColorFetcher),
            font: None,
        };
        let urls = vec!["https://store/missing.jpg".to_string()];
        let err = stitcher
            .stitch(&urls, &dir.path().join("g.png"), 1, 1)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "network_error");
    }
}
