use std::path::{Path, PathBuf};

use anyhow::Result;
use fontdue::{Font, FontSettings};
use image::{Rgba, RgbaImage, RgbImage};
use tracing::{info, warn};

use crate::config::CaptionConfig;

/// Fonts tried, in order, when the configured font is missing.
const SYSTEM_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu-sans-fonts/DejaVuSans-Bold.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Bold.ttf",
    "/usr/share/fonts/liberation-sans/LiberationSans-Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial Bold.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "/Library/Fonts/Arial.ttf",
    "C:\\Windows\\Fonts\\arialbd.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

/// Pixel layout of one caption, derived from the frame size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CaptionLayout {
    pub font_size: f32,
    pub padding_x: u32,
    pub padding_top: u32,
    pub padding_bottom: u32,
    pub bottom_offset: u32,
}

impl CaptionLayout {
    pub fn for_frame(width: u32, height: u32, config: &CaptionConfig) -> Self {
        CaptionLayout {
            font_size: (height as f32 * config.font_scale).floor().max(1.0),
            padding_x: (width as f32 * config.padding_x) as u32,
            padding_top: (height as f32 * config.padding_top) as u32,
            padding_bottom: (height as f32 * config.padding_bottom) as u32,
            bottom_offset: config.bottom_offset,
        }
    }
}

/// Renders single caption words onto translucent boxes.
pub struct CaptionRenderer {
    font: Font,
    layout: CaptionLayout,
    text_color: [u8; 3],
    background: [u8; 4],
}

impl CaptionRenderer {
    pub fn new(font_path: &Path, layout: CaptionLayout, config: &CaptionConfig) -> Result<Self> {
        let font = load_font(font_path)?;
        Ok(Self {
            font,
            layout,
            text_color: rgb_of(parse_hex_color(&config.text_color)?),
            background: parse_hex_color(&config.background_color)?,
        })
    }

    /// Width and height of the ink of `text`, and the ascent above the baseline.
    fn measure(&self, text: &str) -> (u32, u32, i32) {
        let size = self.layout.font_size;
        let mut width = 0f32;
        let mut top = 0i32;
        let mut bottom = 0i32;
        for ch in text.chars() {
            let metrics = self.font.metrics(ch, size);
            width += metrics.advance_width;
            if metrics.width > 0 {
                top = top.max(metrics.height as i32 + metrics.ymin);
                bottom = bottom.min(metrics.ymin);
            }
        }
        (width.ceil() as u32, (top - bottom).max(0) as u32, top)
    }

    /// The word on a rectangle sized to its bounding box plus padding.
    pub fn render_word(&self, text: &str) -> RgbaImage {
        let (text_width, text_height, ascent) = self.measure(text);
        let bg_width = (text_width + 2 * self.layout.padding_x).max(1);
        let bg_height =
            (text_height + self.layout.padding_top + self.layout.padding_bottom).max(1);
        let mut img = RgbaImage::from_pixel(bg_width, bg_height, Rgba(self.background));

        let baseline = self.layout.padding_top as i32 + ascent;
        let mut pen_x = ((bg_width - text_width) / 2) as f32;
        for ch in text.chars() {
            let (metrics, bitmap) = self.font.rasterize(ch, self.layout.font_size);
            let glyph_x = pen_x.round() as i32 + metrics.xmin;
            let glyph_y = baseline - (metrics.height as i32 + metrics.ymin);

            for (i, &coverage) in bitmap.iter().enumerate() {
                if coverage == 0 {
                    continue;
                }
                let x = glyph_x + (i % metrics.width) as i32;
                let y = glyph_y + (i / metrics.width) as i32;
                if x < 0 || y < 0 || x >= bg_width as i32 || y >= bg_height as i32 {
                    continue;
                }
                let pixel = img.get_pixel_mut(x as u32, y as u32);
                *pixel = paint_over(*pixel, self.text_color, coverage);
            }
            pen_x += metrics.advance_width;
        }
        img
    }

    /// Top-left corner of a caption image: horizontally centered, top edge
    /// `bottom_offset` pixels above the bottom of the frame.
    pub fn position(&self, caption: &RgbaImage, frame_width: u32, frame_height: u32) -> (i64, i64) {
        let x = (frame_width as i64 - caption.width() as i64) / 2;
        let y = frame_height as i64 - self.layout.bottom_offset as i64;
        (x, y)
    }
}

/// Source-over of an opaque colour with `coverage` onto an RGBA pixel.
fn paint_over(dst: Rgba<u8>, color: [u8; 3], coverage: u8) -> Rgba<u8> {
    let a = coverage as f32 / 255.0;
    let dst_a = dst.0[3] as f32 / 255.0;
    let out_a = a + dst_a * (1.0 - a);
    let mut out = [0u8; 4];
    for i in 0..3 {
        let blended = (color[i] as f32 * a + dst.0[i] as f32 * dst_a * (1.0 - a)) / out_a;
        out[i] = blended.round().clamp(0.0, 255.0) as u8;
    }
    out[3] = (out_a * 255.0).round() as u8;
    Rgba(out)
}

/// Alpha-blends `overlay` onto `frame` with its top-left corner at (`x`, `y`); parts outside
/// the frame are clipped.
pub fn blend_onto(frame: &mut RgbImage, overlay: &RgbaImage, x: i64, y: i64) {
    for (ox, oy, px) in overlay.enumerate_pixels() {
        let alpha = px.0[3];
        if alpha == 0 {
            continue;
        }
        let fx = x + ox as i64;
        let fy = y + oy as i64;
        if fx < 0 || fy < 0 || fx >= frame.width() as i64 || fy >= frame.height() as i64 {
            continue;
        }
        let dst = frame.get_pixel_mut(fx as u32, fy as u32);
        let a = alpha as f32 / 255.0;
        for i in 0..3 {
            dst.0[i] = ((1.0 - a) * dst.0[i] as f32 + a * px.0[i] as f32).round() as u8;
        }
    }
}

/// `preferred` when it exists, else the first installed system font.
pub fn resolve_font_path(preferred: &Path) -> Option<PathBuf> {
    if preferred.exists() {
        return Some(preferred.to_path_buf());
    }
    warn!(
        "⚠️ Font file '{}' not found. Using a system font.",
        preferred.display()
    );
    SYSTEM_FONTS
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.exists())
}

fn load_font(path: &Path) -> Result<Font> {
    info!("📝 Loading font: {}", path.display());
    let font_data = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read font file '{}': {}", path.display(), e))?;
    Font::from_bytes(font_data.as_slice(), FontSettings::default())
        .map_err(|e| anyhow::anyhow!("Failed to load font '{}': {}", path.display(), e))
}

/// `#RRGGBB` or `#RRGGBBAA`; six digits mean fully opaque.
pub fn parse_hex_color(hex: &str) -> Result<[u8; 4]> {
    let hex = hex.trim_start_matches('#');
    if !(hex.len() == 6 || hex.len() == 8) || !hex.is_ascii() {
        anyhow::bail!("Invalid hex color: {}", hex);
    }
    let alpha = if hex.len() == 8 {
        u8::from_str_radix(&hex[6..8], 16)?
    } else {
        255
    };
    Ok([
        u8::from_str_radix(&hex[0..2], 16)?,
        u8::from_str_radix(&hex[2..4], 16)?,
        u8::from_str_radix(&hex[4..6], 16)?,
        alpha,
    ])
}

fn rgb_of(rgba: [u8; 4]) -> [u8; 3] {
    [rgba[0], rgba[1], rgba[2]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn parses_colors_with_and_without_alpha() {
        assert_eq!(parse_hex_color("#FFFFFF").unwrap(), [255, 255, 255, 255]);
        assert_eq!(parse_hex_color("000000C8").unwrap(), [0, 0, 0, 200]);
        assert!(parse_hex_color("#FFF").is_err());
        assert!(parse_hex_color("#GG0000").is_err());
    }

    #[test]
    fn layout_scales_with_frame() {
        let layout = CaptionLayout::for_frame(720, 1280, &CaptionConfig::default());
        assert_eq!(layout.font_size, 51.0);
        assert_eq!(layout.padding_x, 14);
        assert_eq!(layout.padding_top, 12);
        assert_eq!(layout.padding_bottom, 25);
        assert_eq!(layout.bottom_offset, 300);
    }

    #[test]
    fn translucent_overlay_darkens_frame() {
        let mut frame = RgbImage::from_pixel(4, 4, Rgb([200, 200, 200]));
        let overlay = RgbaImage::from_pixel(2, 2, Rgba([0, 0, 0, 200]));
        blend_onto(&mut frame, &overlay, 1, 1);

        let darkened = (200.0 * (1.0 - 200.0 / 255.0) as f32).round() as u8;
        assert_eq!(frame.get_pixel(1, 1).0, [darkened; 3]);
        assert_eq!(frame.get_pixel(2, 2).0, [darkened; 3]);
        assert_eq!(frame.get_pixel(0, 0).0, [200; 3]);
        assert_eq!(frame.get_pixel(3, 3).0, [200; 3]);
    }

    #[test]
    fn overlay_outside_frame_is_clipped() {
        let mut frame = RgbImage::from_pixel(3, 3, Rgb([10, 10, 10]));
        let overlay = RgbaImage::from_pixel(5, 5, Rgba([255, 255, 255, 255]));
        blend_onto(&mut frame, &overlay, -4, 2);
        assert_eq!(frame.get_pixel(0, 2).0, [255; 3]);
        assert_eq!(frame.get_pixel(1, 2).0, [10; 3]);
    }

    #[test]
    fn white_ink_over_dark_box_stays_opaque_white() {
        let px = paint_over(Rgba([0, 0, 0, 200]), [255, 255, 255], 255);
        assert_eq!(px, Rgba([255, 255, 255, 255]));
        let half = paint_over(Rgba([0, 0, 0, 0]), [255, 255, 255], 128);
        assert_eq!(half.0[0], 255);
        assert_eq!(half.0[3], 128);
    }

    #[test]
    fn existing_font_is_preferred() {
        let tmp = tempfile::tempdir().unwrap();
        let font = tmp.path().join("arial.ttf");
        std::fs::write(&font, b"not really a font").unwrap();
        assert_eq!(resolve_font_path(&font), Some(font.clone()));
        assert!(load_font(&font).is_err());
    }
}
