use std::path::{Path, PathBuf};

use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_text_mut};
use tracing::warn;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);
const CYAN: Rgb<u8> = Rgb([0, 255, 255]);

const FONT_CANDIDATES: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/noto/NotoSans-Regular.ttf",
    "/usr/share/fonts/truetype/freefont/FreeSans.ttf",
];

use crate::pose::TagObservation;

/// Draws detection results onto the frame. Rendering is best-effort: all
/// primitives clip at the image bounds, and text is skipped entirely when
/// no usable font is found on the system.
pub struct OverlayRenderer {
    font: Option<FontVec>,
}

impl OverlayRenderer {
    pub fn new(font_path: Option<&Path>) -> Self {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(path) = font_path {
            candidates.push(path.to_path_buf());
        }
        candidates.extend(FONT_CANDIDATES.iter().map(PathBuf::from));

        let font = candidates.iter().find_map(|p| load_font(p));
        if font.is_none() {
            warn!("no overlay font found, text annotations disabled");
        }
        Self { font }
    }

    /// Annotates one frame in place: status lines, then for each tag its
    /// corner polygon, center marker and labels.
    pub fn render(&self, img: &mut RgbImage, frame_count: u64, tags: &[TagObservation]) {
        self.text(img, 10, 12, 24.0, WHITE, &format!("Frame: {frame_count}"));
        let count_color = if tags.is_empty() { WHITE } else { GREEN };
        self.text(
            img,
            10,
            38,
            24.0,
            count_color,
            &format!("Tags Detected: {}", tags.len()),
        );

        for tag in tags {
            self.draw_tag(img, tag);
        }
    }

    fn draw_tag(&self, img: &mut RgbImage, tag: &TagObservation) {
        let pts: Vec<(i32, i32)> = tag
            .corners
            .iter()
            .map(|c| (c[0].round() as i32, c[1].round() as i32))
            .collect();
        for i in 0..4 {
            let (x0, y0) = pts[i];
            let (x1, y1) = pts[(i + 1) % 4];
            draw_line_thick(img, x0, y0, x1, y1, GREEN);
        }

        let (cx, cy) = (tag.center[0].round() as i32, tag.center[1].round() as i32);
        draw_filled_circle_mut(img, (cx, cy), 5, RED);

        self.text(img, cx - 30, cy - 40, 28.0, RED, &format!("ID: {}", tag.id));

        let t = &tag.pose.translation;
        self.text(
            img,
            cx - 80,
            cy + 20,
            18.0,
            CYAN,
            &format!("X:{:.2}m Y:{:.2}m Z:{:.2}m", t.x, t.y, t.z),
        );
        self.text(
            img,
            cx - 80,
            cy + 40,
            18.0,
            CYAN,
            &format!(
                "R:{:.1} P:{:.1} Y:{:.1}",
                tag.euler.roll_deg, tag.euler.pitch_deg, tag.euler.yaw_deg
            ),
        );
    }

    fn text(&self, img: &mut RgbImage, x: i32, y: i32, size: f32, color: Rgb<u8>, s: &str) {
        if let Some(font) = &self.font {
            draw_text_mut(img, color, x, y, PxScale::from(size), font, s);
        }
    }
}

fn load_font(path: &Path) -> Option<FontVec> {
    let data = std::fs::read(path).ok()?;
    FontVec::try_from_vec(data).ok()
}

fn draw_line_thick(img: &mut RgbImage, mut x0: i32, mut y0: i32, x1: i32, y1: i32, color: Rgb<u8>) {
    let dx = (x1 - x0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let dy = -(y1 - y0).abs();
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    loop {
        paint_thick(img, x0, y0, color);
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

fn paint_thick(img: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    for dy in -1..=1 {
        for dx in -1..=1 {
            let px = x + dx;
            let py = y + dy;
            if px >= 0 && py >= 0 && (px as u32) < img.width() && (py as u32) < img.height() {
                img.put_pixel(px as u32, py as u32, color);
            }
        }
    }
}
