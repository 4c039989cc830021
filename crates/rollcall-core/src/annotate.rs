//! Drawing recognition marks onto frames.

use crate::types::BoundingBox;
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use std::path::Path;

const GREEN: Rgb<u8> = Rgb([0, 255, 0]);
const RED: Rgb<u8> = Rgb([255, 0, 0]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);
const WHITE: Rgb<u8> = Rgb([255, 255, 255]);

const BOX_THICKNESS: u32 = 2;
const LABEL_HEIGHT: u32 = 22;
const LABEL_PAD_X: i32 = 4;
const LABEL_SCALE: f32 = 16.0;

/// What happened to one detected region.
#[derive(Debug, Clone, PartialEq)]
pub enum Mark {
    Recognized { name: String },
    Unknown,
    /// The extractor raised an error for this region.
    Error,
    /// The extractor returned no embedding for this region.
    NoFace,
}

impl Mark {
    pub fn label(&self) -> &str {
        match self {
            Mark::Recognized { name } => name,
            Mark::Unknown => "Unknown",
            Mark::Error => "Error",
            Mark::NoFace => "No Face",
        }
    }

    fn colors(&self) -> (Rgb<u8>, Rgb<u8>) {
        match self {
            Mark::Recognized { .. } => (GREEN, BLACK),
            _ => (RED, WHITE),
        }
    }
}

/// A region and the mark it received.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub region: BoundingBox,
    pub mark: Mark,
}

/// Draws annotations in place. Labels need a font; boxes do not.
#[derive(Default)]
pub struct Annotator {
    font: Option<FontVec>,
}

impl Annotator {
    pub fn new(font: Option<FontVec>) -> Self {
        Self { font }
    }

    /// Load a TTF/OTF label font. An unreadable or invalid font logs a
    /// warning and leaves labels disabled.
    pub fn with_font_file(path: &Path) -> Self {
        let font = std::fs::read(path)
            .map_err(|e| e.to_string())
            .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
        match font {
            Ok(font) => Self::new(Some(font)),
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "label font unavailable; drawing boxes only");
                Self::new(None)
            }
        }
    }

    pub fn draw(&self, frame: &mut RgbImage, annotation: &Annotation) {
        let Some((x, y, w, h)) = annotation.region.clamp_to(frame.width(), frame.height()) else {
            return;
        };
        let (fill, text) = annotation.mark.colors();
        let (x, y) = (x as i32, y as i32);

        for inset in 0..BOX_THICKNESS {
            if w <= 2 * inset || h <= 2 * inset {
                break;
            }
            let rect = Rect::at(x + inset as i32, y + inset as i32)
                .of_size(w - 2 * inset, h - 2 * inset);
            draw_hollow_rect_mut(frame, rect, fill);
        }

        let strip_h = LABEL_HEIGHT.min(h);
        let strip_y = y + (h - strip_h) as i32;
        draw_filled_rect_mut(frame, Rect::at(x, strip_y).of_size(w, strip_h), fill);

        if let Some(font) = &self.font {
            let text_y = strip_y + (strip_h as i32 - LABEL_SCALE as i32) / 2;
            draw_text_mut(
                frame,
                text,
                x + LABEL_PAD_X,
                text_y,
                PxScale::from(LABEL_SCALE),
                font,
                annotation.mark.label(),
            );
        }
    }
}
