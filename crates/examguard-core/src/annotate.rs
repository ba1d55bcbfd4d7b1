//! Preview rendering: a rectangle per face and a label bar above it,
//! green for the expected user, red for intruders.

use crate::decision::FaceTag;
use crate::types::BoundingBox;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

const BOX_THICKNESS: u32 = 6;
const LABEL_BAR_HEIGHT: u32 = 14;
const USER_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const INTRUDER_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

fn color_for(tag: FaceTag) -> Rgb<u8> {
    match tag {
        FaceTag::User => USER_COLOR,
        FaceTag::Intruder => INTRUDER_COLOR,
    }
}

/// Draw every `(box, tag)` onto `frame` in place.
pub fn annotate(frame: &mut RgbImage, faces: &[(BoundingBox, FaceTag)]) {
    for (face, tag) in faces {
        let color = color_for(*tag);

        // Nested outlines, shrinking inwards, give the stroke its width.
        for inset in 0..BOX_THICKNESS {
            let w = face.width.saturating_sub(2 * inset);
            let h = face.height.saturating_sub(2 * inset);
            if w == 0 || h == 0 {
                break;
            }
            let rect = Rect::at((face.x + inset) as i32, (face.y + inset) as i32).of_size(w, h);
            draw_hollow_rect_mut(frame, rect, color);
        }

        // Label bar sits above the box, or inside its top edge at the frame border.
        let bar_y = face.y.checked_sub(LABEL_BAR_HEIGHT).unwrap_or(face.y);
        if face.width > 0 {
            let bar = Rect::at(face.x as i32, bar_y as i32).of_size(face.width, LABEL_BAR_HEIGHT);
            draw_filled_rect_mut(frame, bar, color);
        }
    }
}
