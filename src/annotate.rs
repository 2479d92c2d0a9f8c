//! Frame annotation.
//!
//! `annotate` never touches the input frame: it draws on a copy. What gets
//! drawn is decided by `Overlay::from_state`:
//!
//! | lock            | drawn                                          |
//! |-----------------|------------------------------------------------|
//! | none            | every detection, palette colour, label + score |
//! | set, in frame   | only the locked box, red, 3 px, tracking label |
//! | set, not found  | nothing                                        |

use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::{BBox, Detection};
use crate::frame::Frame;
use crate::store::StreamState;

const LOCKED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LOCKED_STROKE: u32 = 3;
const LOCKED_TEXT_SCALE: u32 = 2;
const DEFAULT_STROKE: u32 = 2;
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;
const GLYPH_ADVANCE: u32 = 6;

const PALETTE: [[u8; 3]; 10] = [
    [255, 56, 56],
    [255, 157, 151],
    [255, 112, 31],
    [255, 178, 29],
    [207, 210, 49],
    [72, 249, 10],
    [26, 147, 52],
    [0, 212, 187],
    [52, 69, 147],
    [203, 56, 255],
];

/// What to draw on a frame.
#[derive(Clone, Debug, PartialEq)]
pub enum Overlay {
    All(Vec<Detection>),
    Locked(Detection),
    Lost { selected_id: i64 },
}

impl Overlay {
    pub fn from_state(state: &StreamState) -> Self {
        match state.selected_id {
            None => Overlay::All(state.detections.clone()),
            Some(selected_id) => match state.selected_detection() {
                Some(detection) => Overlay::Locked(detection.clone()),
                None => Overlay::Lost { selected_id },
            },
        }
    }
}

/// Render `overlay` onto a copy of `frame`.
pub fn annotate(frame: &Frame, overlay: &Overlay) -> RgbImage {
    let mut image = frame.image().clone();
    match overlay {
        Overlay::All(detections) => {
            for detection in detections {
                draw_detection(&mut image, detection);
            }
        }
        Overlay::Locked(detection) => draw_locked(&mut image, detection),
        Overlay::Lost { .. } => {}
    }
    image
}

pub fn tracking_label(id: i64) -> String {
    format!("TRACKING ID: {}", id)
}

fn label_color(label: &str) -> Rgb<u8> {
    let hash = label
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    Rgb(PALETTE[hash as usize % PALETTE.len()])
}

fn draw_detection(image: &mut RgbImage, detection: &Detection) {
    let color = label_color(&detection.label);
    let Some((x1, y1, _, _)) = draw_box(image, &detection.bbox, color, DEFAULT_STROKE) else {
        return;
    };

    let text = format!("{} {:.2}", detection.label, detection.confidence);
    let text_w = text_width(&text, 1);
    let tag_h = GLYPH_HEIGHT + 4;
    let tag_y = if y1 >= tag_h as i32 { y1 - tag_h as i32 } else { y1 };
    draw_filled_rect_mut(
        image,
        Rect::at(x1, tag_y).of_size(text_w + 4, tag_h),
        color,
    );
    draw_text(image, x1 + 2, tag_y + 2, &text, LABEL_TEXT_COLOR, 1);
}

fn draw_locked(image: &mut RgbImage, detection: &Detection) {
    let Some((x1, y1, _, _)) = draw_box(image, &detection.bbox, LOCKED_COLOR, LOCKED_STROKE) else {
        return;
    };
    let text_h = (GLYPH_HEIGHT * LOCKED_TEXT_SCALE) as i32;
    let text_y = if y1 - 10 - text_h >= 0 {
        y1 - 10 - text_h
    } else {
        y1 + LOCKED_STROKE as i32 + 2
    };
    draw_text(
        image,
        x1,
        text_y,
        &tracking_label(detection.id),
        LOCKED_COLOR,
        LOCKED_TEXT_SCALE,
    );
}

/// Draw a hollow box clamped to the image. Returns the clamped corners, or
/// `None` when nothing of the box is visible.
fn draw_box(
    image: &mut RgbImage,
    bbox: &BBox,
    color: Rgb<u8>,
    stroke: u32,
) -> Option<(i32, i32, i32, i32)> {
    if !bbox.is_valid() || image.width() == 0 || image.height() == 0 {
        return None;
    }
    let max_x = image.width() as f32 - 1.0;
    let max_y = image.height() as f32 - 1.0;
    if bbox.x2 < 0.0 || bbox.y2 < 0.0 || bbox.x1 > max_x || bbox.y1 > max_y {
        return None;
    }
    let x1 = bbox.x1.clamp(0.0, max_x).round() as i32;
    let y1 = bbox.y1.clamp(0.0, max_y).round() as i32;
    let x2 = bbox.x2.clamp(0.0, max_x).round() as i32;
    let y2 = bbox.y2.clamp(0.0, max_y).round() as i32;

    for inset in 0..stroke as i32 {
        let w = x2 - x1 - 2 * inset + 1;
        let h = y2 - y1 - 2 * inset + 1;
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            image,
            Rect::at(x1 + inset, y1 + inset).of_size(w as u32, h as u32),
            color,
        );
    }
    Some((x1, y1, x2, y2))
}

fn text_width(text: &str, scale: u32) -> u32 {
    text.chars().count() as u32 * GLYPH_ADVANCE * scale
}

fn draw_text(image: &mut RgbImage, x: i32, y: i32, text: &str, color: Rgb<u8>, scale: u32) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    let scale = scale.max(1) as i32;
    let mut pen_x = x;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(rows) = glyph(ch) {
            for (row, bits) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH as i32 {
                    if (bits >> (GLYPH_WIDTH as i32 - 1 - col)) & 1 == 0 {
                        continue;
                    }
                    for dy in 0..scale {
                        for dx in 0..scale {
                            let px = pen_x + col * scale + dx;
                            let py = y + row as i32 * scale + dy;
                            if px >= 0 && py >= 0 && px < width && py < height {
                                image.put_pixel(px as u32, py as u32, color);
                            }
                        }
                    }
                }
            }
        }
        pen_x += GLYPH_ADVANCE as i32 * scale;
    }
}

fn glyph(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

    fn black_frame() -> Frame {
        Frame::from_image(RgbImage::from_pixel(200, 120, BLACK), 0)
    }

    fn scenario_state(selected: Option<i64>) -> StreamState {
        let mut state = StreamState::new("scenario");
        state.detections = vec![
            Detection::new(0, BBox::new(10.0, 10.0, 50.0, 50.0), "person", 0.9),
            Detection::new(1, BBox::new(60.0, 10.0, 100.0, 50.0), "person", 0.8),
        ];
        state.selected_id = selected;
        state
    }

    #[test]
    fn overlay_follows_lock_state() {
        assert!(matches!(
            Overlay::from_state(&scenario_state(None)),
            Overlay::All(ref d) if d.len() == 2
        ));
        assert!(matches!(
            Overlay::from_state(&scenario_state(Some(1))),
            Overlay::Locked(ref d) if d.id == 1
        ));
        assert_eq!(
            Overlay::from_state(&scenario_state(Some(9))),
            Overlay::Lost { selected_id: 9 }
        );
    }

    #[test]
    fn locked_draws_only_the_selected_box_in_red() {
        let frame = black_frame();
        let out = annotate(&frame, &Overlay::from_state(&scenario_state(Some(0))));

        assert_eq!(*out.get_pixel(30, 50), LOCKED_COLOR);
        assert_eq!(*out.get_pixel(30, 48), LOCKED_COLOR);
        assert_eq!(*out.get_pixel(50, 40), LOCKED_COLOR);
        assert_eq!(*out.get_pixel(80, 50), BLACK);
        assert_eq!(*out.get_pixel(100, 40), BLACK);
    }

    #[test]
    fn unlocked_draws_every_box() {
        let frame = black_frame();
        let out = annotate(&frame, &Overlay::from_state(&scenario_state(None)));
        assert_ne!(*out.get_pixel(30, 50), BLACK);
        assert_ne!(*out.get_pixel(80, 50), BLACK);
        assert_ne!(*out.get_pixel(30, 50), LOCKED_COLOR);
    }

    #[test]
    fn lost_lock_returns_clean_frame() {
        let frame = black_frame();
        let out = annotate(&frame, &Overlay::from_state(&scenario_state(Some(7))));
        assert_eq!(&out, frame.image());
    }

    #[test]
    fn input_frame_is_not_mutated() {
        let frame = black_frame();
        let before = frame.image().clone();
        let _ = annotate(&frame, &Overlay::from_state(&scenario_state(None)));
        let _ = annotate(&frame, &Overlay::from_state(&scenario_state(Some(0))));
        assert_eq!(frame.image(), &before);
    }

    #[test]
    fn boxes_outside_the_frame_are_skipped_or_clamped() {
        let frame = black_frame();
        let overlay = Overlay::All(vec![
            Detection::new(0, BBox::new(500.0, 500.0, 600.0, 600.0), "ghost", 0.9),
            Detection::new(1, BBox::new(-20.0, -20.0, 10.0, 10.0), "corner", 0.9),
        ]);
        let out = annotate(&frame, &overlay);
        assert_ne!(*out.get_pixel(10, 5), BLACK);
    }

    #[test]
    fn tracking_label_format() {
        assert_eq!(tracking_label(0), "TRACKING ID: 0");
        assert_eq!(tracking_label(42), "TRACKING ID: 42");
    }
}
