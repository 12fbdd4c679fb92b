use birdwatch_types::{
    taxonomy,
    vision::{Detection, Frame},
    Result,
};
use image::{Rgb, RgbImage};

use crate::{
    annotation_error,
    font::{glyph, text_width, GLYPH_ADVANCE, GLYPH_HEIGHT, GLYPH_WIDTH},
};

pub const TARGET_CLASS_COLOR: Rgb<u8> = Rgb([0, 220, 0]);
pub const OTHER_CLASS_COLOR: Rgb<u8> = Rgb([255, 140, 0]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([0, 0, 0]);
const LABEL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;

/// Produces an annotated copy of a frame. The input is never modified.
pub trait FrameAnnotator: Send {
    fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame>;
}

/// Burns detection boxes and `name confidence` labels into a copy of a frame.
#[derive(Debug, Clone, Copy)]
pub struct Annotator {
    target_class: u32,
}

impl Annotator {
    pub fn new(target_class: u32) -> Self {
        Self { target_class }
    }

    fn color_for(&self, detection: &Detection) -> Rgb<u8> {
        if detection.class_id == self.target_class {
            TARGET_CLASS_COLOR
        } else {
            OTHER_CLASS_COLOR
        }
    }
}

impl FrameAnnotator for Annotator {
    fn annotate(&self, frame: &Frame, detections: &[Detection]) -> Result<Frame> {
        let mut image = frame.to_rgb_image().ok_or_else(|| {
            annotation_error(format!(
                "frame buffer of {} bytes does not match {}x{}",
                frame.data.len(),
                frame.width,
                frame.height
            ))
        })?;
        if frame.is_empty() {
            return Err(annotation_error("cannot annotate an empty frame"));
        }

        // Boxes first so labels stay legible where boxes overlap.
        for detection in detections {
            let (left, top, right, bottom) = detection.bbox.clamp_to(frame.width, frame.height);
            let color = self.color_for(detection);
            for inset in 0..BOX_THICKNESS {
                draw_rectangle(
                    &mut image,
                    left + inset,
                    top + inset,
                    right - inset,
                    bottom - inset,
                    color,
                );
            }
        }
        for detection in detections {
            let (left, top, _, _) = detection.bbox.clamp_to(frame.width, frame.height);
            let label = format!(
                "{} {:.2}",
                taxonomy::display_name(detection.class_id),
                detection.confidence
            );
            let strip_height = GLYPH_HEIGHT + 2 * LABEL_PADDING;
            let strip_top = if top - strip_height >= 0 {
                top - strip_height
            } else {
                top
            };
            fill_rect(
                &mut image,
                left,
                strip_top,
                left + text_width(&label) + 2 * LABEL_PADDING - 1,
                strip_top + strip_height - 1,
                self.color_for(detection),
            );
            draw_label(
                &mut image,
                left + LABEL_PADDING,
                strip_top + LABEL_PADDING,
                &label,
                LABEL_TEXT_COLOR,
            );
        }

        Ok(Frame::from_rgb(
            frame.width,
            frame.height,
            image.into_raw(),
            frame.captured_at,
        ))
    }
}

fn put_pixel(image: &mut RgbImage, x: i32, y: i32, color: Rgb<u8>) {
    if x >= 0 && y >= 0 && (x as u32) < image.width() && (y as u32) < image.height() {
        image.put_pixel(x as u32, y as u32, color);
    }
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    if left > right || top > bottom {
        return;
    }
    for x in left..=right {
        put_pixel(image, x, top, color);
        put_pixel(image, x, bottom, color);
    }
    for y in top..=bottom {
        put_pixel(image, left, y, color);
        put_pixel(image, right, y, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    for y in top..=bottom {
        for x in left..=right {
            put_pixel(image, x, y, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    for ch in text.chars() {
        if let Some(rows) = glyph(ch) {
            for (row, pattern) in rows.iter().enumerate() {
                for col in 0..GLYPH_WIDTH {
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 {
                        put_pixel(image, x + col, y + row as i32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use birdwatch_types::vision::BoundingBox;
    use chrono::Local;

    fn blank(width: u32, height: u32) -> Frame {
        Frame::from_rgb(
            width,
            height,
            vec![255; (width * height * 3) as usize],
            Local::now(),
        )
    }

    fn pixel(frame: &Frame, x: u32, y: u32) -> [u8; 3] {
        let i = ((y * frame.width + x) * 3) as usize;
        [frame.data[i], frame.data[i + 1], frame.data[i + 2]]
    }

    #[test]
    fn draws_target_box_without_touching_input() {
        let frame = blank(120, 80);
        let detections = vec![Detection {
            class_id: 14,
            confidence: 0.9,
            bbox: BoundingBox::new(20.0, 40.0, 100.0, 70.0),
        }];
        let annotated = Annotator::new(14).annotate(&frame, &detections).expect("annotate");

        assert!(frame.data.iter().all(|&v| v == 255));
        assert_eq!(pixel(&annotated, 60, 70), TARGET_CLASS_COLOR.0);
        assert_eq!(pixel(&annotated, 20, 55), TARGET_CLASS_COLOR.0);
        // Label strip sits above the box's top-left corner.
        assert_eq!(pixel(&annotated, 21, 40 - 11), TARGET_CLASS_COLOR.0);
        assert_eq!(pixel(&annotated, 60, 55), [255, 255, 255]);
        assert_eq!(annotated.captured_at, frame.captured_at);
    }

    #[test]
    fn other_classes_use_other_color_and_label_moves_inside_at_top_edge() {
        let frame = blank(100, 60);
        let detections = vec![Detection {
            class_id: 0,
            confidence: 0.5,
            bbox: BoundingBox::new(10.0, 2.0, 50.0, 40.0),
        }];
        let annotated = Annotator::new(14).annotate(&frame, &detections).expect("annotate");
        assert_eq!(pixel(&annotated, 10, 30), OTHER_CLASS_COLOR.0);
        assert_eq!(pixel(&annotated, 11, 2), OTHER_CLASS_COLOR.0);
    }

    #[test]
    fn mismatched_buffer_is_annotation_error() {
        let frame = Frame::from_rgb(10, 10, vec![0; 7], Local::now());
        let err = Annotator::new(14).annotate(&frame, &[]).expect_err("bad buffer");
        assert!(matches!(err, birdwatch_types::BirdwatchError::Annotation(_)));
    }
}
