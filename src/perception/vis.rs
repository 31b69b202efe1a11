use std::fs;

use anyhow::{anyhow, Context, Result};
use image::{DynamicImage, RgbImage};
use raqote::{DrawOptions, DrawTarget, LineJoin, PathBuilder, SolidSource, Source, StrokeStyle};
use rusttype::{point, Font, Scale};
use show_image::{
    event::{VirtualKeyCode, WindowEvent},
    AsImageView, WindowOptions, WindowProxy,
};
use tracing::{span, trace, Level};

use super::segment::SegmentationMap;
use super::{FramePerception, ObjectClass, SurfaceClass};

pub fn get_color_from_object_class(class: ObjectClass) -> SolidSource {
    let (r, g, b) = match class {
        ObjectClass::Car => (0x00, 0xc8, 0xff),
        ObjectClass::Truck => (0x00, 0x64, 0xff),
        ObjectClass::Bus => (0x00, 0xff, 0xc8),
        ObjectClass::Motorcycle => (0xff, 0x96, 0x00),
        ObjectClass::Bicycle => (0xff, 0xc8, 0x00),
        ObjectClass::Person => (0xff, 0x00, 0x00),
        ObjectClass::TrafficLight => (0x00, 0xff, 0x00),
        ObjectClass::TrafficSign => (0xff, 0x00, 0xff),
    };

    SolidSource {
        r,
        g,
        b,
        a: 0xff,
    }
}

/// Overlay color of a segmentation class index. Indices outside the
/// surface label set get no overlay.
pub fn get_color_from_surface_index(index: u8) -> Option<[u8; 3]> {
    let class = SurfaceClass::try_from(index).ok()?;
    let color = match class {
        SurfaceClass::Road => [128, 64, 128],
        SurfaceClass::Sidewalk => [244, 35, 232],
        SurfaceClass::Building => [70, 70, 70],
        SurfaceClass::Vegetation => [107, 142, 35],
        SurfaceClass::Sky => [70, 130, 180],
        SurfaceClass::Vehicle => [0, 0, 142],
        SurfaceClass::Person => [220, 20, 60],
        SurfaceClass::Background => return None,
    };

    Some(color)
}

pub fn draw_rect_on_draw_target(
    dt: &mut DrawTarget,
    rect: &super::PixelBox,
    color: SolidSource,
    width: f32,
) {
    let mut pb = PathBuilder::new();
    pb.rect(
        rect.x1 as f32,
        rect.y1 as f32,
        rect.width() as f32,
        rect.height() as f32,
    );
    let path = pb.finish();

    dt.stroke(
        &path,
        &Source::Solid(color),
        &StrokeStyle {
            join: LineJoin::Round,
            width,
            ..StrokeStyle::default()
        },
        &DrawOptions::default(),
    );
}

pub fn draw_text_on_draw_target(
    dt: &mut DrawTarget,
    font: &Font<'_>,
    text: &str,
    position: (f32, f32),
    font_size: f32,
) {
    let font_scale = Scale::uniform(font_size);
    let v_metrics = font.v_metrics(font_scale);

    let (text_x, text_y) = position;
    let offset = point(text_x + font_size / 4.0, text_y + v_metrics.ascent);

    let glyphs: Vec<_> = font.layout(text, font_scale, offset).collect();
    for glyph in glyphs {
        if let Some(bbox) = glyph.pixel_bounding_box() {
            glyph.draw(|x, y, v| {
                dt.fill_rect(
                    (x as i32 + bbox.min.x) as f32,
                    (y as i32 + bbox.min.y) as f32,
                    1.0,
                    1.0,
                    &Source::Solid(SolidSource {
                        r: 0xff,
                        g: 0xff,
                        b: 0xff,
                        a: 0xff,
                    }),
                    &DrawOptions {
                        alpha: v,
                        ..DrawOptions::default()
                    },
                );
            });
        }
    }
}

/// Alpha-blends the class map onto the frame, looking classes up by
/// nearest neighbor from map resolution to frame resolution.
pub fn blend_mask(image: &mut RgbImage, mask: &SegmentationMap, alpha: f32) {
    let (frame_width, frame_height) = image.dimensions();
    if frame_width == 0 || frame_height == 0 || mask.width() == 0 || mask.height() == 0 {
        return;
    }

    for (x, y, pixel) in image.enumerate_pixels_mut() {
        let mask_x = x * mask.width() / frame_width;
        let mask_y = y * mask.height() / frame_height;

        if let Some(color) = get_color_from_surface_index(mask.class_at(mask_x, mask_y)) {
            for channel in 0..3 {
                let blended =
                    (1.0 - alpha) * pixel[channel] as f32 + alpha * color[channel] as f32;
                pixel[channel] = blended.round() as u8;
            }
        }
    }
}

/// Composites a premultiplied-ARGB draw target over an opaque RGB frame.
pub fn composite_draw_target(image: &mut RgbImage, dt: &DrawTarget) {
    let data = dt.get_data();

    for (index, pixel) in image.pixels_mut().enumerate() {
        let argb = data[index];
        let a = (argb >> 24) & 0xff;
        if a == 0 {
            continue;
        }

        let source = [(argb >> 16) & 0xff, (argb >> 8) & 0xff, argb & 0xff];
        for channel in 0..3 {
            let blended = source[channel] + pixel[channel] as u32 * (255 - a) / 255;
            pixel[channel] = blended.min(255) as u8;
        }
    }
}

/// Draws boxes, labels and the mask overlay onto a copy of the frame.
pub struct Annotator {
    font: Font<'static>,
    mask_alpha: f32,
}

impl Annotator {
    pub fn new(font_path: &str, mask_alpha: f32) -> Result<Self> {
        let span = span!(Level::TRACE, "Annotator::new");
        let _enter = span.enter();

        trace!("Loading font from {font_path}");
        let font_data = fs::read(font_path)
            .with_context(|| format!("Failed to read font from {font_path}"))?;
        let font = Font::try_from_vec(font_data)
            .ok_or_else(|| anyhow!("Failed to load font from {font_path}"))?;

        Ok(Self {
            font,
            mask_alpha,
        })
    }

    pub fn annotate(&self, frame: &RgbImage, perception: &FramePerception) -> RgbImage {
        let span = span!(Level::TRACE, "Annotator::annotate");
        let _enter = span.enter();

        let (width, height) = frame.dimensions();
        let mut annotated = frame.clone();

        blend_mask(&mut annotated, &perception.mask, self.mask_alpha);

        let mut dt = DrawTarget::new(width as i32, height as i32);
        for object in &perception.objects {
            let color = get_color_from_object_class(object.class);
            draw_rect_on_draw_target(&mut dt, &object.bbox, color, 3.0);

            let text = format!("{} {:.2}", object.class, object.confidence);
            draw_text_on_draw_target(
                &mut dt,
                &self.font,
                &text,
                (object.bbox.x1 as f32, object.bbox.y1 as f32),
                18.0,
            );
        }
        composite_draw_target(&mut annotated, &dt);

        annotated
    }
}

/// Live window showing the annotated frame each iteration. Escape or Q
/// requests a quit, as does closing the window.
pub struct FrameWindow {
    proxy: WindowProxy,
    events: std::sync::mpsc::Receiver<WindowEvent>,
}

impl FrameWindow {
    pub fn open(title: &str, size: (u32, u32)) -> Result<Self> {
        let span = span!(Level::TRACE, "FrameWindow::open");
        let _enter = span.enter();

        let title = title.to_string();
        let proxy = show_image::context().run_function_wait(move |context| -> Result<_> {
            let window = context
                .create_window(
                    title,
                    WindowOptions {
                        size: Some([size.0, size.1]),
                        ..WindowOptions::default()
                    },
                )
                .context("Failed to create window")?;
            Ok(window.proxy())
        })?;

        let events = proxy
            .event_channel()
            .context("Failed to open window event channel")?;

        Ok(Self { proxy, events })
    }

    pub fn show(&self, frame: &RgbImage) -> Result<()> {
        let image = DynamicImage::ImageRgb8(frame.clone());

        self.proxy
            .run_function_wait(move |mut window| -> Result<()> {
                window.set_image(
                    "frame",
                    &image
                        .as_image_view()
                        .context("Failed to build image view of frame")?,
                );
                Ok(())
            })?
    }

    /// Drains pending window events and reports whether a quit was
    /// requested.
    pub fn quit_requested(&self) -> bool {
        let mut quit = false;
        while let Ok(event) = self.events.try_recv() {
            match event {
                WindowEvent::KeyboardInput(event) => {
                    let pressed_quit_key = matches!(
                        event.input.key_code,
                        Some(VirtualKeyCode::Escape) | Some(VirtualKeyCode::Q)
                    );
                    if pressed_quit_key && event.input.state.is_pressed() {
                        quit = true;
                    }
                }
                WindowEvent::CloseRequested(_) | WindowEvent::Destroyed(_) => {
                    quit = true;
                }
                _ => {}
            }
        }

        quit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::PixelBox;
    use image::Rgb;
    use ndarray::Array3;

    fn uniform_mask(class: u8) -> SegmentationMap {
        // One class channel wins everywhere, producing a map of `class`.
        let mut logits = Array3::<f32>::zeros((class as usize + 1, 2, 2));
        for y in 0..2 {
            for x in 0..2 {
                logits[[class as usize, y, x]] = 1.0;
            }
        }
        SegmentationMap::from_logits(logits.view()).unwrap()
    }

    #[test]
    fn test_object_colors_are_distinct() {
        let colors: std::collections::HashSet<_> = ObjectClass::all()
            .iter()
            .map(|class| {
                let color = get_color_from_object_class(*class);
                (color.r, color.g, color.b)
            })
            .collect();

        assert_eq!(colors.len(), ObjectClass::all().len());
    }

    #[test]
    fn test_background_and_unknown_have_no_overlay() {
        assert!(get_color_from_surface_index(7).is_none());
        assert!(get_color_from_surface_index(200).is_none());
    }

    #[test]
    fn test_blend_mask_mixes_colors() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([100, 100, 100]));
        let mask = uniform_mask(0); // road, [128, 64, 128]

        blend_mask(&mut image, &mask, 0.5);

        assert_eq!(image.get_pixel(0, 0).0, [114, 82, 114]);
        assert_eq!(image.get_pixel(1, 1).0, [114, 82, 114]);
    }

    #[test]
    fn test_blend_mask_zero_alpha_is_identity() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30]));
        let mask = uniform_mask(0);

        blend_mask(&mut image, &mask, 0.0);

        assert_eq!(image.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_blend_mask_skips_background() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([10, 20, 30]));
        let mask = uniform_mask(7);

        blend_mask(&mut image, &mask, 0.9);

        assert_eq!(image.get_pixel(0, 0).0, [10, 20, 30]);
    }

    #[test]
    fn test_composite_draws_opaque_pixels() {
        let mut image = RgbImage::from_pixel(4, 4, Rgb([0, 0, 0]));
        let mut dt = DrawTarget::new(4, 4);
        dt.fill_rect(
            0.0,
            0.0,
            1.0,
            1.0,
            &Source::Solid(SolidSource {
                r: 0xff,
                g: 0x00,
                b: 0x00,
                a: 0xff,
            }),
            &DrawOptions::default(),
        );

        composite_draw_target(&mut image, &dt);

        assert_eq!(image.get_pixel(0, 0).0, [255, 0, 0]);
        assert_eq!(image.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn test_composite_leaves_transparent_pixels() {
        let mut image = RgbImage::from_pixel(2, 2, Rgb([5, 6, 7]));
        let dt = DrawTarget::new(2, 2);

        composite_draw_target(&mut image, &dt);

        assert_eq!(image.get_pixel(0, 0).0, [5, 6, 7]);
        assert_eq!(image.get_pixel(1, 1).0, [5, 6, 7]);
    }

    #[test]
    fn test_rect_stroke_produces_pixels() {
        let mut dt = DrawTarget::new(16, 16);
        draw_rect_on_draw_target(
            &mut dt,
            &PixelBox {
                x1: 4,
                y1: 4,
                x2: 12,
                y2: 12,
            },
            SolidSource {
                r: 0xff,
                g: 0xff,
                b: 0xff,
                a: 0xff,
            },
            2.0,
        );

        let data = dt.get_data();
        assert!(
            data.iter().any(|&pixel| pixel != 0),
            "Stroke should have produced pixels"
        );
    }
}
