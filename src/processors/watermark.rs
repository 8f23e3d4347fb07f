use ab_glyph::{FontVec, PxScale};
use async_trait::async_trait;
use image::{DynamicImage, Rgba};
use imageproc::drawing::{draw_text_mut, text_size};
use serde_json::json;

use super::{Processor, ProcessorDescriptor, ProcessorOutput};
use crate::errors::{FsError, FsResult};
use crate::models::{ConfigField, FieldType, SelectOption};

const MARGIN: i32 = 10;
const DEFAULT_FONT_SIZE: u32 = 24;

/// Candidate font files, tried in order when no `font_path` is configured.
const FONT_PATHS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    TopLeft,
    Center,
    BottomRight,
}

impl Anchor {
    fn parse(value: &str) -> Self {
        match value {
            "top-left" => Anchor::TopLeft,
            "center" => Anchor::Center,
            _ => Anchor::BottomRight,
        }
    }

    fn position(&self, img_w: i32, img_h: i32, text_w: i32, text_h: i32) -> (i32, i32) {
        match self {
            Anchor::TopLeft => (MARGIN, MARGIN),
            Anchor::Center => ((img_w - text_w) / 2, (img_h - text_h) / 2),
            Anchor::BottomRight => (img_w - text_w - MARGIN, img_h - text_h - MARGIN),
        }
    }
}

/// Draws semitransparent white text onto an image and returns JPEG bytes.
pub struct WatermarkProcessor;

impl WatermarkProcessor {
    fn load_font(config: &serde_json::Value) -> FsResult<FontVec> {
        let configured = config.get("font_path").and_then(|v| v.as_str());
        let candidates: Vec<&str> = configured
            .into_iter()
            .chain(FONT_PATHS.iter().copied())
            .collect();
        for path in candidates {
            if let Ok(data) = std::fs::read(path) {
                if let Ok(font) = FontVec::try_from_vec(data) {
                    return Ok(font);
                }
            }
        }
        Err(FsError::internal(
            "no usable TrueType font found; set 'font_path' in the processor config",
        ))
    }
}

#[async_trait]
impl Processor for WatermarkProcessor {
    fn descriptor(&self) -> ProcessorDescriptor {
        ProcessorDescriptor {
            type_tag: "watermark",
            name: "Image watermark",
            supported_exts: &["jpg", "jpeg", "png", "bmp"],
            config_schema: vec![
                ConfigField::required("text", "Watermark text", FieldType::String),
                ConfigField::optional("position", "Position", FieldType::Select)
                    .with_default(json!("bottom-right"))
                    .with_options(vec![
                        SelectOption {
                            value: "top-left",
                            label: "Top left",
                        },
                        SelectOption {
                            value: "center",
                            label: "Center",
                        },
                        SelectOption {
                            value: "bottom-right",
                            label: "Bottom right",
                        },
                    ]),
                ConfigField::optional("font_size", "Font size", FieldType::Number)
                    .with_default(json!(DEFAULT_FONT_SIZE)),
            ],
            produces_file: true,
        }
    }

    async fn process(
        &self,
        input: &[u8],
        _path: &str,
        config: &serde_json::Value,
    ) -> FsResult<ProcessorOutput> {
        let text = config
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let anchor = Anchor::parse(
            config
                .get("position")
                .and_then(|v| v.as_str())
                .unwrap_or("bottom-right"),
        );
        let font_size = config
            .get("font_size")
            .and_then(|v| v.as_u64())
            .unwrap_or(DEFAULT_FONT_SIZE as u64) as f32;
        let font = Self::load_font(config)?;

        let input = input.to_vec();
        let bytes = tokio::task::spawn_blocking(move || -> FsResult<Vec<u8>> {
            let mut canvas = image::load_from_memory(&input)?.to_rgba8();
            let scale = PxScale::from(font_size);
            let (text_w, text_h) = text_size(scale, &font, &text);
            let (x, y) = anchor.position(
                canvas.width() as i32,
                canvas.height() as i32,
                text_w as i32,
                text_h as i32,
            );
            draw_text_mut(
                &mut canvas,
                Rgba([255u8, 255, 255, 128]),
                x.max(0),
                y.max(0),
                scale,
                &font,
                &text,
            );

            let mut out = Vec::new();
            DynamicImage::ImageRgba8(canvas)
                .to_rgb8()
                .write_to(
                    &mut std::io::Cursor::new(&mut out),
                    image::ImageFormat::Jpeg,
                )
                .map_err(FsError::from)?;
            Ok(out)
        })
        .await
        .map_err(|e| FsError::internal(e.to_string()))??;

        Ok(ProcessorOutput::File {
            bytes,
            mime: "image/jpeg",
        })
    }
}
