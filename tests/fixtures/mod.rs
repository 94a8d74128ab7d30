//! Canned inputs shared by the integration tests.

use std::io::Cursor;

use charforge::models::curation::SourceImage;

/// A small valid PNG, as an image generator would return it.
pub fn png_bytes() -> Vec<u8> {
    let image = image::RgbImage::from_pixel(4, 4, image::Rgb([200, 120, 40]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, image::ImageFormat::Png)
        .expect("encode png fixture");
    out.into_inner()
}

pub fn source_image(n: usize) -> SourceImage {
    SourceImage {
        source_id: format!("civitai-{n}"),
        url: format!("https://image.example.com/{n}.jpeg"),
        width: Some(832),
        height: Some(1216),
        author: Some("painter".to_string()),
        reactions: 100 + n as u64,
    }
}

pub fn source_images(range: std::ops::Range<usize>) -> Vec<SourceImage> {
    range.map(source_image).collect()
}
