use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageEncoder, ImageFormat, RgbaImage};
use thiserror::Error;

use crate::options::Options;

/// Default JPEG quality used when the request does not specify one.
pub const DEFAULT_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("unable to decode image: {0}")]
    Decode(image::ImageError),
    #[error("unable to encode image: {0}")]
    Encode(image::ImageError),
}

/// Transforms image bytes according to the specified options and re-encodes
/// them. When the options include no transformation the input bytes are
/// returned unchanged.
///
/// The source format is detected from the image data. Without an explicit
/// format option the output keeps the source format, except for webp and
/// tiff sources which are always transcoded to a browser-compatible format
/// (png and jpeg respectively).
pub fn transform(data: &[u8], options: &Options) -> Result<Vec<u8>, TransformError> {
    if !options.transform() {
        return Ok(data.to_vec());
    }

    let source_format = image::guess_format(data).map_err(TransformError::Decode)?;
    let img = image::load_from_memory_with_format(data, source_format)
        .map_err(TransformError::Decode)?;

    let img = transform_image(img, options);

    encode(&img, output_format(options, source_format), options.quality)
}

fn output_format(options: &Options, source: ImageFormat) -> ImageFormat {
    match options.format.as_str() {
        "jpeg" => ImageFormat::Jpeg,
        "png" => ImageFormat::Png,
        "tiff" => ImageFormat::Tiff,
        _ => match source {
            ImageFormat::WebP => ImageFormat::Png,
            ImageFormat::Tiff => ImageFormat::Jpeg,
            ImageFormat::Jpeg | ImageFormat::Png | ImageFormat::Gif | ImageFormat::Bmp => source,
            _ => ImageFormat::Png,
        },
    }
}

/// Applies the pixel transformations: crop, resize, trim, rotate, then
/// flips.
fn transform_image(mut img: DynamicImage, options: &Options) -> DynamicImage {
    if let Some((x, y, w, h)) = crop_rect(img.width(), img.height(), options) {
        img = img.crop_imm(x, y, w, h);
    }

    let (w, h, resize) = resize_params(img.width(), img.height(), options);
    if resize {
        img = if options.fit && w > 0 && h > 0 {
            // fit within the bounding box without cropping
            img.resize(w, h, FilterType::Lanczos3)
        } else if w == 0 || h == 0 {
            let (w, h) = proportional_size(img.width(), img.height(), w, h);
            img.resize_exact(w, h, FilterType::Lanczos3)
        } else {
            // scale to fill the requested size, cropping centered
            img.resize_to_fill(w, h, FilterType::Lanczos3)
        };
    }

    if options.trim {
        img = trim_edges(img);
    }

    // rotation is counter-clockwise; invalid values are a no-op
    img = match options.rotate.rem_euclid(360) {
        90 => img.rotate270(),
        180 => img.rotate180(),
        270 => img.rotate90(),
        _ => img,
    };

    // flips happen after rotation
    if options.flip_vertical {
        img = img.flipv();
    }
    if options.flip_horizontal {
        img = img.fliph();
    }

    img
}

/// Interprets a size value: integers are exact pixels, floats in (0, 1) are
/// fractions of `max`, and negative values read as zero.
fn eval_dimension(f: f64, max: u32) -> u32 {
    if 0.0 < f && f < 1.0 {
        (max as f64 * f) as u32
    } else if f < 0.0 {
        0
    } else {
        f as u32
    }
}

fn resize_params(img_w: u32, img_h: u32, options: &Options) -> (u32, u32, bool) {
    let mut w = eval_dimension(options.width, img_w);
    let mut h = eval_dimension(options.height, img_h);

    // never resize larger than the original image unless specifically allowed
    if !options.scale_up {
        w = w.min(img_w);
        h = h.min(img_h);
    }

    // if the requested size matches the original, skip resizing
    if (w == img_w || w == 0) && (h == img_h || h == 0) {
        return (0, 0, false);
    }

    (w, h, true)
}

fn proportional_size(img_w: u32, img_h: u32, w: u32, h: u32) -> (u32, u32) {
    if w == 0 {
        let w = (img_w as f64 * h as f64 / img_h as f64).round() as u32;
        (w.max(1), h.max(1))
    } else {
        let h = (img_h as f64 * w as f64 / img_w as f64).round() as u32;
        (w.max(1), h.max(1))
    }
}

/// The crop rectangle for the request, or None when no cropping applies.
/// Smart crop overrides the rectangle parameters; negative x/y values are
/// measured from the right and bottom edges. Rectangles are clamped to the
/// image bounds, preserving the requested origin.
fn crop_rect(img_w: u32, img_h: u32, options: &Options) -> Option<(u32, u32, u32, u32)> {
    if !options.smart_crop
        && options.crop_x == 0.0
        && options.crop_y == 0.0
        && options.crop_width == 0.0
        && options.crop_height == 0.0
    {
        return None;
    }

    if options.smart_crop {
        let (w, h, _) = resize_params(img_w, img_h, options);
        return smart_crop_rect(img_w, img_h, w, h);
    }

    let mut w = eval_dimension(options.crop_width, img_w);
    let mut h = eval_dimension(options.crop_height, img_h);
    if w == 0 {
        w = img_w;
    }
    if h == 0 {
        h = img_h;
    }

    let mut x = eval_offset(options.crop_x, img_w);
    let mut y = eval_offset(options.crop_y, img_h);
    if options.crop_x < 0.0 {
        x += img_w as i64;
    }
    if options.crop_y < 0.0 {
        y += img_h as i64;
    }

    let x = x.clamp(0, img_w as i64) as u32;
    let y = y.clamp(0, img_h as i64) as u32;
    let w = w.min(img_w - x);
    let h = h.min(img_h - y);
    if w == 0 || h == 0 {
        return None;
    }
    if x == 0 && y == 0 && w == img_w && h == img_h {
        return None;
    }

    Some((x, y, w, h))
}

fn eval_offset(f: f64, max: u32) -> i64 {
    if f.abs() < 1.0 && f != 0.0 {
        (max as f64 * f) as i64
    } else {
        f as i64
    }
}

/// A content-independent stand-in for content-aware cropping: a centered
/// rectangle with the aspect ratio of the requested size.
fn smart_crop_rect(img_w: u32, img_h: u32, w: u32, h: u32) -> Option<(u32, u32, u32, u32)> {
    if w == 0 || h == 0 {
        return None;
    }

    let target_ratio = w as f64 / h as f64;
    let img_ratio = img_w as f64 / img_h as f64;
    let (cw, ch) = if img_ratio > target_ratio {
        ((img_h as f64 * target_ratio).round() as u32, img_h)
    } else {
        (img_w, ((img_w as f64 / target_ratio).round() as u32))
    };
    let cw = cw.clamp(1, img_w);
    let ch = ch.clamp(1, img_h);
    if cw == img_w && ch == img_h {
        return None;
    }

    Some(((img_w - cw) / 2, (img_h - ch) / 2, cw, ch))
}

/// Trims pixels matching the top-left corner color from all four edges. An
/// image that is entirely one color is left alone.
fn trim_edges(img: DynamicImage) -> DynamicImage {
    let rgba: RgbaImage = img.to_rgba8();
    let (w, h) = rgba.dimensions();
    if w == 0 || h == 0 {
        return img;
    }

    let border = *rgba.get_pixel(0, 0);
    let row_uniform =
        |y: u32| -> bool { (0..w).all(|x| *rgba.get_pixel(x, y) == border) };

    let mut top = 0;
    while top < h && row_uniform(top) {
        top += 1;
    }
    if top == h {
        return img;
    }

    let mut bottom = h;
    while bottom > top && row_uniform(bottom - 1) {
        bottom -= 1;
    }

    let col_uniform = |x: u32| -> bool {
        (top..bottom).all(|y| *rgba.get_pixel(x, y) == border)
    };

    let mut left = 0;
    while left < w && col_uniform(left) {
        left += 1;
    }
    let mut right = w;
    while right > left && col_uniform(right - 1) {
        right -= 1;
    }

    if left == 0 && top == 0 && right == w && bottom == h {
        return img;
    }

    img.crop_imm(left, top, right - left, bottom - top)
}

fn encode(
    img: &DynamicImage,
    format: ImageFormat,
    quality: i32,
) -> Result<Vec<u8>, TransformError> {
    let mut out = Vec::new();

    match format {
        ImageFormat::Jpeg => {
            let quality = if quality > 0 { quality.clamp(1, 100) as u8 } else { DEFAULT_QUALITY };
            let rgb = img.to_rgb8();
            let (w, h) = rgb.dimensions();
            let encoder = JpegEncoder::new_with_quality(&mut out, quality);
            encoder
                .write_image(rgb.as_raw(), w, h, ExtendedColorType::Rgb8)
                .map_err(TransformError::Encode)?;
        }
        _ => {
            let mut cursor = std::io::Cursor::new(&mut out);
            img.write_to(&mut cursor, format).map_err(TransformError::Encode)?;
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
    const YELLOW: Rgba<u8> = Rgba([255, 255, 0, 255]);

    /// Builds an image with the given dimensions. A single pixel fills the
    /// whole image; otherwise pixels are laid out row by row.
    fn new_image(w: u32, h: u32, pixels: &[Rgba<u8>]) -> DynamicImage {
        let buf = if pixels.len() == 1 {
            RgbaImage::from_pixel(w, h, pixels[0])
        } else {
            RgbaImage::from_fn(w, h, |x, y| pixels[(y * w + x) as usize])
        };
        DynamicImage::ImageRgba8(buf)
    }

    fn opts(s: &str) -> Options {
        Options::parse(s)
    }

    fn assert_pixels(got: &DynamicImage, want: &DynamicImage) {
        assert_eq!(got.to_rgba8(), want.to_rgba8());
    }

    // 2x2 reference image containing four colors
    fn reference() -> DynamicImage {
        new_image(2, 2, &[RED, GREEN, BLUE, YELLOW])
    }

    #[test]
    fn invalid_rotation_is_a_noop() {
        assert_pixels(&transform_image(reference(), &opts("r45")), &reference());
    }

    #[test]
    fn rotations() {
        let cases = [
            ("r90", vec![GREEN, YELLOW, RED, BLUE]),
            ("r180", vec![YELLOW, BLUE, GREEN, RED]),
            ("r270", vec![BLUE, RED, YELLOW, GREEN]),
        ];
        for (o, want) in cases {
            let got = transform_image(reference(), &opts(o));
            assert_pixels(&got, &new_image(2, 2, &want));
        }
    }

    #[test]
    fn flips() {
        let got = transform_image(reference(), &opts("fh"));
        assert_pixels(&got, &new_image(2, 2, &[GREEN, RED, YELLOW, BLUE]));

        let got = transform_image(reference(), &opts("fv"));
        assert_pixels(&got, &new_image(2, 2, &[BLUE, YELLOW, RED, GREEN]));

        let got = transform_image(reference(), &opts("fv,fh"));
        assert_pixels(&got, &new_image(2, 2, &[YELLOW, BLUE, GREEN, RED]));
    }

    #[test]
    fn resize_never_exceeds_original_without_scale_up() {
        let got = transform_image(reference(), &opts("100x100"));
        assert_pixels(&got, &reference());
    }

    #[test]
    fn negative_sizes_are_ignored() {
        let got = transform_image(reference(), &opts("-1x-1"));
        assert_pixels(&got, &reference());
    }

    #[test]
    fn absolute_resize() {
        let got = transform_image(new_image(100, 100, &[RED]), &opts("1x1"));
        assert_pixels(&got, &new_image(1, 1, &[RED]));
    }

    #[test]
    fn fractional_resize() {
        let got = transform_image(new_image(100, 100, &[RED]), &opts("0.5x0.25"));
        assert_pixels(&got, &new_image(50, 25, &[RED]));
    }

    #[test]
    fn proportional_height_from_width() {
        let got = transform_image(new_image(100, 50, &[RED]), &opts("50x"));
        assert_pixels(&got, &new_image(50, 25, &[RED]));
    }

    #[test]
    fn proportional_width_from_height() {
        let got = transform_image(new_image(100, 50, &[RED]), &opts("x25"));
        assert_pixels(&got, &new_image(50, 25, &[RED]));
    }

    #[test]
    fn exact_resize_crops_to_fill() {
        let src = new_image(4, 2, &[RED, RED, BLUE, BLUE, RED, RED, BLUE, BLUE]);
        let got = transform_image(src, &opts("2x2"));
        assert_eq!((got.width(), got.height()), (2, 2));
    }

    #[test]
    fn fit_avoids_cropping() {
        let src = new_image(4, 2, &[RED, RED, BLUE, BLUE, RED, RED, BLUE, BLUE]);
        let got = transform_image(src, &opts("2x2,fit"));
        assert_eq!((got.width(), got.height()), (2, 1));
    }

    #[test]
    fn scale_up_allows_enlarging() {
        let got = transform_image(reference(), &opts("4x4,scaleUp"));
        assert_eq!((got.width(), got.height()), (4, 4));
    }

    #[test]
    fn combined_fit_rotate_flip() {
        let src = new_image(4, 2, &[RED, RED, BLUE, BLUE, RED, RED, BLUE, BLUE]);
        let got = transform_image(src, &opts("2x1,fit,fh,r90"));
        assert_eq!((got.width(), got.height()), (1, 2));
    }

    #[test]
    fn rectangle_crop() {
        // 2x2 quadrants of a 4x4 image
        #[rustfmt::skip]
        let src = new_image(4, 4, &[
            RED, RED, GREEN, GREEN,
            RED, RED, GREEN, GREEN,
            BLUE, BLUE, YELLOW, YELLOW,
            BLUE, BLUE, YELLOW, YELLOW,
        ]);

        let got = transform_image(src.clone(), &opts("cw2,ch2"));
        assert_pixels(&got, &new_image(2, 2, &[RED, RED, RED, RED]));

        let got = transform_image(src.clone(), &opts("cx2,cy2"));
        assert_pixels(&got, &new_image(2, 2, &[YELLOW, YELLOW, YELLOW, YELLOW]));

        // negative origins measure from the right and bottom edges
        let got = transform_image(src, &opts("cx-2,cy-2"));
        assert_pixels(&got, &new_image(2, 2, &[YELLOW, YELLOW, YELLOW, YELLOW]));
    }

    #[test]
    fn crop_clamped_to_image_bounds() {
        let got = transform_image(reference(), &opts("cx1,cy1,cw100,ch100"));
        assert_pixels(&got, &new_image(1, 1, &[YELLOW]));
    }

    #[test]
    fn smart_crop_centers_on_target_aspect() {
        #[rustfmt::skip]
        let src = new_image(4, 2, &[
            RED, GREEN, GREEN, BLUE,
            RED, GREEN, GREEN, BLUE,
        ]);
        let got = transform_image(src, &opts("2x2,sc"));
        assert_eq!((got.width(), got.height()), (2, 2));
        assert_eq!(*got.to_rgba8().get_pixel(0, 0), GREEN);
    }

    #[test]
    fn trim_removes_uniform_border() {
        #[rustfmt::skip]
        let src = new_image(4, 4, &[
            RED, RED, RED, RED,
            RED, GREEN, BLUE, RED,
            RED, BLUE, GREEN, RED,
            RED, RED, RED, RED,
        ]);
        let got = transform_image(src, &opts("trim"));
        assert_pixels(&got, &new_image(2, 2, &[GREEN, BLUE, BLUE, GREEN]));
    }

    #[test]
    fn trim_leaves_uniform_image_alone() {
        let got = transform_image(new_image(3, 3, &[RED]), &opts("trim"));
        assert_eq!((got.width(), got.height()), (3, 3));
    }

    #[test]
    fn no_transform_returns_input_unchanged() {
        let data = b"not even an image".to_vec();
        let out = transform(&data, &Options::default()).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn decode_failure_is_an_error() {
        let err = transform(b"garbage", &opts("100x100")).unwrap_err();
        assert!(matches!(err, TransformError::Decode(_)));
    }

    fn encode_reference(format: ImageFormat) -> Vec<u8> {
        let mut out = std::io::Cursor::new(Vec::new());
        reference().write_to(&mut out, format).unwrap();
        out.into_inner()
    }

    #[test]
    fn format_conversion() {
        let png = encode_reference(ImageFormat::Png);

        let jpeg = transform(&png, &opts("jpeg")).unwrap();
        assert_eq!(image::guess_format(&jpeg).unwrap(), ImageFormat::Jpeg);

        let tiff = transform(&png, &opts("tiff")).unwrap();
        assert_eq!(image::guess_format(&tiff).unwrap(), ImageFormat::Tiff);
    }

    #[test]
    fn webp_sources_are_transcoded() {
        let webp = encode_reference(ImageFormat::WebP);
        // any transforming option triggers the re-encode
        let out = transform(&webp, &opts("2x2")).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Png);
    }

    #[test]
    fn tiff_sources_are_transcoded() {
        let tiff = encode_reference(ImageFormat::Tiff);
        let out = transform(&tiff, &opts("2x2")).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn jpeg_quality_applies() {
        let src = {
            let mut out = std::io::Cursor::new(Vec::new());
            // a noisy-ish gradient compresses differently at different qualities
            let buf = RgbaImage::from_fn(64, 64, |x, y| {
                Rgba([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8, 255])
            });
            DynamicImage::ImageRgba8(buf).write_to(&mut out, ImageFormat::Png).unwrap();
            out.into_inner()
        };

        let high = transform(&src, &opts("jpeg,q95")).unwrap();
        let low = transform(&src, &opts("jpeg,q10")).unwrap();
        assert!(low.len() < high.len());
    }
}
