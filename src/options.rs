use std::fmt;

use chrono::{DateTime, Utc};

const OPT_FIT: &str = "fit";
const OPT_FLIP_VERTICAL: &str = "fv";
const OPT_FLIP_HORIZONTAL: &str = "fh";
const OPT_FORMAT_JPEG: &str = "jpeg";
const OPT_FORMAT_PNG: &str = "png";
const OPT_FORMAT_TIFF: &str = "tiff";
const OPT_ROTATE_PREFIX: &str = "r";
const OPT_QUALITY_PREFIX: &str = "q";
const OPT_SIGNATURE_PREFIX: &str = "s";
const OPT_SIZE_DELIMITER: char = 'x';
const OPT_SCALE_UP: &str = "scaleUp";
const OPT_CROP_X: &str = "cx";
const OPT_CROP_Y: &str = "cy";
const OPT_CROP_WIDTH: &str = "cw";
const OPT_CROP_HEIGHT: &str = "ch";
const OPT_SMART_CROP: &str = "sc";
const OPT_TRIM: &str = "trim";
const OPT_VALID_UNTIL: &str = "vu";

/// Options specifies transformations to be performed on the requested image.
///
/// Integer width/height values greater than 1 are exact pixel sizes; floats
/// between 0 and 1 are fractions of the source dimension; 0 (or absent)
/// preserves the aspect ratio based on the other dimension. The same
/// convention applies to the crop rectangle, whose negative x/y values are
/// measured from the right and bottom edges.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Options {
    pub width: f64,
    pub height: f64,

    /// Resize the image to fit within the specified dimensions without
    /// cropping, maintaining the aspect ratio.
    pub fit: bool,

    /// Rotate the image the specified degrees counter-clockwise. Valid
    /// values are 90, 180, 270; anything else is a no-op.
    pub rotate: i32,

    pub flip_vertical: bool,
    pub flip_horizontal: bool,

    /// Quality of the output image (JPEG only).
    pub quality: i32,

    /// HMAC signature for signed requests, base64-url encoded.
    pub signature: String,

    /// Allow the image to scale beyond its original dimensions. Always
    /// overwritten by the proxy-wide setting.
    pub scale_up: bool,

    /// Desired image format. Valid values are "jpeg", "png", "tiff".
    pub format: String,

    pub crop_x: f64,
    pub crop_y: f64,
    pub crop_width: f64,
    pub crop_height: f64,

    /// Automatically find good crop points based on image content,
    /// overriding any rectangle crop.
    pub smart_crop: bool,

    /// Trim same-colored pixels around the edges of the image.
    pub trim: bool,

    /// If set, the request is only valid before this instant.
    pub valid_until: Option<DateTime<Utc>>,
}

impl Options {
    /// Parses a list of comma separated transformation options.
    ///
    /// Options may appear in any order; duplicates overwrite earlier values.
    /// Unknown tokens are ignored, and numeric parse failures read as zero.
    ///
    /// Examples:
    ///
    /// ```text
    /// 0x0         - no resizing
    /// 200x        - 200 pixels wide, proportional height
    /// x0.15       - 15% original height, proportional width
    /// 100x150     - 100 by 150 pixels, cropping as needed
    /// 100         - 100 pixels square, cropping as needed
    /// 150,fit     - scale to fit 150 pixels square, no cropping
    /// 100,r90     - 100 pixels square, rotated 90 degrees
    /// 200x,q60    - 200 pixels wide, proportional height, 60% quality
    /// 200x,png    - 200 pixels wide, converted to PNG format
    /// cw100,ch100 - crop image to 100px square, starting at (0,0)
    /// ```
    pub fn parse(s: &str) -> Options {
        let mut options = Options::default();

        for opt in s.split(',') {
            if opt.is_empty() {
                continue;
            } else if opt == OPT_FIT {
                options.fit = true;
            } else if opt == OPT_FLIP_VERTICAL {
                options.flip_vertical = true;
            } else if opt == OPT_FLIP_HORIZONTAL {
                options.flip_horizontal = true;
            } else if opt == OPT_SCALE_UP {
                options.scale_up = true;
            } else if opt == OPT_FORMAT_JPEG || opt == OPT_FORMAT_PNG || opt == OPT_FORMAT_TIFF {
                options.format = opt.to_string();
            } else if opt == OPT_SMART_CROP {
                options.smart_crop = true;
            } else if opt == OPT_TRIM {
                options.trim = true;
            } else if let Some(value) = opt.strip_prefix(OPT_ROTATE_PREFIX) {
                options.rotate = value.parse().unwrap_or_default();
            } else if let Some(value) = opt.strip_prefix(OPT_QUALITY_PREFIX) {
                options.quality = value.parse().unwrap_or_default();
            } else if let Some(value) = opt.strip_prefix(OPT_CROP_X) {
                options.crop_x = value.parse().unwrap_or_default();
            } else if let Some(value) = opt.strip_prefix(OPT_CROP_Y) {
                options.crop_y = value.parse().unwrap_or_default();
            } else if let Some(value) = opt.strip_prefix(OPT_CROP_WIDTH) {
                options.crop_width = value.parse().unwrap_or_default();
            } else if let Some(value) = opt.strip_prefix(OPT_CROP_HEIGHT) {
                options.crop_height = value.parse().unwrap_or_default();
            } else if let Some(value) = opt.strip_prefix(OPT_VALID_UNTIL) {
                if let Ok(v) = value.parse::<i64>() {
                    if v > 0 {
                        options.valid_until = DateTime::from_timestamp(v, 0);
                    }
                }
            } else if let Some(value) = opt.strip_prefix(OPT_SIGNATURE_PREFIX) {
                options.signature = value.to_string();
            } else if let Some((w, h)) = opt.split_once(OPT_SIZE_DELIMITER) {
                if !w.is_empty() {
                    options.width = w.parse().unwrap_or_default();
                }
                if !h.is_empty() {
                    options.height = h.parse().unwrap_or_default();
                }
            } else if let Ok(size) = opt.parse::<f64>() {
                options.width = size;
                options.height = size;
            }
        }

        options
    }

    /// Whether the options include any actual transformation. Some fields
    /// (like the signature) are not transform related at all, and others
    /// (like fit) only apply in the presence of other fields.
    pub fn transform(&self) -> bool {
        self.width != 0.0
            || self.height != 0.0
            || self.rotate != 0
            || self.flip_horizontal
            || self.flip_vertical
            || self.quality != 0
            || !self.format.is_empty()
            || self.crop_x != 0.0
            || self.crop_y != 0.0
            || self.crop_width != 0.0
            || self.crop_height != 0.0
            || self.trim
    }
}

/// The canonical string form: one token per non-default field, sorted
/// lexicographically. The size token is always emitted (`0x0` when unset).
/// This form is reproduced bit-for-bit as the cache-key fragment and the
/// signature payload.
impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut opts = vec![format!("{}{}{}", self.width, OPT_SIZE_DELIMITER, self.height)];
        if self.fit {
            opts.push(OPT_FIT.to_string());
        }
        if self.rotate != 0 {
            opts.push(format!("{}{}", OPT_ROTATE_PREFIX, self.rotate));
        }
        if self.flip_vertical {
            opts.push(OPT_FLIP_VERTICAL.to_string());
        }
        if self.flip_horizontal {
            opts.push(OPT_FLIP_HORIZONTAL.to_string());
        }
        if self.quality != 0 {
            opts.push(format!("{}{}", OPT_QUALITY_PREFIX, self.quality));
        }
        if !self.signature.is_empty() {
            opts.push(format!("{}{}", OPT_SIGNATURE_PREFIX, self.signature));
        }
        if self.scale_up {
            opts.push(OPT_SCALE_UP.to_string());
        }
        if !self.format.is_empty() {
            opts.push(self.format.clone());
        }
        if self.crop_x != 0.0 {
            opts.push(format!("{}{}", OPT_CROP_X, self.crop_x));
        }
        if self.crop_y != 0.0 {
            opts.push(format!("{}{}", OPT_CROP_Y, self.crop_y));
        }
        if self.crop_width != 0.0 {
            opts.push(format!("{}{}", OPT_CROP_WIDTH, self.crop_width));
        }
        if self.crop_height != 0.0 {
            opts.push(format!("{}{}", OPT_CROP_HEIGHT, self.crop_height));
        }
        if self.smart_crop {
            opts.push(OPT_SMART_CROP.to_string());
        }
        if self.trim {
            opts.push(OPT_TRIM.to_string());
        }
        if let Some(valid_until) = self.valid_until {
            opts.push(format!("{}{}", OPT_VALID_UNTIL, valid_until.timestamp()));
        }

        opts.sort();

        f.write_str(&opts.join(","))
    }
}
