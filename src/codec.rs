//! Thresholding and run-length coding of binarized images.
//!
//! A compressed payload starts with the value of the first pixel (0 or 1).
//! Every byte after it is the length of a run, alternating between the two
//! values starting with the first pixel. A run longer than 255 is split as
//! `255, 0, rest`: the zero-length run of the other value keeps the
//! alternation intact.

use crate::error::{Error, Result};

const MAX_RUN: usize = u8::MAX as usize;

/// Grayscale pixel matrix, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrayImage {
    width: u32,
    height: u32,
    max_gray: u32,
    pixels: Vec<u32>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32, max_gray: u32, pixels: Vec<u32>) -> Result<Self> {
        let expected = pixel_count(width, height)?;
        if pixels.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "{width}x{height} image needs {expected} pixels, got {}",
                pixels.len()
            )));
        }
        if let Some(p) = pixels.iter().find(|&&p| p > max_gray) {
            return Err(Error::InvalidArgument(format!(
                "Pixel value {p} exceeds max gray {max_gray}"
            )));
        }
        Ok(GrayImage {
            width,
            height,
            max_gray,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn max_gray(&self) -> u32 {
        self.max_gray
    }

    pub fn pixels(&self) -> &[u32] {
        &self.pixels
    }

    /// Pixels strictly above `threshold` become 1, the rest 0.
    pub fn binarize(&self, threshold: i32) -> Bitmap {
        let threshold = i64::from(threshold);
        Bitmap {
            width: self.width,
            height: self.height,
            pixels: self
                .pixels
                .iter()
                .map(|&p| u8::from(i64::from(p) > threshold))
                .collect(),
        }
    }
}

/// Matrix of 0/1 pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = pixel_count(width, height)?;
        if pixels.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "{width}x{height} bitmap needs {expected} pixels, got {}",
                pixels.len()
            )));
        }
        if pixels.iter().any(|&p| p > 1) {
            return Err(Error::InvalidArgument("Bitmap pixels must be 0 or 1".into()));
        }
        Ok(Bitmap {
            width,
            height,
            pixels,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn get(&self, row: u32, col: u32) -> Option<u8> {
        if row >= self.height || col >= self.width {
            return None;
        }
        self.pixels
            .get(row as usize * self.width as usize + col as usize)
            .copied()
    }
}

pub fn compress(bitmap: &Bitmap) -> Vec<u8> {
    let Some(&first) = bitmap.pixels.first() else {
        return Vec::new();
    };

    let mut out = vec![first];
    let mut current = first;
    let mut run = 0usize;
    for &pixel in &bitmap.pixels {
        if pixel == current {
            run += 1;
        } else {
            push_run(&mut out, run);
            current = pixel;
            run = 1;
        }
    }
    push_run(&mut out, run);
    out
}

fn push_run(out: &mut Vec<u8>, mut run: usize) {
    while run > MAX_RUN {
        out.push(u8::MAX);
        out.push(0);
        run -= MAX_RUN;
    }
    out.push(run as u8);
}

/// Expand a payload produced by [`compress`]. The runs must add up to
/// exactly `width * height` pixels.
pub fn decompress(data: &[u8], width: u32, height: u32) -> Result<Bitmap> {
    let total = pixel_count(width, height)?;

    let Some((&first, runs)) = data.split_first() else {
        if total == 0 {
            return Ok(Bitmap {
                width,
                height,
                pixels: Vec::new(),
            });
        }
        return Err(Error::Codec(format!(
            "Empty payload for a {width}x{height} image"
        )));
    };

    if first > 1 {
        return Err(Error::Codec(format!("Invalid first pixel value {first}")));
    }

    let mut pixels = Vec::with_capacity(total);
    let mut value = first;
    for &run in runs {
        let run = run as usize;
        if pixels.len() + run > total {
            return Err(Error::Codec(format!(
                "Runs exceed the {total} pixels of a {width}x{height} image"
            )));
        }
        pixels.resize(pixels.len() + run, value);
        value ^= 1;
    }

    if pixels.len() != total {
        return Err(Error::Codec(format!(
            "Runs cover {} of {total} pixels",
            pixels.len()
        )));
    }

    Ok(Bitmap {
        width,
        height,
        pixels,
    })
}

fn pixel_count(width: u32, height: u32) -> Result<usize> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or_else(|| Error::InvalidArgument(format!("Image {width}x{height} is too large")))
}
