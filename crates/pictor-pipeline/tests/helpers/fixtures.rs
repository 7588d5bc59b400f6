//! Test fixtures: generated images and hashes.

use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use sha2::{Digest, Sha256};
use std::io::Cursor;

/// PNG of the given size filled with one colour.
pub fn create_test_png(width: u32, height: u32) -> Bytes {
    let img = RgbaImage::from_pixel(width, height, Rgba([30, 120, 200, 255]));
    let mut buffer = Vec::new();
    img.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
        .expect("encode test png");
    Bytes::from(buffer)
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
