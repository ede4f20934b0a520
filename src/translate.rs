// Copyright 2025 Dustin McAfee
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Pixel translation from the canonical framebuffer format to client formats.
//!
//! Framebuffer samples are always 32-bit BGRX. Clients may negotiate any
//! valid true-colour format with 8, 16 or 32 bits per pixel; this module
//! converts per pixel using the client's `*_max` and `*_shift` fields.
//! When the client format equals the canonical one, translation is a copy.

use bytes::BytesMut;

use crate::protocol::PixelFormat;

/// Translates canonical BGRX pixel data to the client's requested format.
///
/// # Panics
///
/// Panics if `src` is not a whole number of 4-byte pixels.
pub fn translate_pixels(src: &[u8], client_format: &PixelFormat) -> BytesMut {
    // Fast path: no translation needed
    if client_format.is_canonical() {
        return BytesMut::from(src);
    }

    assert_eq!(src.len() % 4, 0, "source data must be BGRX (4 bytes per pixel)");

    let pixel_count = src.len() / 4;
    let mut dst = BytesMut::with_capacity(pixel_count * client_format.bytes_per_pixel());

    for chunk in src.chunks_exact(4) {
        let (b, g, r) = (chunk[0], chunk[1], chunk[2]);
        pack_pixel(&mut dst, r, g, b, client_format);
    }

    dst
}

/// Packs one pixel's RGB components into the client format and appends it.
pub fn pack_pixel(dst: &mut BytesMut, r: u8, g: u8, b: u8, format: &PixelFormat) {
    let pixel_value = pixel_value(r, g, b, format);

    match format.bits_per_pixel {
        8 => dst.extend_from_slice(&[pixel_value as u8]),
        16 => {
            let bytes = if format.big_endian_flag != 0 {
                (pixel_value as u16).to_be_bytes()
            } else {
                (pixel_value as u16).to_le_bytes()
            };
            dst.extend_from_slice(&bytes);
        }
        _ => {
            let bytes = if format.big_endian_flag != 0 {
                pixel_value.to_be_bytes()
            } else {
                pixel_value.to_le_bytes()
            };
            dst.extend_from_slice(&bytes);
        }
    }
}

/// Combines RGB components into a raw pixel value for the given format.
fn pixel_value(r: u8, g: u8, b: u8, format: &PixelFormat) -> u32 {
    let r_scaled = downscale_component(r, format.red_max);
    let g_scaled = downscale_component(g, format.green_max);
    let b_scaled = downscale_component(b, format.blue_max);

    (u32::from(r_scaled) << format.red_shift)
        | (u32::from(g_scaled) << format.green_shift)
        | (u32::from(b_scaled) << format.blue_shift)
}

/// Downscales a color component from 8-bit (0-255) to the format range.
#[inline]
#[allow(clippy::cast_possible_truncation)] // value * max / 255 <= max, which fits u16
fn downscale_component(value: u8, max: u16) -> u16 {
    if max == 255 {
        return u16::from(value);
    }
    ((u32::from(value) * u32::from(max)) / 255) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_format_is_a_copy() {
        let src = vec![10u8, 20, 30, 0, 40, 50, 60, 0];
        let dst = translate_pixels(&src, &PixelFormat::bgrx32());
        assert_eq!(&src[..], &dst[..]);
    }

    #[test]
    fn bgrx_to_rgb565() {
        // RGB565: 5-bit red (shift 11), 6-bit green (shift 5), 5-bit blue (shift 0)
        let client = PixelFormat {
            bits_per_pixel: 16,
            depth: 16,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 31,
            green_max: 63,
            blue_max: 31,
            red_shift: 11,
            green_shift: 5,
            blue_shift: 0,
        };

        // Pure red pixel in BGRX
        let src = vec![0u8, 0, 255, 0];
        let dst = translate_pixels(&src, &client);
        assert_eq!(dst.len(), 2);
        assert_eq!(u16::from_le_bytes([dst[0], dst[1]]), 0xF800);

        // Pure blue
        let src = vec![255u8, 0, 0, 0];
        let dst = translate_pixels(&src, &client);
        assert_eq!(u16::from_le_bytes([dst[0], dst[1]]), 0x001F);
    }

    #[test]
    fn big_endian_32bpp_output() {
        let client = PixelFormat {
            big_endian_flag: 1,
            ..PixelFormat::bgrx32()
        };
        // White pixel
        let src = vec![255u8, 255, 255, 0];
        let dst = translate_pixels(&src, &client);
        assert_eq!(&dst[..], &0x00FF_FFFFu32.to_be_bytes());
    }

    #[test]
    fn bgr233_packing() {
        let client = PixelFormat {
            bits_per_pixel: 8,
            depth: 8,
            big_endian_flag: 0,
            true_colour_flag: 1,
            red_max: 7,
            green_max: 7,
            blue_max: 3,
            red_shift: 0,
            green_shift: 3,
            blue_shift: 6,
        };
        // Pure green in BGRX
        let src = vec![0u8, 255, 0, 0];
        let dst = translate_pixels(&src, &client);
        assert_eq!(dst.len(), 1);
        assert_eq!(dst[0], 7 << 3);
    }

    #[test]
    fn downscale_bounds() {
        assert_eq!(downscale_component(0, 31), 0);
        assert_eq!(downscale_component(255, 31), 31);
        assert_eq!(downscale_component(128, 31), 15);
        assert_eq!(downscale_component(128, 255), 128);
    }
}
