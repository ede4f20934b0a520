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

//! Rectangle encoders and per-rectangle encoding selection.
//!
//! Input pixels are always canonical BGRX; encoders translate to the
//! client's negotiated pixel format as they write. Selection walks the
//! client's preference list and takes the first encoding that is both
//! supported and beneficial, falling back to Raw.

use bytes::BytesMut;

use crate::protocol::{PixelFormat, ENCODING_RAW, ENCODING_RRE};

pub mod common;
pub mod raw;
pub mod rre;

pub use raw::RawEncoding;
pub use rre::RreEncoding;

/// Trait defining the interface for rectangle encoders.
pub trait Encoding {
    /// Encodes a rectangle of canonical BGRX pixels for the given client
    /// pixel format.
    ///
    /// Returns `None` when the encoding does not apply to this rectangle
    /// (the caller then falls back to Raw).
    fn encode(
        &self,
        data: &[u8],
        width: u16,
        height: u16,
        format: &PixelFormat,
    ) -> Option<BytesMut>;
}

/// Creates an encoder instance for the specified encoding type.
#[must_use]
pub fn get_encoder(encoding_type: i32) -> Option<Box<dyn Encoding>> {
    match encoding_type {
        ENCODING_RAW => Some(Box::new(RawEncoding)),
        ENCODING_RRE => Some(Box::new(RreEncoding)),
        _ => None,
    }
}

/// Picks the encoding for one rectangle and produces its payload.
///
/// Walks `preferences` in client order; a non-Raw encoding is chosen only
/// when its payload is at least 12.5% smaller than Raw's. The Raw payload
/// is the fallback, so the chosen payload is never larger than Raw.
pub fn select_encoding(
    preferences: &[i32],
    data: &[u8],
    width: u16,
    height: u16,
    format: &PixelFormat,
) -> (i32, BytesMut) {
    let raw_len = width as usize * height as usize * format.bytes_per_pixel();

    for &preference in preferences {
        if preference == ENCODING_RAW {
            break;
        }
        let Some(encoder) = get_encoder(preference) else {
            continue;
        };
        if let Some(payload) = encoder.encode(data, width, height, format) {
            // Beneficial: at least 1/8 smaller than Raw.
            if payload.len() * 8 <= raw_len * 7 {
                return (preference, payload);
            }
        }
    }

    let raw = RawEncoding
        .encode(data, width, height, format)
        .expect("raw encoding always applies");
    (ENCODING_RAW, raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_rect(width: usize, height: usize, bgrx: [u8; 4]) -> Vec<u8> {
        bgrx.iter()
            .copied()
            .cycle()
            .take(width * height * 4)
            .collect()
    }

    fn noise_rect(width: usize, height: usize) -> Vec<u8> {
        let mut data = Vec::with_capacity(width * height * 4);
        for i in 0..width * height {
            let v = (i * 2654435761) as u32;
            data.extend_from_slice(&[v as u8, (v >> 8) as u8, (v >> 16) as u8, 0]);
        }
        data
    }

    #[test]
    fn solid_rectangle_selects_rre() {
        let data = solid_rect(64, 64, [10, 20, 30, 0]);
        let pf = PixelFormat::bgrx32();
        let (encoding, payload) = select_encoding(&[ENCODING_RRE, ENCODING_RAW], &data, 64, 64, &pf);
        assert_eq!(encoding, ENCODING_RRE);
        // u32 count + one background pixel
        assert_eq!(payload.len(), 4 + 4);
    }

    #[test]
    fn noisy_rectangle_falls_back_to_raw() {
        let data = noise_rect(16, 16);
        let pf = PixelFormat::bgrx32();
        let (encoding, payload) = select_encoding(&[ENCODING_RRE, ENCODING_RAW], &data, 16, 16, &pf);
        assert_eq!(encoding, ENCODING_RAW);
        assert_eq!(payload.len(), 16 * 16 * 4);
    }

    #[test]
    fn chosen_payload_never_exceeds_raw() {
        let pf = PixelFormat::bgrx32();
        for data in [solid_rect(32, 32, [1, 2, 3, 0]), noise_rect(32, 32)] {
            let raw_len = 32 * 32 * 4;
            let (_, payload) = select_encoding(&[ENCODING_RRE], &data, 32, 32, &pf);
            assert!(payload.len() <= raw_len);
        }
    }

    #[test]
    fn unknown_and_pseudo_preferences_are_skipped() {
        let data = solid_rect(8, 8, [0, 0, 0, 0]);
        let pf = PixelFormat::bgrx32();
        let (encoding, _) =
            select_encoding(&[crate::protocol::ENCODING_DESKTOP_SIZE, 999], &data, 8, 8, &pf);
        assert_eq!(encoding, ENCODING_RAW);
    }

    #[test]
    fn empty_preference_list_means_raw() {
        let data = solid_rect(8, 8, [5, 5, 5, 0]);
        let pf = PixelFormat::bgrx32();
        let (encoding, payload) = select_encoding(&[], &data, 8, 8, &pf);
        assert_eq!(encoding, ENCODING_RAW);
        assert_eq!(payload.len(), 8 * 8 * 4);
    }
}
