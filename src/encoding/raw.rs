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

//! Raw encoding implementation.
//!
//! The simplest encoding: `width * height` pixels in the client's
//! negotiated format, no compression. High bandwidth but universally
//! supported, and the fallback for every other encoding.

use bytes::BytesMut;

use super::Encoding;
use crate::protocol::PixelFormat;
use crate::translate;

/// Implements the "Raw" encoding: pixel translation IS the encoding.
///
/// For a client using the canonical 32-bit BGRX format the payload is a
/// straight copy of the framebuffer bytes.
pub struct RawEncoding;

impl Encoding for RawEncoding {
    fn encode(
        &self,
        data: &[u8],
        _width: u16,
        _height: u16,
        format: &PixelFormat,
    ) -> Option<BytesMut> {
        Some(translate::translate_pixels(data, format))
    }
}
