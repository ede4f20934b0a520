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

//! RRE (Rise-and-Run-length Encoding) implementation.
//!
//! RRE encodes a rectangle as a background color plus a list of
//! subrectangles with their own colors. Format:
//! \[nSubrects(u32)\]\[bgPixel\]\[subrect1\]...\[subrectN\], each subrect
//! \[pixel\]\[x(u16)\]\[y(u16)\]\[w(u16)\]\[h(u16)\]. Effective for large
//! solid regions; rectangles needing more than 64 subrectangles are left
//! to Raw.

use bytes::{BufMut, BytesMut};

use super::common::{bgrx_to_colors, color_channels, find_subrects, get_background_color};
use super::Encoding;
use crate::protocol::PixelFormat;
use crate::translate;

/// Maximum subrectangles before the encoder declines the rectangle.
const MAX_SUBRECTS: usize = 64;

/// Implements the "RRE" encoding.
pub struct RreEncoding;

impl Encoding for RreEncoding {
    #[allow(clippy::cast_possible_truncation)] // subrect count capped at MAX_SUBRECTS
    fn encode(
        &self,
        data: &[u8],
        width: u16,
        height: u16,
        format: &PixelFormat,
    ) -> Option<BytesMut> {
        let pixels = bgrx_to_colors(data);
        let bg_color = get_background_color(&pixels);
        let subrects =
            find_subrects(&pixels, width as usize, height as usize, bg_color, MAX_SUBRECTS)?;

        let bpp = format.bytes_per_pixel();
        let mut buf = BytesMut::with_capacity(4 + bpp + subrects.len() * (bpp + 8));

        buf.put_u32(subrects.len() as u32);
        let (r, g, b) = color_channels(bg_color);
        translate::pack_pixel(&mut buf, r, g, b, format);

        for subrect in subrects {
            let (r, g, b) = color_channels(subrect.color);
            translate::pack_pixel(&mut buf, r, g, b, format);
            buf.put_u16(subrect.x);
            buf.put_u16(subrect.y);
            buf.put_u16(subrect.w);
            buf.put_u16(subrect.h);
        }

        Some(buf)
    }
}
