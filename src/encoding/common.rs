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

//! Common helper functions shared across encodings.

use std::collections::HashMap;

/// A uniform-color subrectangle found inside an encoded rectangle.
#[derive(Debug)]
pub struct Subrect {
    /// The subrectangle's color as a packed 0x00RRGGBB value.
    pub color: u32,
    /// The X coordinate of the subrectangle's top-left corner.
    pub x: u16,
    /// The Y coordinate of the subrectangle's top-left corner.
    pub y: u16,
    /// The width of the subrectangle in pixels.
    pub w: u16,
    /// The height of the subrectangle in pixels.
    pub h: u16,
}

/// Converts BGRX bytes (4 per pixel) to packed 0x00RRGGBB color values.
pub fn bgrx_to_colors(data: &[u8]) -> Vec<u32> {
    data.chunks_exact(4)
        .map(|chunk| {
            (u32::from(chunk[2]) << 16) | (u32::from(chunk[1]) << 8) | u32::from(chunk[0])
        })
        .collect()
}

/// Splits a packed 0x00RRGGBB color into (r, g, b).
pub fn color_channels(color: u32) -> (u8, u8, u8) {
    ((color >> 16) as u8, (color >> 8) as u8, color as u8)
}

/// Find the most common color in the pixel array.
pub fn get_background_color(pixels: &[u32]) -> u32 {
    if pixels.is_empty() {
        return 0;
    }

    let mut counts: HashMap<u32, usize> = HashMap::new();
    for &pixel in pixels {
        *counts.entry(pixel).or_insert(0) += 1;
    }

    counts
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(color, _)| color)
        .unwrap_or(pixels[0])
}

/// Find subrectangles of non-background pixels.
///
/// Greedy expansion: for each unmarked non-background pixel, grow the
/// larger of a row-first and a column-first rectangle of that color, mark
/// it, and continue. `limit` caps the number of subrectangles; `None` is
/// returned once exceeded so callers can fall back to another encoding.
pub fn find_subrects(
    pixels: &[u32],
    width: usize,
    height: usize,
    bg_color: u32,
    limit: usize,
) -> Option<Vec<Subrect>> {
    let mut subrects = Vec::new();
    let mut marked = vec![false; pixels.len()];

    for y in 0..height {
        for x in 0..width {
            let idx = y * width + x;
            if marked[idx] || pixels[idx] == bg_color {
                continue;
            }

            let color = pixels[idx];

            // Row-first: widest run, then extend downward.
            let mut max_w = 0;
            for test_x in x..width {
                let test_idx = y * width + test_x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_w = test_x - x + 1;
            }

            let mut h = 1;
            'rows: for test_y in (y + 1)..height {
                for test_x in x..(x + max_w) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'rows;
                    }
                }
                h = test_y - y + 1;
            }

            let mut best_w = max_w;
            let mut best_h = h;

            // Column-first: tallest run, then extend rightward.
            let mut max_h = 0;
            for test_y in y..height {
                let test_idx = test_y * width + x;
                if marked[test_idx] || pixels[test_idx] != color {
                    break;
                }
                max_h = test_y - y + 1;
            }

            let mut w2 = 1;
            'cols: for test_x in (x + 1)..width {
                for test_y in y..(y + max_h) {
                    let test_idx = test_y * width + test_x;
                    if marked[test_idx] || pixels[test_idx] != color {
                        break 'cols;
                    }
                }
                w2 = test_x - x + 1;
            }

            if w2 * max_h > best_w * best_h {
                best_w = w2;
                best_h = max_h;
            }

            for dy in 0..best_h {
                for dx in 0..best_w {
                    marked[(y + dy) * width + (x + dx)] = true;
                }
            }

            if subrects.len() == limit {
                return None;
            }

            #[allow(clippy::cast_possible_truncation)] // coordinates bounded by u16 screen dims
            subrects.push(Subrect {
                color,
                x: x as u16,
                y: y as u16,
                w: best_w as u16,
                h: best_h as u16,
            });
        }
    }

    Some(subrects)
}
