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

//! Framebuffer sampling engine.
//!
//! A single capture task samples the display at the configured rate and
//! publishes immutable, versioned [`FramebufferSample`]s through a watch
//! channel. Connections hold an `Arc` to the last sample they sent and
//! compute deltas against the latest one, so a sample stays alive exactly
//! as long as some connection still references it.
//!
//! Change detection divides the screen into fixed 32x32 blocks, compares
//! them bytewise, and coalesces dirty blocks into rectangles: adjacent
//! dirty blocks in a row join into runs, and vertically adjacent runs with
//! identical horizontal extent merge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::display::Display;

/// Side length of a change-detection block, in pixels.
pub const DIRTY_BLOCK: usize = 32;

/// One published screen sample. Immutable once published.
#[derive(Debug)]
pub struct FramebufferSample {
    /// Monotonically increasing sample version.
    pub version: u64,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
    /// `width * height * 4` bytes of BGRX pixel data.
    pub pixels: Vec<u8>,
    /// When the sample was captured.
    pub captured_at: Instant,
}

/// A dirty rectangle in pixel coordinates (no pixel data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyRect {
    /// X coordinate of the top-left corner.
    pub x: u16,
    /// Y coordinate of the top-left corner.
    pub y: u16,
    /// Width in pixels.
    pub width: u16,
    /// Height in pixels.
    pub height: u16,
}

impl DirtyRect {
    /// Intersection with another rectangle, or `None` when disjoint or
    /// either side is empty.
    pub fn intersect(&self, other: &DirtyRect) -> Option<DirtyRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        if x0 < x1 && y0 < y1 {
            Some(DirtyRect {
                x: x0,
                y: y0,
                width: x1 - x0,
                height: y1 - y0,
            })
        } else {
            None
        }
    }
}

/// Computes the dirty rectangles between two samples.
///
/// A dimension change makes the whole screen dirty. Otherwise each 32x32
/// block is compared bytewise; dirty blocks coalesce row-wise into runs
/// and runs merge vertically when their horizontal extents match.
pub fn dirty_rects(prev: &FramebufferSample, curr: &FramebufferSample) -> Vec<DirtyRect> {
    if prev.width != curr.width
        || prev.height != curr.height
        || prev.pixels.len() != curr.pixels.len()
    {
        return vec![DirtyRect {
            x: 0,
            y: 0,
            width: curr.width,
            height: curr.height,
        }];
    }

    let width = curr.width as usize;
    let height = curr.height as usize;
    let stride = width * 4;
    let blocks_x = width.div_ceil(DIRTY_BLOCK);
    let blocks_y = height.div_ceil(DIRTY_BLOCK);

    let mut rects: Vec<DirtyRect> = Vec::new();

    for by in 0..blocks_y {
        let y0 = by * DIRTY_BLOCK;
        let bh = DIRTY_BLOCK.min(height - y0);

        // Row-wise run coalescing over this block row.
        let mut bx = 0;
        while bx < blocks_x {
            let x0 = bx * DIRTY_BLOCK;
            let bw = DIRTY_BLOCK.min(width - x0);
            if !block_dirty(&prev.pixels, &curr.pixels, x0, y0, bw, bh, stride) {
                bx += 1;
                continue;
            }

            // Extend the run over adjacent dirty blocks.
            let mut end = bx + 1;
            while end < blocks_x {
                let ex = end * DIRTY_BLOCK;
                let ew = DIRTY_BLOCK.min(width - ex);
                if !block_dirty(&prev.pixels, &curr.pixels, ex, y0, ew, bh, stride) {
                    break;
                }
                end += 1;
            }

            let run_w = (end * DIRTY_BLOCK).min(width) - x0;
            let run = DirtyRect {
                x: x0 as u16,
                y: y0 as u16,
                width: run_w as u16,
                height: bh as u16,
            };

            // Merge with a vertically adjacent run of identical extent.
            if let Some(above) = rects.iter_mut().find(|r| {
                r.x == run.x && r.width == run.width && r.y + r.height == run.y
            }) {
                above.height += run.height;
            } else {
                rects.push(run);
            }

            bx = end;
        }
    }

    rects
}

fn block_dirty(
    prev: &[u8],
    curr: &[u8],
    x0: usize,
    y0: usize,
    bw: usize,
    bh: usize,
    stride: usize,
) -> bool {
    for row in y0..y0 + bh {
        let start = row * stride + x0 * 4;
        let end = start + bw * 4;
        if prev[start..end] != curr[start..end] {
            return true;
        }
    }
    false
}

/// Extracts a rectangle's BGRX bytes from a sample, row-contiguous.
pub fn sample_rect(sample: &FramebufferSample, rect: &DirtyRect) -> Vec<u8> {
    let stride = sample.width as usize * 4;
    let mut out = Vec::with_capacity(rect.width as usize * rect.height as usize * 4);
    for row in rect.y..rect.y + rect.height {
        let start = row as usize * stride + rect.x as usize * 4;
        out.extend_from_slice(&sample.pixels[start..start + rect.width as usize * 4]);
    }
    out
}

/// Owns the capture task and the published-sample channel.
pub struct FramebufferEngine {
    frames: watch::Receiver<Arc<FramebufferSample>>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FramebufferEngine {
    /// Captures an initial sample and spawns the periodic capture task.
    pub fn start(display: Arc<Display>, frame_rate: u32) -> Self {
        let first = Arc::new(capture_sample(&display, 1));
        let (frame_tx, frames) = watch::channel(first);
        let (shutdown, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let period = Duration::from_millis(1000 / u64::from(frame_rate.max(1)));
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await; // the immediate first tick

            let mut version = 1u64;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        version += 1;
                        let sample = capture_sample(&display, version);
                        if frame_tx.send(Arc::new(sample)).is_err() {
                            break;
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Capture task shutting down");
                        break;
                    }
                }
            }
        });

        Self { frames, shutdown, task }
    }

    /// A receiver observing every published sample.
    pub fn subscribe(&self) -> watch::Receiver<Arc<FramebufferSample>> {
        self.frames.clone()
    }

    /// The most recently published sample.
    pub fn latest(&self) -> Arc<FramebufferSample> {
        self.frames.borrow().clone()
    }

    /// Stops the capture task.
    pub fn stop(self) {
        let _ = self.shutdown.send(true);
        self.task.abort();
    }
}

/// Captures one sample; a capture failure substitutes an all-black frame.
fn capture_sample(display: &Display, version: u64) -> FramebufferSample {
    let (width, height) = display.size();
    let expected = width as usize * height as usize * 4;
    let pixels = match display.capture_full() {
        Ok(pixels) if pixels.len() == expected => pixels,
        Ok(pixels) => {
            warn!(
                "Capture returned {} bytes, expected {expected}; substituting black frame",
                pixels.len()
            );
            vec![0u8; expected]
        }
        Err(e) => {
            warn!("Capture failed: {e}; substituting black frame");
            vec![0u8; expected]
        }
    };

    FramebufferSample {
        version,
        width,
        height,
        pixels,
        captured_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::SimulatedDisplay;

    fn sample_from(width: u16, height: u16, pixels: Vec<u8>, version: u64) -> FramebufferSample {
        FramebufferSample {
            version,
            width,
            height,
            pixels,
            captured_at: Instant::now(),
        }
    }

    fn black(width: u16, height: u16, version: u64) -> FramebufferSample {
        sample_from(width, height, vec![0u8; width as usize * height as usize * 4], version)
    }

    fn set_pixel(sample: &mut FramebufferSample, x: usize, y: usize, value: u8) {
        let offset = (y * sample.width as usize + x) * 4;
        sample.pixels[offset] = value;
    }

    #[test]
    fn identical_samples_have_no_dirty_rects() {
        let a = black(128, 96, 1);
        let b = black(128, 96, 2);
        assert!(dirty_rects(&a, &b).is_empty());
    }

    #[test]
    fn dimension_change_dirties_everything() {
        let a = black(128, 96, 1);
        let b = black(64, 96, 2);
        assert_eq!(
            dirty_rects(&a, &b),
            vec![DirtyRect { x: 0, y: 0, width: 64, height: 96 }]
        );
    }

    #[test]
    fn single_changed_pixel_dirties_one_block() {
        let a = black(128, 96, 1);
        let mut b = black(128, 96, 2);
        set_pixel(&mut b, 40, 50, 0xFF);

        assert_eq!(
            dirty_rects(&a, &b),
            vec![DirtyRect { x: 32, y: 32, width: 32, height: 32 }]
        );
    }

    #[test]
    fn adjacent_blocks_in_a_row_join() {
        let a = black(128, 96, 1);
        let mut b = black(128, 96, 2);
        set_pixel(&mut b, 10, 10, 0xFF);
        set_pixel(&mut b, 40, 10, 0xFF);

        assert_eq!(
            dirty_rects(&a, &b),
            vec![DirtyRect { x: 0, y: 0, width: 64, height: 32 }]
        );
    }

    #[test]
    fn vertically_adjacent_runs_with_same_extent_merge() {
        let a = black(128, 96, 1);
        let mut b = black(128, 96, 2);
        set_pixel(&mut b, 10, 10, 0xFF);
        set_pixel(&mut b, 10, 40, 0xFF);

        assert_eq!(
            dirty_rects(&a, &b),
            vec![DirtyRect { x: 0, y: 0, width: 32, height: 64 }]
        );
    }

    #[test]
    fn runs_with_different_extents_stay_separate() {
        let a = black(128, 96, 1);
        let mut b = black(128, 96, 2);
        set_pixel(&mut b, 10, 10, 0xFF);
        set_pixel(&mut b, 10, 40, 0xFF);
        set_pixel(&mut b, 40, 40, 0xFF);

        let rects = dirty_rects(&a, &b);
        assert_eq!(rects.len(), 2);
        assert!(rects.contains(&DirtyRect { x: 0, y: 0, width: 32, height: 32 }));
        assert!(rects.contains(&DirtyRect { x: 0, y: 32, width: 64, height: 32 }));
    }

    #[test]
    fn edge_blocks_are_clipped_to_screen() {
        // 100x70 screen: right column blocks are 4 wide, bottom row 6 tall
        let a = black(100, 70, 1);
        let mut b = black(100, 70, 2);
        set_pixel(&mut b, 98, 68, 0xFF);

        assert_eq!(
            dirty_rects(&a, &b),
            vec![DirtyRect { x: 96, y: 64, width: 4, height: 6 }]
        );
    }

    #[test]
    fn intersect_clips_and_rejects_disjoint() {
        let a = DirtyRect { x: 0, y: 0, width: 100, height: 100 };
        let b = DirtyRect { x: 50, y: 60, width: 100, height: 100 };
        assert_eq!(
            a.intersect(&b),
            Some(DirtyRect { x: 50, y: 60, width: 50, height: 40 })
        );

        let far = DirtyRect { x: 200, y: 200, width: 10, height: 10 };
        assert_eq!(a.intersect(&far), None);
    }

    #[test]
    fn sample_rect_extracts_rows() {
        let mut s = black(8, 4, 1);
        set_pixel(&mut s, 2, 1, 0xAA);
        let rect = DirtyRect { x: 2, y: 1, width: 2, height: 2 };
        let bytes = sample_rect(&s, &rect);
        assert_eq!(bytes.len(), 2 * 2 * 4);
        assert_eq!(bytes[0], 0xAA);
    }

    #[tokio::test]
    async fn engine_publishes_increasing_versions() {
        let display = Arc::new(Display::Simulated(SimulatedDisplay::frozen(64, 48)));
        let engine = FramebufferEngine::start(display, 60);

        let first = engine.latest();
        assert_eq!(first.version, 1);
        assert_eq!(first.pixels.len(), 64 * 48 * 4);

        let mut rx = engine.subscribe();
        rx.changed().await.unwrap();
        let second = rx.borrow_and_update().clone();
        assert!(second.version > first.version);

        engine.stop();
    }
}
