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

//! Display adapter: the screen the server exposes and injects input into.
//!
//! The adapter is a capability with two variants. `Simulated` renders a
//! deterministic animated gradient and records injected input, covering
//! tests and hosts without a grabber. `Real` wraps a platform screen
//! backend supplied by the embedder. Dispatch is a plain match.
//!
//! Pixel data is always 32-bit BGRX: blue at byte 0, green at 1, red at 2,
//! padding at 3, `width * height * 4` bytes per full capture.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::debug;

use crate::error::{Result, RfbError};
use crate::keysym::{self, Key};

/// Pointer button mask: left button.
pub const BUTTON_LEFT: u8 = 1;
/// Pointer button mask: middle button.
pub const BUTTON_MIDDLE: u8 = 2;
/// Pointer button mask: right button.
pub const BUTTON_RIGHT: u8 = 4;
/// Pointer button mask: scroll wheel up.
pub const BUTTON_WHEEL_UP: u8 = 8;
/// Pointer button mask: scroll wheel down.
pub const BUTTON_WHEEL_DOWN: u8 = 16;

/// Platform screen backend behind the `Real` display variant.
///
/// Implementations grab actual screen contents and deliver input to the
/// windowing system; they live outside this crate.
pub trait ScreenBackend: Send + Sync {
    /// Screen dimensions in pixels.
    fn size(&self) -> (u16, u16);
    /// Captures the whole screen as BGRX bytes.
    fn capture_full(&self) -> Result<Vec<u8>>;
    /// Delivers a key press or release.
    fn inject_key(&self, key: Key, down: bool);
    /// Delivers pointer position and button state.
    fn inject_pointer(&self, x: u16, y: u16, button_mask: u8);
}

/// An input event delivered to the display adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedEvent {
    /// A decoded key press or release.
    Key {
        /// The decoded key.
        key: Key,
        /// True on press, false on release.
        down: bool,
    },
    /// A pointer move or button change.
    Pointer {
        /// X coordinate.
        x: u16,
        /// Y coordinate.
        y: u16,
        /// Button bitmask (`BUTTON_*` constants).
        button_mask: u8,
    },
}

/// The display the server samples from and injects input into.
pub enum Display {
    /// Deterministic in-memory display for tests and headless hosts.
    Simulated(SimulatedDisplay),
    /// A platform screen grabber and input injector.
    Real(Box<dyn ScreenBackend>),
}

impl Display {
    /// Screen dimensions in pixels.
    pub fn size(&self) -> (u16, u16) {
        match self {
            Display::Simulated(sim) => (sim.width, sim.height),
            Display::Real(backend) => backend.size(),
        }
    }

    /// Captures the whole screen; `width * height * 4` BGRX bytes.
    pub fn capture_full(&self) -> Result<Vec<u8>> {
        match self {
            Display::Simulated(sim) => Ok(sim.render_frame()),
            Display::Real(backend) => backend.capture_full(),
        }
    }

    /// Captures a region as a row-contiguous slice of the full screen.
    pub fn capture_region(&self, x: u16, y: u16, w: u16, h: u16) -> Result<Vec<u8>> {
        let (width, height) = self.size();
        if x.checked_add(w).map_or(true, |r| r > width)
            || y.checked_add(h).map_or(true, |b| b > height)
        {
            return Err(RfbError::Capture(format!(
                "region {x},{y} {w}x{h} outside {width}x{height} screen"
            )));
        }

        let full = self.capture_full()?;
        let stride = width as usize * 4;
        let mut out = Vec::with_capacity(w as usize * h as usize * 4);
        for row in y..y + h {
            let start = row as usize * stride + x as usize * 4;
            out.extend_from_slice(&full[start..start + w as usize * 4]);
        }
        Ok(out)
    }

    /// Decodes a keysym and delivers the key. Unknown keysyms are dropped
    /// silently.
    pub fn inject_key(&self, sym: u32, down: bool) {
        let Some(key) = keysym::lookup(sym) else {
            debug!("Dropping unknown keysym 0x{sym:04x}");
            return;
        };
        match self {
            Display::Simulated(sim) => sim.record(InjectedEvent::Key { key, down }),
            Display::Real(backend) => backend.inject_key(key, down),
        }
    }

    /// Delivers pointer position and button state. Coordinates are expected
    /// to be pre-clamped to the framebuffer by the caller.
    pub fn inject_pointer(&self, x: u16, y: u16, button_mask: u8) {
        match self {
            Display::Simulated(sim) => sim.record(InjectedEvent::Pointer { x, y, button_mask }),
            Display::Real(backend) => backend.inject_pointer(x, y, button_mask),
        }
    }
}

/// Deterministic display producing an animated gradient.
///
/// Each capture advances a frame counter and renders a pattern that is a
/// pure function of (x, y, frame), so tests can predict pixel contents.
/// Injected input events are recorded and drainable.
pub struct SimulatedDisplay {
    width: u16,
    height: u16,
    frame: AtomicU64,
    animate: bool,
    injected: Mutex<Vec<InjectedEvent>>,
}

impl SimulatedDisplay {
    /// Creates an animated display of the given size.
    pub fn new(width: u16, height: u16) -> Self {
        Self {
            width,
            height,
            frame: AtomicU64::new(0),
            animate: true,
            injected: Mutex::new(Vec::new()),
        }
    }

    /// Creates a display whose content never changes between captures.
    pub fn frozen(width: u16, height: u16) -> Self {
        Self {
            animate: false,
            ..Self::new(width, height)
        }
    }

    /// Renders the gradient for the current frame counter, advancing it
    /// when animation is enabled.
    fn render_frame(&self) -> Vec<u8> {
        let frame = if self.animate {
            self.frame.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.frame.load(Ordering::Relaxed)
        };
        self.render_at(frame)
    }

    /// Renders the gradient for an explicit frame number.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn render_at(&self, frame: u64) -> Vec<u8> {
        let mut pixels = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..u64::from(self.height) {
            for x in 0..u64::from(self.width) {
                let r = ((x + frame) % 256) as u8;
                let g = ((y + frame / 2) % 256) as u8;
                let wave =
                    (128.0 + 127.0 * ((x + frame) as f64 / 100.0 * std::f64::consts::PI)) as u64;
                let b = (wave % 256) as u8;
                pixels.extend_from_slice(&[b, g, r, 0]);
            }
        }
        pixels
    }

    /// Current frame counter.
    pub fn frame(&self) -> u64 {
        self.frame.load(Ordering::Relaxed)
    }

    fn record(&self, event: InjectedEvent) {
        self.injected.lock().expect("injected lock poisoned").push(event);
    }

    /// Drains and returns the recorded input events.
    pub fn take_injected(&self) -> Vec<InjectedEvent> {
        std::mem::take(&mut *self.injected.lock().expect("injected lock poisoned"))
    }
}
