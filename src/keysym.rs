//! X11 keysym constants and translation to typed keys.
//!
//! RFB key events carry X Window System keysyms. Printable ASCII keysyms
//! are their own character codes; the editing and function keys live in the
//! 0xFF00 page. Anything outside the table is dropped by the caller.

/// Keysym for the space character.
pub const XK_SPACE: u32 = 0x0020;
/// Keysym for the Backspace key.
pub const XK_BACKSPACE: u32 = 0xFF08;
/// Keysym for the Tab key.
pub const XK_TAB: u32 = 0xFF09;
/// Keysym for the Return key.
pub const XK_RETURN: u32 = 0xFF0D;
/// Keysym for the Escape key.
pub const XK_ESCAPE: u32 = 0xFF1B;
/// Keysym for the Delete key.
pub const XK_DELETE: u32 = 0xFFFF;
/// Keysym for F1; F1..=F12 occupy a contiguous range.
pub const XK_F1: u32 = 0xFFBE;
/// Keysym for F12.
pub const XK_F12: u32 = 0xFFC9;

/// A keyboard key decoded from an RFB keysym.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    /// A printable ASCII character (0x20..=0x7E), including space.
    Char(char),
    /// The Backspace key.
    Backspace,
    /// The Tab key.
    Tab,
    /// The Return key.
    Return,
    /// The Escape key.
    Escape,
    /// The Delete key.
    Delete,
    /// Function key F1..=F12, numbered from 1.
    Function(u8),
}

/// Maps a keysym to a typed key. Returns `None` for unknown keysyms.
#[allow(clippy::cast_possible_truncation)] // keysym - XK_F1 is at most 11
pub fn lookup(keysym: u32) -> Option<Key> {
    match keysym {
        0x20..=0x7E => Some(Key::Char(keysym as u8 as char)),
        XK_BACKSPACE => Some(Key::Backspace),
        XK_TAB => Some(Key::Tab),
        XK_RETURN => Some(Key::Return),
        XK_ESCAPE => Some(Key::Escape),
        XK_DELETE => Some(Key::Delete),
        XK_F1..=XK_F12 => Some(Key::Function((keysym - XK_F1) as u8 + 1)),
        _ => None,
    }
}
