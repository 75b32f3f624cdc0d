//! Incremental UTF-8 validation for text payloads that arrive in fragments.

/// Outcome of feeding bytes to a [`Utf8Validator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Utf8State {
    /// Every code point seen so far is complete and valid.
    Ok,
    /// The last code point is still waiting for continuation bytes.
    Busy,
    /// The input is not UTF-8. Sticky: later calls keep failing.
    Fail,
}

/// Validates a byte stream as UTF-8 across arbitrary split points.
///
/// The state is a handful of integers, so a validator can be kept per
/// in-flight message without cost.
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    remaining: u8,
    scalar: u32,
    floor: u32,
    failed: bool,
}

impl Utf8Validator {
    pub fn new() -> Utf8Validator {
        Utf8Validator::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Utf8State {
        if self.failed {
            return Utf8State::Fail;
        }
        for &byte in bytes {
            if !self.step(byte) {
                self.failed = true;
                return Utf8State::Fail;
            }
        }
        if self.remaining == 0 {
            Utf8State::Ok
        } else {
            Utf8State::Busy
        }
    }

    fn step(&mut self, byte: u8) -> bool {
        if self.remaining == 0 {
            match byte {
                0x00..=0x7F => return true,
                0xC0..=0xDF => {
                    self.remaining = 1;
                    self.scalar = (byte & 0x1F) as u32;
                    self.floor = 0x80;
                }
                0xE0..=0xEF => {
                    self.remaining = 2;
                    self.scalar = (byte & 0x0F) as u32;
                    self.floor = 0x800;
                }
                0xF0..=0xF7 => {
                    self.remaining = 3;
                    self.scalar = (byte & 0x07) as u32;
                    self.floor = 0x1_0000;
                }
                _ => return false,
            }
        } else {
            if byte & 0xC0 != 0x80 {
                return false;
            }
            self.scalar = self.scalar << 6 | (byte & 0x3F) as u32;
            self.remaining -= 1;
            if self.remaining == 0 {
                // overlong encodings and surrogates only show at the end of
                // the sequence
                if self.scalar < self.floor {
                    return false;
                }
                if (0xD800..=0xDFFF).contains(&self.scalar) {
                    return false;
                }
                self.scalar = 0;
                return true;
            }
        }
        // a partial scalar that can no longer come out below the code point
        // limit fails right away instead of at the end of the sequence
        self.scalar << (6 * self.remaining as u32) <= 0x10_FFFF
    }
}
