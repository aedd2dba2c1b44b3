//! Anti-replay sliding window.
//!
//! Tracks accepted sequence numbers in a fixed bitset relative to the
//! highest accepted sequence. Rules:
//! - sequence below `highest - WINDOW`: reject
//! - sequence already marked seen (including the current highest): reject
//! - sequence above highest: shift the window forward and accept
//!
//! The check is split in two so the caller can pre-screen cheaply before
//! paying for AEAD verification and only commit the window after the tag
//! has verified.

use crate::core::constants::REPLAY_WINDOW;
use crate::core::CryptoError;

const WORDS: usize = REPLAY_WINDOW / 64;

/// Sliding bitset over the last [`REPLAY_WINDOW`] sequence numbers.
#[derive(Clone)]
pub struct ReplayWindow {
    /// Bit `i` (counting from the highest) set = sequence seen.
    bitmap: [u64; WORDS],
    /// Highest accepted sequence so far.
    highest: u64,
    /// False until the first sequence is accepted.
    initialized: bool,
}

impl ReplayWindow {
    /// Empty window; the first checked sequence initializes it.
    pub fn new() -> Self {
        Self {
            bitmap: [0; WORDS],
            highest: 0,
            initialized: false,
        }
    }

    /// Highest accepted sequence, if any frame was accepted yet.
    pub fn highest(&self) -> Option<u64> {
        self.initialized.then_some(self.highest)
    }

    /// Cheap pre-check without mutating the window.
    ///
    /// Run before AEAD verification so replays never cost a decryption.
    pub fn check(&self, sequence: u64) -> Result<(), CryptoError> {
        if !self.initialized || sequence > self.highest {
            return Ok(());
        }
        let diff = self.highest - sequence;
        if diff >= REPLAY_WINDOW as u64 || self.is_seen(diff) {
            return Err(CryptoError::Replay);
        }
        Ok(())
    }

    /// Commit an authenticated sequence into the window.
    ///
    /// Call only after the AEAD tag verified; a forged frame must never
    /// advance the window.
    pub fn commit(&mut self, sequence: u64) -> Result<(), CryptoError> {
        if !self.initialized {
            self.highest = sequence;
            self.bitmap[0] |= 1;
            self.initialized = true;
            return Ok(());
        }

        if sequence > self.highest {
            self.shift(sequence - self.highest);
            self.highest = sequence;
            self.bitmap[0] |= 1;
            return Ok(());
        }

        let diff = self.highest - sequence;
        if diff >= REPLAY_WINDOW as u64 || self.is_seen(diff) {
            return Err(CryptoError::Replay);
        }
        self.mark(diff);
        Ok(())
    }

    fn is_seen(&self, diff: u64) -> bool {
        let bit = diff as usize;
        self.bitmap[bit / 64] & (1u64 << (bit % 64)) != 0
    }

    fn mark(&mut self, diff: u64) {
        let bit = diff as usize;
        self.bitmap[bit / 64] |= 1u64 << (bit % 64);
    }

    /// Slide the window forward so bit 0 tracks the new highest.
    fn shift(&mut self, by: u64) {
        if by >= REPLAY_WINDOW as u64 {
            self.bitmap = [0; WORDS];
            return;
        }

        let word_shift = (by / 64) as usize;
        let bit_shift = (by % 64) as u32;

        if word_shift > 0 {
            for i in (word_shift..WORDS).rev() {
                self.bitmap[i] = self.bitmap[i - word_shift];
            }
            for word in self.bitmap.iter_mut().take(word_shift) {
                *word = 0;
            }
        }

        if bit_shift > 0 {
            let mut carry = 0u64;
            for word in self.bitmap.iter_mut() {
                let next_carry = *word >> (64 - bit_shift);
                *word = (*word << bit_shift) | carry;
                carry = next_carry;
            }
        }
    }
}

impl Default for ReplayWindow {
    fn default() -> Self {
        Self::new()
    }
}
