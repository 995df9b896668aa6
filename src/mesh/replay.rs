/**
 * mesh/replay.rs
 *
 * Sliding anti-replay window over extended sequence numbers
 */

use thiserror::Error;

/// Window width in sequence numbers
pub const WINDOW: u64 = 256;

const WORDS: usize = (WINDOW / 64) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReplayError {
    #[error("sequence {0} already received")]
    Duplicate(u64),

    #[error("sequence {0} is older than the replay window")]
    TooOld(u64),
}

/// Tracks which of the last [`WINDOW`] sequence numbers have been seen.
///
/// Wire sequence numbers are 32 bits and wrap; they are extended to 64
/// bits by picking the candidate closest to the highest value seen, so a
/// late frame from before a wrap is still matched to the right epoch.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    highest: Option<u64>,
    /// Bit `i` records sequence `highest - i`
    bitmap: [u64; WORDS],
}

impl ReplayWindow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn highest(&self) -> Option<u64> {
        self.highest
    }

    /// Extend a 32-bit wire sequence number to 64 bits
    pub fn extend(&self, seq: u32) -> u64 {
        let Some(highest) = self.highest else {
            return u64::from(seq);
        };

        let epoch = highest >> 32;
        let candidate = |e: u64| (e << 32) | u64::from(seq);

        let mut best = candidate(epoch);
        let mut candidates = vec![candidate(epoch + 1)];
        if epoch > 0 {
            candidates.push(candidate(epoch - 1));
        }
        for c in candidates {
            if c.abs_diff(highest) < best.abs_diff(highest) {
                best = c;
            }
        }
        best
    }

    /// Check a wire sequence number without recording it. Returns the
    /// extended value to use for decryption and [`commit`](Self::commit).
    pub fn check(&self, seq: u32) -> Result<u64, ReplayError> {
        let ext = self.extend(seq);
        let Some(highest) = self.highest else {
            return Ok(ext);
        };

        if ext > highest {
            return Ok(ext);
        }

        let offset = highest - ext;
        if offset >= WINDOW {
            return Err(ReplayError::TooOld(ext));
        }
        if self.bit(offset) {
            return Err(ReplayError::Duplicate(ext));
        }
        Ok(ext)
    }

    /// Record an authenticated sequence number
    pub fn commit(&mut self, ext: u64) {
        match self.highest {
            None => {
                self.highest = Some(ext);
                self.bitmap = [0; WORDS];
                self.set(0);
            }
            Some(highest) if ext > highest => {
                self.shift(ext - highest);
                self.highest = Some(ext);
                self.set(0);
            }
            Some(highest) => {
                let offset = highest - ext;
                if offset < WINDOW {
                    self.set(offset);
                }
            }
        }
    }

    fn bit(&self, offset: u64) -> bool {
        let (word, bit) = ((offset / 64) as usize, offset % 64);
        self.bitmap[word] & (1 << bit) != 0
    }

    fn set(&mut self, offset: u64) {
        let (word, bit) = ((offset / 64) as usize, offset % 64);
        self.bitmap[word] |= 1 << bit;
    }

    fn shift(&mut self, by: u64) {
        if by >= WINDOW {
            self.bitmap = [0; WORDS];
            return;
        }

        let words = (by / 64) as usize;
        let bits = (by % 64) as u32;

        for i in (0..WORDS).rev() {
            let mut value = 0;
            if i >= words {
                let src = i - words;
                value = self.bitmap[src] << bits;
                if bits > 0 && src > 0 {
                    value |= self.bitmap[src - 1] >> (64 - bits);
                }
            }
            self.bitmap[i] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn accept(window: &mut ReplayWindow, seq: u32) -> Result<u64, ReplayError> {
        let ext = window.check(seq)?;
        window.commit(ext);
        Ok(ext)
    }

    #[test]
    fn duplicate_rejected() {
        let mut w = ReplayWindow::new();
        assert_eq!(accept(&mut w, 1), Ok(1));
        assert_eq!(accept(&mut w, 1), Err(ReplayError::Duplicate(1)));
    }

    #[test]
    fn late_frames_within_window_accepted_once() {
        let mut w = ReplayWindow::new();
        accept(&mut w, 300).unwrap();
        assert!(accept(&mut w, 100).is_ok());
        assert!(accept(&mut w, 100).is_err());
        assert_eq!(accept(&mut w, 44), Err(ReplayError::TooOld(44)));
    }

    #[test]
    fn check_does_not_record() {
        let mut w = ReplayWindow::new();
        accept(&mut w, 10).unwrap();
        assert!(w.check(11).is_ok());
        assert!(w.check(11).is_ok());
        assert_eq!(w.highest(), Some(10));
    }

    #[test]
    fn zero_after_wrap_is_new() {
        let mut w = ReplayWindow::new();
        accept(&mut w, u32::MAX).unwrap();
        assert_eq!(accept(&mut w, 0), Ok(1 << 32));
        // A straggler from before the wrap lands in the previous epoch
        assert_eq!(accept(&mut w, u32::MAX - 3), Ok(u64::from(u32::MAX - 3)));
        assert!(accept(&mut w, u32::MAX).is_err());
    }

    #[test]
    fn shift_across_words_keeps_bits() {
        let mut w = ReplayWindow::new();
        accept(&mut w, 0).unwrap();
        accept(&mut w, 70).unwrap();
        accept(&mut w, 200).unwrap();
        assert!(w.check(0).is_err());
        assert!(w.check(70).is_err());
        assert!(w.check(1).is_ok());
        accept(&mut w, 260).unwrap();
        assert_eq!(w.check(0), Err(ReplayError::TooOld(0)));
        assert!(w.check(70).is_err());
    }

    proptest! {
        #[test]
        fn each_sequence_accepted_at_most_once(seqs in proptest::collection::vec(0u32..600, 1..400)) {
            let mut w = ReplayWindow::new();
            let mut seen = HashSet::new();
            for seq in seqs {
                if let Ok(ext) = accept(&mut w, seq) {
                    prop_assert!(seen.insert(ext), "sequence {} accepted twice", ext);
                }
            }
        }

        #[test]
        fn in_order_stream_always_accepted(start in any::<u32>(), len in 1usize..600) {
            let mut w = ReplayWindow::new();
            let mut seq = start;
            for _ in 0..len {
                prop_assert!(accept(&mut w, seq).is_ok());
                seq = seq.wrapping_add(1);
            }
        }
    }
}
