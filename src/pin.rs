//! Host/guest access codes for the virtual-meeting links.

use rand::Rng;
use std::collections::HashSet;

use crate::error::{AppErr, AppResult};

pub const DEFAULT_ALPHABET: &str = "0123456789";
pub const DEFAULT_LENGTH: usize = 6;
pub const DEFAULT_ATTEMPTS: u32 = 32;

#[derive(Debug, Clone)]
pub struct PinAllocator {
    alphabet: Vec<char>,
    len: usize,
    attempts: u32,
}

impl Default for PinAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHABET, DEFAULT_LENGTH, DEFAULT_ATTEMPTS)
    }
}

impl PinAllocator {
    /// Empty alphabets fall back to digits, zero lengths/attempts to 1.
    pub fn new(alphabet: &str, len: usize, attempts: u32) -> Self {
        let mut chars: Vec<char> = alphabet.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        if chars.is_empty() {
            chars = DEFAULT_ALPHABET.chars().collect();
        }
        Self { alphabet: chars, len: len.max(1), attempts: attempts.max(1) }
    }

    pub fn attempts(&self) -> u32 { self.attempts }

    pub fn candidate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.len)
            .map(|_| self.alphabet[rng.gen_range(0..self.alphabet.len())])
            .collect()
    }

    /// Picks `(host, guest)`, both absent from `taken` and different from each other.
    pub fn allocate(&self, taken: &HashSet<String>) -> AppResult<(String, String)> {
        let host = self
            .pick(|c| !taken.contains(c))
            .ok_or(AppErr::PinExhausted(self.attempts))?;
        let guest = self
            .pick(|c| c != &host && !taken.contains(c))
            .ok_or(AppErr::PinExhausted(self.attempts))?;
        Ok((host, guest))
    }

    fn pick(&self, free: impl Fn(&String) -> bool) -> Option<String> {
        (0..self.attempts).map(|_| self.candidate()).find(|c| free(c))
    }
}
