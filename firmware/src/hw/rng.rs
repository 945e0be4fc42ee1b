//! Hardware random source.
//!
//! The ESP32 RNG draws on RF noise once the radio is running, which it is for
//! every consumer here (TLS handshakes, update nonces, the synthetic probe).

use esp_hal::rng::Rng;
use rand_core::{CryptoRng, RngCore};

#[derive(Clone, Copy)]
pub struct NodeRng(Rng);

impl NodeRng {
    pub fn new() -> Self {
        Self(Rng::new())
    }
}

impl Default for NodeRng {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for NodeRng {
    fn next_u32(&mut self) -> u32 {
        self.0.random()
    }

    fn next_u64(&mut self) -> u64 {
        (u64::from(self.next_u32()) << 32) | u64::from(self.next_u32())
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let word = self.next_u32().to_le_bytes();
            chunk.copy_from_slice(&word[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

impl CryptoRng for NodeRng {}
