/// Deterministic random source used by selection policies and transition delays.
///
/// Not cryptographic. Every draw is reproducible from the seed passed to `start`.
pub trait DeterministicRng {
    fn next_u64(&mut self) -> u64;

    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    /// Uniform in `[0, 1)` using 24 bits of mantissa.
    fn next_f32_unit(&mut self) -> f32 {
        let x = self.next_u32() >> 8;
        (x as f32) / ((1u32 << 24) as f32)
    }

    /// Uniform in `[min, max]`. Returns `min` when the range is empty.
    fn next_f32_in(&mut self, min: f32, max: f32) -> f32 {
        if max <= min {
            return min;
        }
        min + (max - min) * self.next_f32_unit()
    }

    /// Uniform index in `[0, len)`; `len == 0` yields 0.
    fn next_index(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        (self.next_u64() % len as u64) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    const GAMMA: u64 = 0x9E37_79B9_7F4A_7C15;

    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn reseed(&mut self, seed: u64) {
        self.state = seed;
    }
}

impl Default for SplitMix64 {
    fn default() -> Self {
        Self::new(Self::GAMMA)
    }
}

impl DeterministicRng for SplitMix64 {
    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(Self::GAMMA);
        mix64(self.state)
    }
}

pub fn mix64(mut x: u64) -> u64 {
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Derives an independent seed for a nested stream (e.g. a parallel tree owned by a task).
pub fn derive_seed(parent_seed: u64, owner: u64, stream: u64) -> u64 {
    mix64(parent_seed ^ mix64(owner.wrapping_add(SplitMix64::GAMMA)) ^ mix64(stream))
}
