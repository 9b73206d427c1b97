// linear congruential stream of the classic word2vec tool. Each worker owns its own
// stream, seeded with its thread index, so no generator state is ever shared.

const MULTIPLIER: u64 = 25214903917;
const INCREMENT: u64 = 11;

#[derive(Clone, Debug)]
pub struct NextRandom {
    state: u64,
}

impl NextRandom {

    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    #[inline]
    pub fn advance(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(MULTIPLIER).wrapping_add(INCREMENT);
        self.state
    }

    /// Advances the stream and returns a fraction in `[0, 1)` with 16 bits of resolution.
    #[inline]
    pub fn uniform(&mut self) -> f32 {
        ((self.advance() >> 16) & 0xFFFF) as f32 / 65536.0
    }

    /// Advances the stream and returns an index in `0..bound`.
    #[inline]
    pub fn below(&mut self, bound: usize) -> usize {
        debug_assert!(bound > 0);
        ((self.advance() >> 16) % bound as u64) as usize
    }
}
