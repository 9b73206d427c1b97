// noise distribution for negative sampling over the dependency contexts

use crate::errors::{DepVecError, Result};
use crate::random::NextRandom;
use crate::vocabulary::Vocabulary;

use log::info;

pub const DEFAULT_TABLE_SIZE: usize = 100_000_000;

/// Flat table of vocabulary indices; every index fills a share of the table proportional to
/// `cn * sample_probability`, so a uniform draw over the table follows that distribution.
///
/// The weights are linear in the subsampled frequency. The `cn^0.75` smoothing of the
/// classic word2vec unigram table is not applied.
pub struct NoiseTable {
    table: Vec<u32>,
}

impl NoiseTable {

    pub fn new(vocabulary: &Vocabulary, table_size: usize) -> Result<Self> {

        if vocabulary.is_empty() {
            return Err(DepVecError::Config("noise distribution over an empty vocabulary".to_string()));
        }
        if vocabulary.len() > u32::MAX as usize {
            return Err(DepVecError::Config(format!("{} noise entries do not fit u32 indices", vocabulary.len())));
        }
        if table_size == 0 {
            return Err(DepVecError::Config("noise_table_size must be positive".to_string()));
        }

        let weight = |idx: usize| -> f64 {
            let entry = vocabulary.idx_to_data(idx);
            entry.cn as f64 * entry.sample_probability as f64
        };

        let mut norma: f64 = (0..vocabulary.len()).map(weight).sum();
        // all-zero frequencies degrade to a uniform distribution
        let uniform = norma <= 0.0;
        if uniform {
            norma = vocabulary.len() as f64;
        }
        let share = |idx: usize| if uniform { 1.0 / norma } else { weight(idx) / norma };

        let mut table: Vec<u32> = Vec::new();
        table.try_reserve_exact(table_size).map_err(|_| {
            DepVecError::Allocation(format!("{} MB for the noise table", table_size * 4 / 1048576))
        })?;

        let last = vocabulary.len() - 1;
        let mut i = 0;
        let mut cumulative = share(i);
        for a in 0..table_size {
            table.push(i as u32);
            if a as f64 / table_size as f64 > cumulative && i < last {
                i += 1;
                cumulative += share(i);
            }
        }

        info!("noise table: {} slots over {} contexts", table_size, vocabulary.len());
        Ok(Self { table })
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Draws one context index, advancing `next_random`.
    #[inline]
    pub fn sample(&self, next_random: &mut NextRandom) -> usize {
        self.table[next_random.below(self.table.len())] as usize
    }
}
