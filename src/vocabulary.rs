// imports
use crate::errors::{DepVecError, Result};

use log::{info, warn};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;


#[derive(Clone, Debug, PartialEq)]
pub struct VocabularyEntry {
    pub word: String,
    pub cn: u64,
    /// probability to keep an occurrence under subsampling, 1.0 until `sampling_estimation` runs
    pub sample_probability: f32,
}

impl VocabularyEntry {
    pub fn new(word: &str, cn: u64) -> Self {
        Self {
            word: word.to_owned(),
            cn,
            sample_probability: 1.0,
        }
    }
}

/// Ordered `(word, frequency)` list. The order of the entries is the index space of every
/// weight matrix built on top of it.
#[derive(Clone, Debug, Default)]
pub struct Vocabulary {
    entries: Vec<VocabularyEntry>,
    w2i: HashMap<String, usize>,
    stoplist: HashSet<String>,
}

impl Vocabulary {

    pub fn new() -> Self {
        Self::default()
    }

    /// Reads one `word count` pair per line. Words found in the stoplist are skipped, so the
    /// stoplist has to be loaded before the vocabulary itself.
    pub fn load<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {

        let path = path.as_ref();
        let reader = BufReader::new(File::open(path)?);

        self.entries.clear();
        self.w2i.clear();

        let mut skipped = 0;
        for (line_no, line) in reader.lines().enumerate() {

            let line = line?;
            let line = line.trim_end_matches('\r');
            if line.trim().is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let (word, cn) = match (fields.next(), fields.next(), fields.next()) {
                (Some(word), Some(cn), None) => (word, cn),
                _ => return Err(DepVecError::format(path, line_no + 1, "expected '<word> <count>'")),
            };
            let cn: u64 = cn
                .parse()
                .map_err(|_| DepVecError::format(path, line_no + 1, format!("bad frequency '{}'", cn)))?;

            if self.stoplist.contains(word) {
                skipped += 1;
                continue;
            }
            self.append(word, cn);
        }

        if skipped > 0 {
            info!("vocabulary {}: {} stopwords skipped", path.display(), skipped);
        }
        info!("vocabulary {} loaded, {} entries", path.display(), self.entries.len());
        Ok(())
    }

    /// One word per line.
    pub fn load_stoplist<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let reader = BufReader::new(File::open(path.as_ref())?);
        for line in reader.lines() {
            let line = line?;
            let word = line.trim();
            if !word.is_empty() {
                self.stoplist.insert(word.to_owned());
            }
        }
        Ok(())
    }

    pub fn word_to_idx(&self, word: &str) -> Option<usize> {
        self.w2i.get(word).copied()
    }

    /// Unvalidated lookup, the hot path relies on indices coming from this vocabulary.
    #[inline]
    pub fn idx_to_data(&self, idx: usize) -> &VocabularyEntry {
        debug_assert!(idx < self.entries.len(), "vocabulary index {} out of {}", idx, self.entries.len());
        &self.entries[idx]
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[VocabularyEntry] {
        &self.entries
    }

    pub fn cn_sum(&self) -> u64 {
        self.entries.iter().map(|e| e.cn).sum()
    }

    pub fn append(&mut self, word: &str, cn: u64) {
        if self.w2i.contains_key(word) {
            warn!("duplicate vocabulary word '{}', the first entry wins lookups", word);
        } else {
            self.w2i.insert(word.to_owned(), self.entries.len());
        }
        self.entries.push(VocabularyEntry::new(word, cn));
    }

    /// p = t + sqrt(t) with t = threshold * cn_sum / cn, capped at 1.
    /// A zero threshold keeps every probability at 1 (subsampling disabled).
    pub fn sampling_estimation(&mut self, threshold: f32) {

        if threshold <= 0.0 {
            return;
        }

        let threshold_mass = threshold as f64 * self.cn_sum() as f64;
        for entry in self.entries.iter_mut() {
            if entry.cn == 0 {
                entry.sample_probability = 1.0;
                continue;
            }
            let t = threshold_mass / entry.cn as f64;
            entry.sample_probability = (t + t.sqrt()).min(1.0) as f32;
        }
    }

    /// Appends `suffix` to every word (proper names get `_PN` before being merged into a model).
    pub fn suffixize(&mut self, suffix: &str) {
        for entry in self.entries.iter_mut() {
            entry.word.push_str(suffix);
        }
        self.rebuild_index();
    }

    /// Drops the last `n` entries.
    pub fn cut_tail(&mut self, n: usize) {
        let keep = self.entries.len().saturating_sub(n);
        self.entries.truncate(keep);
        self.rebuild_index();
    }

    fn rebuild_index(&mut self) {
        self.w2i.clear();
        for (i, entry) in self.entries.iter().enumerate() {
            self.w2i.entry(entry.word.clone()).or_insert(i);
        }
    }

}


#[cfg(test)]
mod tests {

    use super::Vocabulary;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn toy() -> Vocabulary {
        let mut v = Vocabulary::new();
        for (w, cn) in [("the", 5000), ("cat", 300), ("sat", 120), ("mat", 7)] {
            v.append(w, cn);
        }
        v
    }

    #[test]
    fn load_reads_pairs_in_order_and_honors_stoplist() {

        let mut vocab_file = NamedTempFile::new().unwrap();
        write!(vocab_file, "the 10\r\nof 8\nkot 3\n\n").unwrap();
        let mut stop_file = NamedTempFile::new().unwrap();
        writeln!(stop_file, "of").unwrap();

        let mut v = Vocabulary::new();
        v.load_stoplist(stop_file.path()).unwrap();
        v.load(vocab_file.path()).unwrap();

        assert_eq!(v.len(), 2);
        assert_eq!(v.idx_to_data(0).word, "the");
        assert_eq!(v.idx_to_data(1).cn, 3);
        assert_eq!(v.word_to_idx("of"), None);
        assert_eq!(v.cn_sum(), 13);
    }

    #[test]
    fn load_rejects_malformed_lines() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "the 10\ncat many").unwrap();
        assert!(Vocabulary::new().load(f.path()).is_err());
    }

    #[test]
    fn indexing_round_trips() {
        let v = toy();
        for idx in 0..v.len() {
            let word = v.idx_to_data(idx).word.clone();
            assert_eq!(v.word_to_idx(&word), Some(idx));
        }
        assert_eq!(v.word_to_idx("dog"), None);
    }

    #[test]
    fn zero_threshold_keeps_default_probabilities() {
        let mut v = toy();
        v.sampling_estimation(0.0);
        assert!(v.entries().iter().all(|e| e.sample_probability == 1.0));
    }

    #[test]
    fn subsampling_is_monotonic_in_frequency() {

        let mut v = toy();
        let threshold = 1e-3;
        v.sampling_estimation(threshold);

        // frequencies are descending, so probabilities must not decrease
        let probs: Vec<f32> = v.entries().iter().map(|e| e.sample_probability).collect();
        assert!(probs.windows(2).all(|w| w[0] <= w[1]));

        let bound = 4.0 * threshold as f64 * v.cn_sum() as f64;
        for e in v.entries() {
            assert!(e.sample_probability <= 1.0);
            if e.cn as f64 > bound {
                assert!(e.sample_probability < 1.0, "{} should be subsampled", e.word);
            }
        }
    }

    #[test]
    fn suffixize_and_cut_tail_keep_lookup_consistent() {
        let mut v = toy();
        v.suffixize("_PN");
        assert_eq!(v.word_to_idx("cat_PN"), Some(1));
        assert_eq!(v.word_to_idx("cat"), None);
        v.cut_tail(2);
        assert_eq!(v.len(), 2);
        assert_eq!(v.word_to_idx("sat_PN"), None);
    }
}
