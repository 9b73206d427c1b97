// imports
use crate::conll::{ConllReader, SentenceMatrix};
use crate::errors::Result;
use crate::phrases::PhraseMatcher;
use crate::random::NextRandom;
use crate::vocabulary::Vocabulary;

use log::{debug, info};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};


/// One training sample: a target word with the contexts it was seen with.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LearningExample {
    /// index in the word vocabulary
    pub word: usize,
    /// indices in the dependency contexts vocabulary
    pub dep_context: Vec<usize>,
    /// indices of the sentence co-occurring words (or of the associative vocabulary in proper-names mode)
    pub assoc_context: Vec<usize>,
}

/// Which corpus columns feed the vocabularies, and the subsampling thresholds.
#[derive(Clone, Debug)]
pub struct ExtractionParams {
    /// 0-based column holding the embedded word (lemma for the main model, token for token models)
    pub emb_column: usize,
    /// 0-based column the dependency contexts are built from
    pub dep_column: usize,
    /// glue the relation label to dependency contexts
    pub use_deprel: bool,
    pub sample_w: f32,
    pub sample_d: f32,
    pub sample_a: f32,
}

impl Default for ExtractionParams {
    fn default() -> Self {
        Self {
            emb_column: LEMMA_COLUMN,
            dep_column: LEMMA_COLUMN,
            use_deprel: true,
            sample_w: 1e-3,
            sample_d: 1e-3,
            sample_a: 1e-5,
        }
    }
}

pub const TOKEN_COLUMN: usize = 1;
pub const LEMMA_COLUMN: usize = 2;
const HEAD_COLUMN: usize = 6;
const DEPREL_COLUMN: usize = 7;

// per-thread reading state
struct ThreadEnvironment {
    reader: Option<ConllReader<BufReader<File>>>,
    shard_start: u64,
    shard_end: u64,
    sentence: Vec<LearningExample>,
    position_in_sentence: usize,
    next_random: NextRandom,
    words_count: u64,
    invalid_sentences: u64,
    sentence_matrix: SentenceMatrix,
}

impl ThreadEnvironment {
    fn new(thread_idx: usize, shard_start: u64, shard_end: u64) -> Self {
        Self {
            reader: None,
            shard_start,
            shard_end,
            sentence: Vec::new(),
            position_in_sentence: 0,
            next_random: NextRandom::new(thread_idx as u64),
            words_count: 0,
            invalid_sentences: 0,
            sentence_matrix: Vec::new(),
        }
    }
}

/// Turns a dependency-parsed corpus into a stream of `LearningExample`s, one stream per
/// training thread. Thread `i` reads the sentences whose separating blank line starts in
/// `[file_size / T * i, file_size / T * (i + 1))`; its epoch ends at the end of that range,
/// at end of file, or once it has read more than `cn_sum / T` vocabulary words.
pub struct LearningExampleProvider {
    train_filename: PathBuf,
    threads_count: usize,
    train_words: u64,
    words_vocabulary: Arc<Vocabulary>,
    proper_names: bool,
    dep_ctx_vocabulary: Option<Arc<Vocabulary>>,
    assoc_ctx_vocabulary: Option<Arc<Vocabulary>>,
    mwe_vocabulary: Option<Arc<dyn PhraseMatcher>>,
    params: ExtractionParams,
    // every slot is locked by its own thread only
    thread_environment: Vec<Mutex<ThreadEnvironment>>,
}

impl LearningExampleProvider {

    /// Vocabularies are expected to carry their `sampling_estimation` already.
    #[allow(clippy::too_many_arguments)]
    pub fn new<P: AsRef<Path>>(
        train_filename: P,
        threads_count: usize,
        words_vocabulary: Arc<Vocabulary>,
        proper_names: bool,
        dep_ctx_vocabulary: Option<Arc<Vocabulary>>,
        assoc_ctx_vocabulary: Option<Arc<Vocabulary>>,
        mwe_vocabulary: Option<Arc<dyn PhraseMatcher>>,
        params: ExtractionParams,
    ) -> Result<Self> {

        let threads_count = threads_count.max(1);
        let train_filename = train_filename.as_ref().to_path_buf();
        let train_file_size = fs::metadata(&train_filename)?.len();
        let train_words = words_vocabulary.cn_sum();

        let shard = train_file_size / threads_count as u64;
        let thread_environment = (0..threads_count)
            .map(|i| {
                let start = shard * i as u64;
                let end = if i + 1 == threads_count { u64::MAX } else { shard * (i as u64 + 1) };
                Mutex::new(ThreadEnvironment::new(i, start, end))
            })
            .collect();

        info!("corpus {}: {} bytes, {} training words, {} shards",
            train_filename.display(), train_file_size, train_words, threads_count);

        Ok(Self {
            train_filename,
            threads_count,
            train_words,
            words_vocabulary,
            proper_names,
            dep_ctx_vocabulary,
            assoc_ctx_vocabulary,
            mwe_vocabulary,
            params,
            thread_environment,
        })
    }

    pub fn threads_count(&self) -> usize {
        self.threads_count
    }

    /// Sum of the word vocabulary counts, the length of one epoch over all threads.
    pub fn train_words(&self) -> u64 {
        self.train_words
    }

    fn environment(&self, thread_idx: usize) -> MutexGuard<'_, ThreadEnvironment> {
        // the lock is never contended, a poisoned one only means a previous epoch panicked
        match self.thread_environment[thread_idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens the corpus for `thread_idx` at the first sentence of its shard.
    pub fn epoch_prepare(&self, thread_idx: usize) -> Result<()> {
        let mut env = self.environment(thread_idx);
        let reader = ConllReader::open(&self.train_filename, env.shard_start)?;
        env.reader = Some(reader);
        env.sentence.clear();
        env.position_in_sentence = 0;
        env.words_count = 0;
        env.invalid_sentences = 0;
        Ok(())
    }

    /// Releases the corpus handle of `thread_idx`.
    pub fn epoch_unprepare(&self, thread_idx: usize) -> Result<()> {
        let mut env = self.environment(thread_idx);
        env.reader = None;
        env.sentence.clear();
        env.position_in_sentence = 0;
        if env.invalid_sentences > 0 {
            info!("thread {}: {} malformed sentences skipped", thread_idx, env.invalid_sentences);
        }
        Ok(())
    }

    /// Vocabulary words read by `thread_idx` in the current epoch, subsampled ones included.
    pub fn words_seen(&self, thread_idx: usize) -> u64 {
        self.environment(thread_idx).words_count
    }

    /// Next example of `thread_idx`, `None` once its epoch is over.
    pub fn get(&self, thread_idx: usize) -> Result<Option<LearningExample>> {

        let mut guard = self.environment(thread_idx);
        let env = &mut *guard;

        if env.position_in_sentence >= env.sentence.len() {

            env.sentence.clear();
            env.position_in_sentence = 0;

            // word quota of this thread exhausted
            if env.words_count > self.train_words / self.threads_count as u64 {
                return Ok(None);
            }

            loop {

                let reader = match env.reader.as_mut() {
                    Some(reader) => reader,
                    None => return Ok(None),
                };
                let info = match reader.read_sentence(&mut env.sentence_matrix)? {
                    Some(info) => info,
                    None => return Ok(None),
                };

                // the sentence belongs to the next shard; the first sentence of the file counts as offset 0
                if info.separator.unwrap_or(0) >= env.shard_end {
                    return Ok(None);
                }
                if !info.valid {
                    env.invalid_sentences += 1;
                    continue;
                }
                if env.sentence_matrix.is_empty() {
                    continue;
                }
                if env.sentence_matrix[0][0].parse::<i64>().ok() != Some(1) {
                    env.invalid_sentences += 1;
                    continue;
                }

                self.sentence_to_examples(env);
                if !env.sentence.is_empty() {
                    break;
                }
            }
        }

        let example = std::mem::take(&mut env.sentence[env.position_in_sentence]);
        env.position_in_sentence += 1;
        Ok(Some(example))
    }

    fn context_key(&self, token: &[String], relation_token: &[String], direction: &str) -> String {
        let field = column(token, self.params.dep_column);
        if self.params.use_deprel {
            format!("{}{}{}", field, direction, column(relation_token, DEPREL_COLUMN))
        } else {
            field.to_string()
        }
    }

    // converts the sentence matrix of `env` into examples, filling `env.sentence`
    fn sentence_to_examples(&self, env: &mut ThreadEnvironment) {

        if let Some(mwe) = &self.mwe_vocabulary {
            mwe.put_phrases_into_sentence(&mut env.sentence_matrix);
        }

        let sentence_matrix = &env.sentence_matrix;
        let sm_size = sentence_matrix.len();
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); sm_size];
        let mut associations: BTreeSet<usize> = BTreeSet::new();

        if let Some(dep_vocabulary) = &self.dep_ctx_vocabulary {

            for (i, token) in sentence_matrix.iter().enumerate() {

                // an unparsable head counts as no head
                let parent_no: usize = column(token, HEAD_COLUMN).parse().unwrap_or(0);
                if parent_no < 1 || parent_no > sm_size {
                    continue;
                }
                let parent = &sentence_matrix[parent_no - 1];

                // the context as seen from the head of the relation
                let from_head = self.context_key(token, token, "<");
                if let Some(idx) = dep_vocabulary.word_to_idx(&from_head) {
                    deps[parent_no - 1].push(idx);
                }
                // the context as seen from the dependent
                let from_child = self.context_key(parent, token, ">");
                if let Some(idx) = dep_vocabulary.word_to_idx(&from_child) {
                    deps[i].push(idx);
                }
            }

            if self.params.sample_d > 0.0 {
                let next_random = &mut env.next_random;
                for token_deps in deps.iter_mut() {
                    token_deps.retain(|ctx| {
                        let keep = dep_vocabulary.idx_to_data(*ctx).sample_probability;
                        keep >= next_random.uniform()
                    });
                }
            }
        }

        if let Some(assoc_vocabulary) = &self.assoc_ctx_vocabulary {

            for rec in sentence_matrix.iter() {

                let assoc_idx = match assoc_vocabulary.word_to_idx(column(rec, LEMMA_COLUMN)) {
                    Some(idx) => idx,
                    None => continue,
                };

                if self.params.sample_a > 0.0 {
                    let keep = assoc_vocabulary.idx_to_data(assoc_idx).sample_probability;
                    if keep < env.next_random.uniform() {
                        continue;
                    }
                }

                if self.proper_names {
                    associations.insert(assoc_idx);
                } else if let Some(word_idx) = self.words_vocabulary.word_to_idx(column(rec, self.params.emb_column)) {
                    associations.insert(word_idx);
                }
            }
        }

        for (i, rec) in sentence_matrix.iter().enumerate() {

            let word_idx = match self.words_vocabulary.word_to_idx(column(rec, self.params.emb_column)) {
                Some(idx) => idx,
                None => continue,
            };
            env.words_count += 1;

            if self.params.sample_w > 0.0 {
                let keep = self.words_vocabulary.idx_to_data(word_idx).sample_probability;
                if keep < env.next_random.uniform() {
                    continue;
                }
            }

            // a word is not its own association
            env.sentence.push(LearningExample {
                word: word_idx,
                dep_context: std::mem::take(&mut deps[i]),
                assoc_context: associations.iter().copied().filter(|a| *a != word_idx).collect(),
            });
        }

        debug!("sentence of {} tokens gave {} examples", sm_size, env.sentence.len());
    }

}

fn column(token: &[String], idx: usize) -> &str {
    token.get(idx).map(String::as_str).unwrap_or("")
}


#[cfg(test)]
mod tests {

    use super::{ExtractionParams, LearningExample, LearningExampleProvider};
    use crate::vocabulary::Vocabulary;
    use std::io::Write;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn vocab(pairs: &[(&str, u64)]) -> Arc<Vocabulary> {
        let mut v = Vocabulary::new();
        for (w, cn) in pairs {
            v.append(w, *cn);
        }
        Arc::new(v)
    }

    fn token(id: usize, form: &str, lemma: &str, head: usize, rel: &str) -> String {
        format!("{}\t{}\t{}\tX\tX\t_\t{}\t{}\t_\t_\n", id, form, lemma, head, rel)
    }

    fn corpus_file(text: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    fn no_subsampling() -> ExtractionParams {
        ExtractionParams { sample_w: 0.0, sample_d: 0.0, sample_a: 0.0, ..Default::default() }
    }

    fn drain(provider: &LearningExampleProvider, thread_idx: usize) -> Vec<LearningExample> {
        provider.epoch_prepare(thread_idx).unwrap();
        let mut all = Vec::new();
        while let Some(le) = provider.get(thread_idx).unwrap() {
            all.push(le);
        }
        provider.epoch_unprepare(thread_idx).unwrap();
        all
    }

    #[test]
    fn contexts_from_both_sides_of_a_relation() {

        let text = String::new()
            + &token(1, "The", "the", 2, "det")
            + &token(2, "cat", "cat", 3, "nsubj")
            + &token(3, "sat", "sit", 0, "root")
            + "\n";
        let corpus = corpus_file(&text);

        let words = vocab(&[("the", 100), ("cat", 100), ("sit", 100)]);
        let deps = vocab(&[("cat>det", 1), ("the<det", 1), ("sit>nsubj", 1), ("cat<nsubj", 1)]);
        let assoc = vocab(&[("cat", 1), ("sit", 1)]);

        let provider = LearningExampleProvider::new(
            corpus.path(), 1, words, false, Some(deps), Some(assoc), None, no_subsampling()).unwrap();
        let examples = drain(&provider, 0);

        assert_eq!(examples, vec![
            LearningExample { word: 0, dep_context: vec![0], assoc_context: vec![1, 2] },
            LearningExample { word: 1, dep_context: vec![1, 2], assoc_context: vec![2] },
            LearningExample { word: 2, dep_context: vec![3], assoc_context: vec![1] },
        ]);
        assert_eq!(provider.words_seen(0), 3);
    }

    #[test]
    fn deprel_free_keys_and_proper_names_ids() {

        let text = String::new()
            + &token(1, "Anna", "anna", 2, "nsubj")
            + &token(2, "runs", "run", 0, "root")
            + "\n";
        let corpus = corpus_file(&text);

        let words = vocab(&[("anna", 10)]);
        let deps = vocab(&[("run", 1)]);
        let assoc = vocab(&[("walk", 1), ("run", 1)]);
        let params = ExtractionParams { use_deprel: false, ..no_subsampling() };

        let provider = LearningExampleProvider::new(
            corpus.path(), 1, words, true, Some(deps), Some(assoc), None, params).unwrap();
        let examples = drain(&provider, 0);

        // associations are ids of the associative vocabulary in proper-names mode
        assert_eq!(examples, vec![LearningExample { word: 0, dep_context: vec![0], assoc_context: vec![1] }]);
    }

    #[test]
    fn malformed_and_misnumbered_sentences_are_skipped() {

        let text = String::new()
            + "1\tbad\tline\n\n"
            + &token(2, "cat", "cat", 0, "root")
            + "\n"
            + "# comment only\n\n"
            + &token(1, "cat", "cat", 0, "root")
            + "\n";
        let corpus = corpus_file(&text);

        let provider = LearningExampleProvider::new(
            corpus.path(), 1, vocab(&[("cat", 5)]), false, None, None, None, no_subsampling()).unwrap();
        let examples = drain(&provider, 0);
        assert_eq!(examples, vec![LearningExample { word: 0, ..Default::default() }]);
    }

    #[test]
    fn word_quota_ends_the_epoch() {

        let mut text = String::new();
        for _ in 0..10 {
            text += &token(1, "cat", "cat", 0, "root");
            text += &token(2, "dog", "dog", 1, "conj");
            text += "\n";
        }
        let corpus = corpus_file(&text);

        // quota is cn_sum = 4 words, checked between sentences
        let provider = LearningExampleProvider::new(
            corpus.path(), 1, vocab(&[("cat", 2), ("dog", 2)]), false, None, None, None, no_subsampling()).unwrap();
        let examples = drain(&provider, 0);
        assert_eq!(examples.len(), 6);
    }

    #[test]
    fn shards_partition_the_corpus() {

        let lemmas = ["a", "b", "c", "d", "e", "f", "g"];
        let mut text = String::new();
        for s in 0..37 {
            text += &format!("# sent {}\n", s);
            let len = 1 + (s * 7) % 5;
            for t in 0..len {
                let lemma = lemmas[(s + t * 3) % lemmas.len()];
                let head = if t == 0 { 0 } else { t };
                text += &token(t + 1, lemma, lemma, head, "dep");
            }
            text += if s % 4 == 0 { "\r\n" } else { "\n" };
            if s % 9 == 0 {
                text += "\n";
            }
        }
        let corpus = corpus_file(&text);

        let words: Vec<(&str, u64)> = lemmas.iter().map(|l| (*l, 1_000_000)).collect();
        let dep_keys: Vec<String> = lemmas.iter().flat_map(|l| [format!("{}<dep", l), format!("{}>dep", l)]).collect();
        let deps: Vec<(&str, u64)> = dep_keys.iter().map(|k| (k.as_str(), 10)).collect();

        let run = |threads: usize| {
            let provider = LearningExampleProvider::new(
                corpus.path(), threads, vocab(&words), false, Some(vocab(&deps)), Some(vocab(&words)), None,
                no_subsampling()).unwrap();
            let mut all: Vec<LearningExample> = (0..threads).flat_map(|i| drain(&provider, i)).collect();
            all.sort();
            all
        };

        let single = run(1);
        assert!(!single.is_empty());
        // more threads than bytes per shard leaves most shards empty
        for threads in [2, 3, 5, 8, text.len() + 3] {
            assert_eq!(run(threads), single, "{} threads", threads);
        }
    }

    #[test]
    fn subsampling_drops_frequent_contexts() {

        let mut text = String::new();
        for _ in 0..200 {
            text += &token(1, "the", "the", 0, "root");
            text += &token(2, "rare", "rare", 1, "dep");
            text += &token(3, "cat", "cat", 1, "dep");
            text += "\n";
        }
        let corpus = corpus_file(&text);

        let params = ExtractionParams { sample_w: 0.0, sample_d: 1e-5, sample_a: 1e-5, ..Default::default() };
        let words = vocab(&[("the", 1_000_000), ("rare", 1_000_000), ("cat", 1_000_000)]);
        let mut deps = Vocabulary::new();
        deps.append("the>dep", 1_000_000);
        deps.append("rare<dep", 10);
        deps.append("cat<dep", 10);
        deps.sampling_estimation(params.sample_d);
        let mut assoc = Vocabulary::new();
        assoc.append("the", 1_000_000);
        assoc.append("rare", 10);
        assoc.append("cat", 10);
        assoc.sampling_estimation(params.sample_a);

        let provider = LearningExampleProvider::new(
            corpus.path(), 1, words, false, Some(Arc::new(deps)), Some(Arc::new(assoc)), None, params).unwrap();
        let examples = drain(&provider, 0);
        assert_eq!(examples.len(), 600);

        // a word is never its own association, whatever was dropped
        assert!(examples.iter().all(|e| !e.assoc_context.contains(&e.word)));

        let (heads, dependents): (Vec<&LearningExample>, Vec<&LearningExample>) =
            examples.iter().partition(|e| e.word == 0);
        assert_eq!(heads.len(), 200);

        // rare contexts are always kept
        assert!(heads.iter().all(|e| e.dep_context == vec![1, 2] && e.assoc_context == vec![1, 2]));
        for e in &dependents {
            let other = if e.word == 1 { 2 } else { 1 };
            assert!(e.assoc_context.contains(&other));
        }

        // the frequent ones mostly are not
        let kept_dep = dependents.iter().filter(|e| e.dep_context == vec![0]).count();
        let kept_assoc = dependents.iter().filter(|e| e.assoc_context.contains(&0)).count();
        assert!(kept_dep < 40, "kept {} of 400 frequent dependency contexts", kept_dep);
        assert!(kept_assoc < 40, "kept {} of 400 frequent associations", kept_assoc);
        assert!(dependents.iter().all(|e| e.dep_context.is_empty() || e.dep_context == vec![0]));
    }

    #[test]
    fn subsampling_drops_frequent_words() {

        let mut text = String::new();
        for _ in 0..200 {
            text += &token(1, "the", "the", 0, "root");
            text += &token(2, "rare", "rare", 1, "dep");
            text += "\n";
        }
        let corpus = corpus_file(&text);

        let mut words = Vocabulary::new();
        words.append("the", 1_000_000);
        words.append("rare", 10);
        let params = ExtractionParams { sample_w: 1e-4, sample_d: 0.0, sample_a: 0.0, ..Default::default() };
        words.sampling_estimation(params.sample_w);

        let provider = LearningExampleProvider::new(
            corpus.path(), 1, Arc::new(words), false, None, None, None, params).unwrap();
        let examples = drain(&provider, 0);

        let frequent = examples.iter().filter(|e| e.word == 0).count();
        let rare = examples.iter().filter(|e| e.word == 1).count();
        assert_eq!(rare, 200);
        assert!(frequent < 100, "kept {} of 200 frequent occurrences", frequent);
        assert_eq!(provider.words_seen(0), 400);
    }
}
