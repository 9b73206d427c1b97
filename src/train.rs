// imports
use crate::errors::{DepVecError, Result};
use crate::matrix::{axpy, dot, SharedMatrix};
use crate::noise::{NoiseTable, DEFAULT_TABLE_SIZE};
use crate::provider::{LearningExample, LearningExampleProvider};
use crate::random::NextRandom;
use crate::vectors::{VectorsFormat, VectorsModel};
use crate::vocabulary::Vocabulary;

use log::{debug, info, warn};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;


const EXP_TABLE_SIZE: usize = 1000;
const MAX_EXP: usize = 6;
// integer ratio of the table size to the [-MAX_EXP, MAX_EXP] span
const EXP_SCALE: f32 = (EXP_TABLE_SIZE / MAX_EXP / 2) as f32;
const ALPHA_CHUNK_LIMIT: u64 = 10_000;
// magnitude above which same-signed dependency updates get damped
const DAMPING_THRESHOLD: f32 = 0.5;

/// Shape of the network and schedule of the optimizer.
#[derive(Clone, Debug)]
pub struct TrainParams {
    pub size_dep: usize,
    pub size_assoc: usize,
    pub epochs: usize,
    pub alpha: f32,
    pub negative: usize,
    pub noise_table_size: usize,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            size_dep: 75,
            size_assoc: 25,
            epochs: 5,
            alpha: 0.025,
            negative: 5,
            noise_table_size: DEFAULT_TABLE_SIZE,
        }
    }
}

// weight matrices, allocated by `create_net`
struct Net {
    // input vectors, `size_dep + size_assoc` wide
    syn0: SharedMatrix,
    // output vectors of the dependency contexts, `size_dep` wide
    syn1_dep: Option<SharedMatrix>,
    // frozen associative vectors, proper-names mode only
    syn1_assoc: Option<SharedMatrix>,
}

/// Skip-gram with negative sampling over dependency and associative contexts.
///
/// Workers update the shared matrices without synchronization (see `matrix`). The global
/// word counter and the learning rate are relaxed atomics: each worker may act on a
/// slightly stale value, which only shifts the decay schedule a little.
pub struct Trainer {
    lep: Arc<LearningExampleProvider>,
    w_vocabulary: Arc<Vocabulary>,
    proper_names: bool,
    dep_ctx_vocabulary: Option<Arc<Vocabulary>>,
    assoc_ctx_vocabulary: Option<Arc<Vocabulary>>,
    layer1_size: usize,
    size_dep: usize,
    size_assoc: usize,
    epoch_count: usize,
    starting_alpha: f32,
    negative: usize,
    threads_count: usize,
    exp_table: Vec<f32>,
    table_dep: Option<NoiseTable>,
    train_words: u64,
    alpha_chunk: u64,
    word_count_actual: AtomicU64,
    alpha: AtomicU32,
    net: Option<Net>,
}

impl Trainer {

    /// Vocabularies must be the ones the provider was built with.
    pub fn new(
        lep: Arc<LearningExampleProvider>,
        w_vocabulary: Arc<Vocabulary>,
        proper_names: bool,
        dep_ctx_vocabulary: Option<Arc<Vocabulary>>,
        assoc_ctx_vocabulary: Option<Arc<Vocabulary>>,
        params: TrainParams,
    ) -> Result<Self> {

        // f(x) = e^x / (e^x + 1) sampled over [-MAX_EXP, MAX_EXP)
        let exp_table: Vec<f32> = (0..=EXP_TABLE_SIZE)
            .map(|i| {
                let e = ((i as f32 / EXP_TABLE_SIZE as f32 * 2.0 - 1.0) * MAX_EXP as f32).exp();
                e / (e + 1.0)
            })
            .collect();

        let threads_count = lep.threads_count();
        let train_words = lep.train_words();
        let alpha_chunk = (train_words.saturating_sub(1) / threads_count as u64).min(ALPHA_CHUNK_LIMIT);

        let table_dep = match &dep_ctx_vocabulary {
            Some(vocabulary) => Some(NoiseTable::new(vocabulary, params.noise_table_size)?),
            None => None,
        };

        Ok(Self {
            lep,
            w_vocabulary,
            proper_names,
            dep_ctx_vocabulary,
            assoc_ctx_vocabulary,
            layer1_size: params.size_dep + params.size_assoc,
            size_dep: params.size_dep,
            size_assoc: params.size_assoc,
            epoch_count: params.epochs,
            starting_alpha: params.alpha,
            negative: params.negative,
            threads_count,
            exp_table,
            table_dep,
            train_words,
            alpha_chunk,
            word_count_actual: AtomicU64::new(0),
            alpha: AtomicU32::new(params.alpha.to_bits()),
            net: None,
        })
    }

    pub fn layer1_size(&self) -> usize {
        self.layer1_size
    }

    pub fn words_vocabulary(&self) -> &Vocabulary {
        &self.w_vocabulary
    }

    /// Mutable access to the word vocabulary, e.g. to rename rows before saving.
    /// The provider keeps its own copy once the two diverge.
    pub fn words_vocabulary_mut(&mut self) -> &mut Vocabulary {
        Arc::make_mut(&mut self.w_vocabulary)
    }

    fn net(&self) -> Result<&Net> {
        self.net.as_ref().ok_or_else(|| DepVecError::Config("network is not created".to_string()))
    }

    fn net_mut(&mut self) -> Result<&mut Net> {
        self.net.as_mut().ok_or_else(|| DepVecError::Config("network is not created".to_string()))
    }

    /// Allocates the weight matrices.
    pub fn create_net(&mut self) -> Result<()> {

        let syn0 = SharedMatrix::new(self.w_vocabulary.len(), self.layer1_size)?;
        let syn1_dep = match &self.dep_ctx_vocabulary {
            Some(vocabulary) => Some(SharedMatrix::new(vocabulary.len(), self.size_dep)?),
            None => None,
        };
        let syn1_assoc = match &self.assoc_ctx_vocabulary {
            Some(vocabulary) if self.proper_names => Some(SharedMatrix::new(vocabulary.len(), self.size_assoc)?),
            _ => None,
        };

        info!("network: {} x {} input, {} dependency and {} associative output rows",
            syn0.rows(), syn0.width(),
            syn1_dep.as_ref().map_or(0, |m| m.rows()),
            syn1_assoc.as_ref().map_or(0, |m| m.rows()));

        self.net = Some(Net { syn0, syn1_dep, syn1_assoc });
        Ok(())
    }

    /// Random input vectors, frequent words closer to zero; zero output vectors.
    pub fn init_net(&mut self) -> Result<()> {

        let layer1_size = self.layer1_size as f32;
        let w_vocabulary = Arc::clone(&self.w_vocabulary);
        let net = self.net_mut()?;

        let mut next_random = NextRandom::new(1);
        for a in 0..w_vocabulary.len() {
            let denominator = (w_vocabulary.idx_to_data(a).cn.max(1) as f32).sqrt();
            for value in net.syn0.row_mut(a) {
                *value = (next_random.uniform() - 0.5) / layer1_size / denominator;
            }
        }
        if let Some(syn1_dep) = net.syn1_dep.as_mut() {
            syn1_dep.fill(0.0);
        }
        if let Some(syn1_assoc) = net.syn1_assoc.as_mut() {
            syn1_assoc.fill(0.0);
        }
        Ok(())
    }

    /// Runs every epoch on one worker per provider thread and returns once all of them are done.
    pub fn train(&self) -> Result<()> {

        let net = self.net()?;
        let my_time = Instant::now();

        self.word_count_actual.store(0, Ordering::Relaxed);
        self.alpha.store(self.starting_alpha.to_bits(), Ordering::Relaxed);

        let pool = ThreadPoolBuilder::new()
            .num_threads(self.threads_count)
            .thread_name(|i| format!("trainer-{}", i))
            .build()?;

        info!("training: {} threads, {} epochs, {} words per epoch", self.threads_count, self.epoch_count, self.train_words);

        pool.install(|| {
            (0..self.threads_count)
                .into_par_iter()
                .with_max_len(1)
                .map(|thread_idx| self.train_entry_point(net, thread_idx, my_time))
                .collect::<Result<()>>()
        })?;

        info!("training finished, {} words processed, took: {} seconds...",
            self.word_count_actual.load(Ordering::Relaxed), my_time.elapsed().as_secs());
        Ok(())
    }

    fn train_entry_point(&self, net: &Net, thread_idx: usize, started: Instant) -> Result<()> {

        let mut next_random_ns = NextRandom::new(thread_idx as u64);
        let mut neu1e = vec![0.0f32; self.size_dep];

        for epoch_idx in 0..self.epoch_count {

            self.lep.epoch_prepare(thread_idx)?;
            let mut word_count: u64 = 0;
            let mut last_word_count: u64 = 0;
            let mut examples: u64 = 0;

            loop {

                // learning rate checkpoint
                if word_count - last_word_count > self.alpha_chunk {
                    let delta = word_count - last_word_count;
                    let actual = self.word_count_actual.fetch_add(delta, Ordering::Relaxed) + delta;
                    last_word_count = word_count;
                    self.update_alpha(actual, started);
                }

                let learning_example = self.lep.get(thread_idx)?;
                word_count = self.lep.words_seen(thread_idx);
                let learning_example = match learning_example {
                    Some(le) => le,
                    None => break,
                };

                let alpha = f32::from_bits(self.alpha.load(Ordering::Relaxed));
                self.skip_gram(net, &learning_example, &mut neu1e, &mut next_random_ns, alpha);
                examples += 1;
            }

            self.word_count_actual.fetch_add(word_count - last_word_count, Ordering::Relaxed);
            self.lep.epoch_unprepare(thread_idx)?;
            info!("thread {}: epoch {} / {} done, {} words, {} examples",
                thread_idx, epoch_idx + 1, self.epoch_count, word_count, examples);
        }
        Ok(())
    }

    fn update_alpha(&self, word_count_actual: u64, started: Instant) {

        let fraction = word_count_actual as f32 / (self.epoch_count as u64 * self.train_words + 1) as f32;
        let alpha = (self.starting_alpha * (1.0 - fraction)).max(self.starting_alpha * 1e-4);
        self.alpha.store(alpha.to_bits(), Ordering::Relaxed);

        let seconds = started.elapsed().as_secs_f64().max(1e-9);
        debug!("alpha: {:.6}  progress: {:.2}%  words/sec: {:.2}k",
            alpha, fraction * 100.0, word_count_actual as f64 / (seconds * 1000.0));
    }

    #[inline]
    fn sigmoid(&self, f: f32) -> f32 {
        if f > MAX_EXP as f32 {
            1.0
        } else if f < -(MAX_EXP as f32) {
            0.0
        } else {
            self.exp_table[((f + MAX_EXP as f32) * EXP_SCALE) as usize]
        }
    }

    fn skip_gram(&self, net: &Net, le: &LearningExample, neu1e: &mut [f32], next_random_ns: &mut NextRandom, alpha: f32) {

        let size_dep = self.size_dep;
        let size_assoc = self.size_assoc;

        // Safety: every index below comes from the vocabularies the matrices were sized with,
        // the pointers stay inside their rows, and no slice of the matrices is alive while
        // workers run. Races with other workers are the accepted Hogwild ones.
        unsafe {

            let target = net.syn0.row_ptr(le.word, 0);

            if let (Some(syn1_dep), Some(table_dep)) = (net.syn1_dep.as_ref(), self.table_dep.as_ref()) {

                for &ctx_idx in le.dep_context.iter() {

                    neu1e.fill(0.0);

                    for d in 0..=self.negative {

                        let (selected_ctx, label) = if d == 0 {
                            (ctx_idx, 1.0)
                        } else {
                            (table_dep.sample(next_random_ns), 0.0)
                        };

                        let ctx = syn1_dep.row_ptr(selected_ctx, 0);
                        let f = dot(target, ctx, size_dep);
                        // overflowed samples are dropped, not propagated
                        if !f.is_finite() {
                            continue;
                        }
                        let g = (label - self.sigmoid(f)) * alpha;

                        // error of the hidden layer
                        axpy(g, ctx, neu1e.as_mut_ptr(), size_dep);
                        // hidden -> output
                        if !self.proper_names {
                            axpy(g, target, ctx, size_dep);
                        }
                    }

                    // input -> hidden
                    for (d, update) in neu1e.iter().enumerate() {
                        let value = target.add(d);
                        *value = damped_sum(*value, *update);
                    }
                }
            }

            if size_assoc == 0 {
                return;
            }

            let target = net.syn0.row_ptr(le.word, size_dep);

            match net.syn1_assoc.as_ref() {

                None if !self.proper_names => {

                    let w_vocabulary_size = net.syn0.rows();
                    for &ctx_idx in le.assoc_context.iter() {
                        for d in 0..=self.negative {

                            // negatives come uniformly from the word vocabulary
                            let (selected_ctx, label) = if d == 0 {
                                (ctx_idx, 1.0)
                            } else {
                                (next_random_ns.below(w_vocabulary_size), 0.0)
                            };

                            let ctx = net.syn0.row_ptr(selected_ctx, size_dep);
                            let f = dot(target, ctx, size_assoc);
                            if !f.is_finite() {
                                continue;
                            }
                            let g = (label - self.sigmoid(f)) * alpha;

                            if d == 0 {
                                axpy(g, ctx, target, size_assoc);
                            } else {
                                axpy(g, target, ctx, size_assoc);
                            }
                        }
                    }
                },

                Some(syn1_assoc) => {

                    // the reference vectors stay frozen, only the target moves
                    for &ctx_idx in le.assoc_context.iter() {
                        let ctx = syn1_assoc.row_ptr(ctx_idx, 0);
                        let f = dot(target, ctx, size_assoc);
                        if !f.is_finite() {
                            continue;
                        }
                        let g = (1.0 - self.sigmoid(f)) * alpha;
                        axpy(g, ctx, target, size_assoc);
                    }
                },

                // proper-names mode without an associative vocabulary
                None => {},
            }
        }
    }

    /// Writes the input vectors as a vectors model.
    pub fn save_embeddings<P: AsRef<Path>>(&self, path: P, format: VectorsFormat) -> Result<()> {

        let net = self.net()?;
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        writeln!(out, "{} {}", self.w_vocabulary.len(), self.layer1_size)?;
        write_rows(&mut out, format, &self.w_vocabulary, &net.syn0)?;
        out.flush()?;
        info!("{} vectors saved to {}", self.w_vocabulary.len(), path.as_ref().display());
        Ok(())
    }

    /// Rewrites the model at `path` with the input vectors added after its own rows.
    pub fn append_embeddings<P: AsRef<Path>>(&self, path: P, format: VectorsFormat) -> Result<()> {

        let net = self.net()?;
        let vm = VectorsModel::load(path.as_ref(), format, false)?;
        if vm.emb_size() != self.layer1_size {
            return Err(DepVecError::DimensionMismatch { expected: self.layer1_size, found: vm.emb_size() });
        }

        let mut out = BufWriter::new(File::create(path.as_ref())?);
        writeln!(out, "{} {}", vm.words_count() + self.w_vocabulary.len(), self.layer1_size)?;
        for (a, word) in vm.vocab.iter().enumerate() {
            VectorsModel::write_embedding(&mut out, format, word, &vm.row(a).to_vec())?;
        }
        write_rows(&mut out, format, &self.w_vocabulary, &net.syn0)?;
        out.flush()?;

        info!("{} vectors appended to {} ({} already there)",
            self.w_vocabulary.len(), path.as_ref().display(), vm.words_count());
        Ok(())
    }

    /// Dumps the input matrix (`left`) and the dependency output matrix (`right`) in binary
    /// records, each section headed by `"<rows> <width>"`.
    pub fn backup<P: AsRef<Path>>(&self, path: P, left: bool, right: bool) -> Result<()> {

        let net = self.net()?;
        let mut out = BufWriter::new(File::create(path.as_ref())?);
        if left {
            writeln!(out, "{} {}", self.w_vocabulary.len(), self.layer1_size)?;
            write_rows(&mut out, VectorsFormat::Binary, &self.w_vocabulary, &net.syn0)?;
        }
        if right {
            if let (Some(vocabulary), Some(syn1_dep)) = (&self.dep_ctx_vocabulary, &net.syn1_dep) {
                writeln!(out, "{} {}", vocabulary.len(), self.size_dep)?;
                write_rows(&mut out, VectorsFormat::Binary, vocabulary, syn1_dep)?;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Reloads matrices written by `backup` with the same `left`/`right` selection. Every
    /// section is checked against the live vocabularies before anything is overwritten, so
    /// on error the network is left as it was.
    pub fn restore<P: AsRef<Path>>(&mut self, path: P, left: bool, right: bool) -> Result<()> {

        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);

        let mut staged_left = None;
        if left {
            staged_left = Some(read_section(&mut reader, path, &self.w_vocabulary, self.layer1_size)?);
        }
        let mut staged_right = None;
        if right {
            if let Some(vocabulary) = &self.dep_ctx_vocabulary {
                staged_right = Some(read_section(&mut reader, path, vocabulary, self.size_dep)?);
            }
        }

        let net = self.net_mut()?;
        if let Some(rows) = staged_left {
            net.syn0.as_mut_slice().copy_from_slice(&rows);
        }
        if let (Some(rows), Some(syn1_dep)) = (staged_right, net.syn1_dep.as_mut()) {
            syn1_dep.as_mut_slice().copy_from_slice(&rows);
        }
        info!("network restored from {}", path.display());
        Ok(())
    }

    /// Copies the associative slice of `vm` into the frozen associative matrix; every context
    /// word has to be present in the model.
    pub fn restore_assoc_by_model(&mut self, vm: &VectorsModel) -> Result<()> {

        let vocabulary = match &self.assoc_ctx_vocabulary {
            Some(vocabulary) => Arc::clone(vocabulary),
            None => return Ok(()),
        };
        let (size_dep, size_assoc) = (self.size_dep, self.size_assoc);
        if vm.emb_size() != self.layer1_size {
            return Err(DepVecError::DimensionMismatch { expected: self.layer1_size, found: vm.emb_size() });
        }

        let index = model_index(vm);
        let mut staged: Vec<f32> = Vec::with_capacity(vocabulary.len() * size_assoc);
        for entry in vocabulary.entries() {
            let w_idx = index.get(entry.word.as_str()).copied().ok_or_else(|| {
                DepVecError::VocabularyDivergence(format!("associative context '{}' is absent from the model", entry.word))
            })?;
            let row = vm.row(w_idx);
            staged.extend(row.iter().skip(size_dep).take(size_assoc));
        }

        if let Some(syn1_assoc) = self.net_mut()?.syn1_assoc.as_mut() {
            syn1_assoc.as_mut_slice().copy_from_slice(&staged);
        }
        Ok(())
    }

    /// Seeds input rows from `vm` by word; words unknown to the model keep their current values.
    pub fn restore_left_matrix_by_model(&mut self, vm: &VectorsModel) -> Result<()> {

        if vm.emb_size() != self.layer1_size {
            return Err(DepVecError::DimensionMismatch { expected: self.layer1_size, found: vm.emb_size() });
        }

        let w_vocabulary = Arc::clone(&self.w_vocabulary);
        let index = model_index(vm);
        let net = self.net_mut()?;

        let mut seeded = 0;
        for (w, entry) in w_vocabulary.entries().iter().enumerate() {
            if let Some(&vm_idx) = index.get(entry.word.as_str()) {
                for (dst, src) in net.syn0.row_mut(w).iter_mut().zip(vm.row(vm_idx).iter()) {
                    *dst = *src;
                }
                seeded += 1;
            }
        }
        info!("{} of {} input vectors seeded from the model", seeded, w_vocabulary.len());
        Ok(())
    }

    /// For every group, overwrites the row of its first element with the weighted sum of the
    /// rows of the group.
    pub fn vectors_weighted_collapsing(&mut self, collapsing_info: &[Vec<(usize, f32)>]) -> Result<()> {

        let net = self.net_mut()?;
        let rows = net.syn0.rows();
        let mut avg = vec![0.0f32; net.syn0.width()];

        for group in collapsing_info {

            let first = match group.first() {
                Some((idx, _)) => *idx,
                None => continue,
            };
            if let Some((idx, _)) = group.iter().find(|(idx, _)| *idx >= rows) {
                warn!("collapsing group skipped: row {} out of {}", idx, rows);
                continue;
            }

            avg.fill(0.0);
            for &(idx, weight) in group {
                for (a, value) in avg.iter_mut().zip(net.syn0.row(idx)) {
                    *a += value * weight;
                }
            }
            net.syn0.row_mut(first).copy_from_slice(&avg);
        }
        Ok(())
    }

    /// Copy of the input vectors as a vectors model.
    pub fn embeddings(&self) -> Result<VectorsModel> {
        let net = self.net()?;
        let vocab = self.w_vocabulary.entries().iter().map(|e| e.word.clone()).collect();
        VectorsModel::new(vocab, net.syn0.to_array2())
    }
}

/// Dependency-part update of one target dimension: opposite signs or a small existing value
/// take the raw sum, otherwise the update shrinks with the magnitude already reached.
#[inline]
fn damped_sum(a: f32, b: f32) -> f32 {
    if a * b < 0.0 {
        return a + b;
    }
    let abs_a = a.abs();
    if abs_a <= DAMPING_THRESHOLD {
        a + b
    } else {
        a + b / (abs_a + (1.0 - DAMPING_THRESHOLD))
    }
}

fn write_rows<W: Write>(out: &mut W, format: VectorsFormat, vocabulary: &Vocabulary, matrix: &SharedMatrix) -> Result<()> {
    for (a, entry) in vocabulary.entries().iter().enumerate() {
        VectorsModel::write_embedding(out, format, &entry.word, matrix.row(a))?;
    }
    Ok(())
}

fn model_index(vm: &VectorsModel) -> HashMap<&str, usize> {
    let mut index = HashMap::with_capacity(vm.words_count());
    for (i, word) in vm.vocab.iter().enumerate() {
        index.entry(word.as_str()).or_insert(i);
    }
    index
}

// one backup section: header, then a binary record per vocabulary entry, in vocabulary order
fn read_section<R: BufRead>(reader: &mut R, path: &Path, vocabulary: &Vocabulary, width: usize) -> Result<Vec<f32>> {

    let mut header = String::new();
    reader.read_line(&mut header)?;
    let sizes: Vec<usize> = header
        .split_whitespace()
        .map(|x| x.parse::<usize>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|_| DepVecError::format(path, 0, format!("bad section header '{}'", header.trim_end())))?;
    let (rows, emb_size) = match sizes.as_slice() {
        [rows, emb_size] => (*rows, *emb_size),
        _ => return Err(DepVecError::format(path, 0, "missing section header")),
    };

    if rows != vocabulary.len() {
        return Err(DepVecError::VocabularyDivergence(format!(
            "{} rows stored, {} words in the vocabulary", rows, vocabulary.len())));
    }
    if emb_size != width {
        return Err(DepVecError::DimensionMismatch { expected: width, found: emb_size });
    }

    let mut data: Vec<f32> = Vec::new();
    data.try_reserve_exact(rows * width)
        .map_err(|_| DepVecError::Allocation(format!("{} x {} restored matrix", rows, width)))?;
    let mut word: Vec<u8> = Vec::new();
    let mut raw = vec![0u8; width * 4];

    for entry in vocabulary.entries() {
        word.clear();
        reader.read_until(b' ', &mut word)?;
        if word.last() == Some(&b' ') {
            word.pop();
        }
        if word != entry.word.as_bytes() {
            return Err(DepVecError::VocabularyDivergence(format!(
                "expected '{}', found '{}'", entry.word, String::from_utf8_lossy(&word))));
        }
        reader.read_exact(&mut raw)?;
        data.extend(raw.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])));
        word.clear();
        reader.read_until(b'\n', &mut word)?;
    }
    Ok(data)
}
