// imports
use crate::config::{Config, Params, Task};
use crate::errors::{DepVecError, Result};
use crate::phrases::PhraseMatcher;
use crate::provider::{ExtractionParams, LearningExampleProvider, LEMMA_COLUMN, TOKEN_COLUMN};
use crate::train::{TrainParams, Trainer};
use crate::vectors::VectorsModel;
use crate::vocabulary::Vocabulary;

use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Suffix given to proper names merged into a lemma model.
pub const PROPER_NAMES_SUFFIX: &str = "_PN";

pub struct Pipeline {}

impl Pipeline {

    // runs the procedure of 3 steps -
    // -> configuration of arguments
    // -> loading vocabularies and building the network
    // -> training and saving

    pub fn run(args: &[String]) -> Result<()> {

        info!("building parameters...");
        let params = Config::new(args)?.get_params();
        info!("{}", params);
        Pipeline::execute(&params, None)
    }

    /// Runs the task of `params`. `mwe` only takes part in the main lemma flow.
    pub fn execute(params: &Params, mwe: Option<Arc<dyn PhraseMatcher>>) -> Result<()> {
        match params.task {
            Task::Train if params.proper_names() => Pipeline::train_proper_names(params),
            Task::Train => Pipeline::train_main(params, mwe),
            Task::ToksTrain => Pipeline::train_tokens(params),
        }
    }

    fn train_main(params: &Params, mwe: Option<Arc<dyn PhraseMatcher>>) -> Result<()> {

        if params.vocab_p.is_some() {
            warn!("vocab_p is ignored when vocab_m is defined");
        }
        let vocab_m = required(&params.vocab_m, "vocab_m")?;
        let mut trainer = Pipeline::build(params, vocab_m, false, LEMMA_COLUMN, mwe.clone())?;

        let timer = Instant::now();
        trainer.create_net()?;
        trainer.init_net()?;
        trainer.train()?;
        info!("finished training, took {} seconds ...", timer.elapsed().as_secs());

        if let Some(mwe) = mwe {
            // fold transient phrase vectors into their head words
            let collapsing_info = mwe.transient_groups(trainer.words_vocabulary());
            trainer.vectors_weighted_collapsing(&collapsing_info)?;
        }
        trainer.save_embeddings(&params.model, params.model_fmt)?;
        if let Some(backup) = &params.backup {
            trainer.backup(backup, false, true)?;
            info!("context vectors backed up to {}", backup.display());
        }
        Ok(())
    }

    fn train_proper_names(params: &Params) -> Result<()> {

        let vocab_p = required(&params.vocab_p, "vocab_p")?;
        let mut trainer = Pipeline::build(params, vocab_p, true, LEMMA_COLUMN, None)?;

        trainer.create_net()?;
        trainer.init_net()?;
        let vm = VectorsModel::load(&params.model, params.model_fmt, false)?;
        trainer.restore_assoc_by_model(&vm)?;
        trainer.restore(required(&params.restore, "restore")?, false, true)?;

        let timer = Instant::now();
        trainer.train()?;
        info!("finished training, took {} seconds ...", timer.elapsed().as_secs());

        trainer.words_vocabulary_mut().suffixize(PROPER_NAMES_SUFFIX);
        trainer.append_embeddings(&params.model, params.model_fmt)
    }

    fn train_tokens(params: &Params) -> Result<()> {

        let vocab_t = required(&params.vocab_t, "vocab_t")?;
        let vm = VectorsModel::load(&params.model, params.model_fmt, false)?;
        let mut trainer = Pipeline::build(params, vocab_t, false, TOKEN_COLUMN, None)?;

        trainer.create_net()?;
        trainer.init_net()?;
        trainer.restore_left_matrix_by_model(&vm)?;
        trainer.restore(required(&params.restore, "restore")?, false, true)?;

        let timer = Instant::now();
        trainer.train()?;
        info!("finished training, took {} seconds ...", timer.elapsed().as_secs());

        trainer.save_embeddings(&params.model, params.model_fmt)
    }

    // loads the vocabularies and wires the example provider to a trainer
    fn build(
        params: &Params,
        words_path: &Path,
        proper_names: bool,
        emb_column: usize,
        mwe: Option<Arc<dyn PhraseMatcher>>,
    ) -> Result<Trainer> {

        let timer = Instant::now();
        info!("loading vocabularies...");

        let words = Arc::new(load_vocabulary(words_path, params.sample_w, None)?);
        let dep = match (&params.vocab_d, params.size_d > 0) {
            (Some(path), true) => Some(Arc::new(load_vocabulary(path, params.sample_d, None)?)),
            _ => None,
        };
        let assoc = match (&params.vocab_a, params.size_a > 0) {
            (Some(path), true) => Some(Arc::new(load_vocabulary(path, params.sample_a, params.stoplist_a.as_deref())?)),
            _ => None,
        };
        info!("vocabularies loaded, took {} seconds ...", timer.elapsed().as_secs());

        let extraction = ExtractionParams {
            emb_column,
            dep_column: params.dep_column(),
            use_deprel: params.use_deprel,
            sample_w: params.sample_w,
            sample_d: params.sample_d,
            sample_a: params.sample_a,
        };
        let lep = LearningExampleProvider::new(
            &params.train,
            params.threads,
            Arc::clone(&words),
            proper_names,
            dep.clone(),
            assoc.clone(),
            mwe,
            extraction,
        )?;

        let train_params = TrainParams {
            size_dep: params.size_d,
            size_assoc: params.size_a,
            epochs: params.iter,
            alpha: params.alpha,
            negative: params.negative,
            noise_table_size: params.noise_table_size,
        };
        Trainer::new(Arc::new(lep), words, proper_names, dep, assoc, train_params)
    }
}

fn required<'a>(path: &'a Option<PathBuf>, key: &str) -> Result<&'a Path> {
    path.as_deref().ok_or_else(|| DepVecError::Config(format!("{} must be defined", key)))
}

fn load_vocabulary(path: &Path, sample: f32, stoplist: Option<&Path>) -> Result<Vocabulary> {
    let mut vocabulary = Vocabulary::new();
    if let Some(stoplist) = stoplist {
        vocabulary.load_stoplist(stoplist)?;
    }
    vocabulary.load(path)?;
    vocabulary.sampling_estimation(sample);
    Ok(vocabulary)
}
