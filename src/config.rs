// imports
use crate::errors::{DepVecError, Result};
use crate::vectors::VectorsFormat;

use serde::Deserialize;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::PathBuf;


/// Which training flow to run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    /// lemma model, or proper names appended to a lemma model
    #[default]
    Train,
    /// token model fine-tuned from an existing lemma model
    ToksTrain,
}

impl Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Task::Train => write!(f, "train"),
            Task::ToksTrain => write!(f, "toks_train"),
        }
    }
}

/// Parameters of a run, read from the JSON file given on the command line.
/// Keys left out of the file take the defaults below.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Params {
    #[serde(default)]
    pub task: Task,
    /// dependency-parsed corpus
    pub train: PathBuf,
    /// vectors model written (or extended, or read for seeding)
    pub model: PathBuf,
    #[serde(default)]
    pub model_fmt: VectorsFormat,
    /// main (lemma) vocabulary
    pub vocab_m: Option<PathBuf>,
    /// proper names vocabulary
    pub vocab_p: Option<PathBuf>,
    /// tokens vocabulary
    pub vocab_t: Option<PathBuf>,
    /// dependency contexts vocabulary
    pub vocab_d: Option<PathBuf>,
    /// associative contexts vocabulary
    pub vocab_a: Option<PathBuf>,
    pub stoplist_a: Option<PathBuf>,
    pub backup: Option<PathBuf>,
    pub restore: Option<PathBuf>,
    /// 1-based corpus column the dependency contexts are built from
    #[serde(default = "default_col_ctx_d")]
    pub col_ctx_d: usize,
    #[serde(default = "default_true")]
    pub use_deprel: bool,
    #[serde(default = "default_size_d")]
    pub size_d: usize,
    #[serde(default = "default_size_a")]
    pub size_a: usize,
    #[serde(default = "default_negative")]
    pub negative: usize,
    #[serde(default = "default_alpha")]
    pub alpha: f32,
    #[serde(default = "default_iter")]
    pub iter: usize,
    #[serde(default = "default_sample_w")]
    pub sample_w: f32,
    #[serde(default = "default_sample_d")]
    pub sample_d: f32,
    #[serde(default = "default_sample_a")]
    pub sample_a: f32,
    #[serde(default = "num_cpus::get")]
    pub threads: usize,
    #[serde(default = "default_noise_table_size")]
    pub noise_table_size: usize,
}

fn default_col_ctx_d() -> usize { 3 }
fn default_true() -> bool { true }
fn default_size_d() -> usize { 75 }
fn default_size_a() -> usize { 25 }
fn default_negative() -> usize { 5 }
fn default_alpha() -> f32 { 0.025 }
fn default_iter() -> usize { 5 }
fn default_sample_w() -> f32 { 1e-3 }
fn default_sample_d() -> f32 { 1e-3 }
fn default_sample_a() -> f32 { 1e-5 }
fn default_noise_table_size() -> usize { crate::noise::DEFAULT_TABLE_SIZE }

impl Params {

    /// Cross-field checks, the per-field ones are done by deserialization.
    pub fn validate(&self) -> Result<()> {

        let fail = |message: &str| Err(DepVecError::Config(message.to_string()));

        if self.threads == 0 {
            return fail("threads must be at least 1");
        }
        if self.col_ctx_d == 0 || self.col_ctx_d > crate::conll::CONLL_COLUMNS {
            return fail("col_ctx_d must be a column number in 1..=10");
        }
        if self.size_d + self.size_a == 0 {
            return fail("size_d and size_a are both zero");
        }
        if self.size_d > 0 && self.vocab_d.is_none() {
            return fail("vocab_d must be defined when size_d > 0");
        }
        if self.size_a > 0 && self.vocab_a.is_none() {
            return fail("vocab_a must be defined when size_a > 0");
        }

        match self.task {
            Task::Train => {
                if self.vocab_m.is_none() && self.vocab_p.is_none() {
                    return fail("vocab_m or vocab_p must be defined");
                }
                if self.vocab_m.is_none() && self.restore.is_none() {
                    return fail("restore must be defined when vocab_p is defined");
                }
            },
            Task::ToksTrain => {
                if self.vocab_t.is_none() {
                    return fail("vocab_t must be defined");
                }
                if self.restore.is_none() {
                    return fail("restore must be defined");
                }
            },
        }
        Ok(())
    }

    /// True when proper names are trained against an existing model.
    pub fn proper_names(&self) -> bool {
        self.task == Task::Train && self.vocab_m.is_none()
    }

    /// 0-based index of the dependency context column.
    pub fn dep_column(&self) -> usize {
        self.col_ctx_d - 1
    }
}

impl Display for Params {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let show = |p: &Option<PathBuf>| p.as_ref().map_or("-".to_string(), |p| p.display().to_string());
        write!(f, "using parameters:
        task: {}
        train: {}
        model: {} ({})
        vocab_m: {}, vocab_p: {}, vocab_t: {}
        vocab_d: {}, vocab_a: {}, stoplist_a: {}
        backup: {}, restore: {}
        col_ctx_d: {}, use_deprel: {}
        size_d: {}, size_a: {}, negative: {}, alpha: {}, iter: {}
        sample_w: {}, sample_d: {}, sample_a: {}
        threads: {}, noise_table_size: {}",
        self.task, self.train.display(), self.model.display(), self.model_fmt,
        show(&self.vocab_m), show(&self.vocab_p), show(&self.vocab_t),
        show(&self.vocab_d), show(&self.vocab_a), show(&self.stoplist_a),
        show(&self.backup), show(&self.restore),
        self.col_ctx_d, self.use_deprel,
        self.size_d, self.size_a, self.negative, self.alpha, self.iter,
        self.sample_w, self.sample_d, self.sample_a,
        self.threads, self.noise_table_size)
    }
}

pub struct Config {
    params: Params,
}

impl Config {

    pub fn get_params(&self) -> Params {
        self.params.clone()
    }

    /// `args` as given by `std::env::args`: the program name and the path to a JSON file.
    pub fn new(args: &[String]) -> Result<Config> {

        if args.len() != 2 {
            return Err(DepVecError::Config("input should be a path to json file only".to_string()));
        }
        let f = BufReader::new(File::open(&args[1])?);
        Config::from_reader(f)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Config> {
        let params: Params = serde_json::from_reader(reader)?;
        params.validate()?;
        Ok(Self { params })
    }
}


#[cfg(test)]
mod tests {

    use super::{Config, Task};
    use crate::errors::DepVecError;
    use crate::vectors::VectorsFormat;
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::NamedTempFile;

    fn parse(json: &str) -> Result<Config, DepVecError> {
        Config::from_reader(json.as_bytes())
    }

    #[test]
    fn defaults_fill_missing_keys() {

        let params = parse(r#"{"train": "corpus.conll", "model": "vectors.bin",
            "vocab_m": "m.vocab", "vocab_d": "d.vocab", "vocab_a": "a.vocab"}"#).unwrap().get_params();

        assert_eq!(params.task, Task::Train);
        assert_eq!(params.model_fmt, VectorsFormat::Binary);
        assert_eq!(params.col_ctx_d, 3);
        assert_eq!(params.dep_column(), 2);
        assert!(params.use_deprel);
        assert_eq!((params.size_d, params.size_a, params.negative, params.iter), (75, 25, 5, 5));
        assert_eq!(params.alpha, 0.025);
        assert_eq!((params.sample_w, params.sample_d, params.sample_a), (1e-3, 1e-3, 1e-5));
        assert!(params.threads >= 1);
        assert_eq!(params.noise_table_size, 100_000_000);
        assert!(!params.proper_names());
        assert!(params.to_string().contains("vocab_m: m.vocab"));
    }

    #[test]
    fn explicit_values_and_tasks() {

        let params = parse(r#"{"task": "toks_train", "train": "c", "model": "m.txt", "model_fmt": "txt",
            "vocab_t": "t", "restore": "b", "size_d": 0, "size_a": 10, "vocab_a": "a",
            "use_deprel": false, "threads": 3, "col_ctx_d": 2}"#).unwrap().get_params();
        assert_eq!(params.task, Task::ToksTrain);
        assert_eq!(params.model_fmt, VectorsFormat::Text);
        assert_eq!(params.threads, 3);
        assert_eq!(params.dep_column(), 1);
        assert_eq!(params.vocab_t, Some(PathBuf::from("t")));

        let params = parse(r#"{"train": "c", "model": "m", "vocab_p": "p", "restore": "b",
            "size_d": 0, "size_a": 4, "vocab_a": "a"}"#).unwrap().get_params();
        assert!(params.proper_names());
    }

    #[test]
    fn invalid_combinations_are_rejected() {

        let cases = [
            r#"{"train": "c", "model": "m", "size_d": 0, "size_a": 0, "vocab_m": "v"}"#,
            r#"{"train": "c", "model": "m", "vocab_d": "d", "vocab_a": "a"}"#,
            r#"{"train": "c", "model": "m", "vocab_p": "p", "vocab_d": "d", "vocab_a": "a"}"#,
            r#"{"train": "c", "model": "m", "vocab_m": "v", "vocab_a": "a"}"#,
            r#"{"train": "c", "model": "m", "vocab_m": "v", "vocab_d": "d"}"#,
            r#"{"task": "toks_train", "train": "c", "model": "m", "vocab_d": "d", "vocab_a": "a", "restore": "r"}"#,
            r#"{"task": "toks_train", "train": "c", "model": "m", "vocab_d": "d", "vocab_a": "a", "vocab_t": "t"}"#,
            r#"{"train": "c", "model": "m", "vocab_m": "v", "size_a": 0, "vocab_d": "d", "threads": 0}"#,
            r#"{"train": "c", "model": "m", "vocab_m": "v", "size_a": 0, "vocab_d": "d", "col_ctx_d": 11}"#,
        ];
        for json in cases {
            assert!(matches!(parse(json), Err(DepVecError::Config(_))), "{}", json);
        }

        // malformed or unknown keys fail in deserialization
        assert!(matches!(parse(r#"{"train": "c"}"#), Err(DepVecError::Json(_))));
        assert!(matches!(parse(r#"{"train": "c", "model": "m", "vocab_m": "v", "windows": 5}"#), Err(DepVecError::Json(_))));
        assert!(matches!(parse(r#"{"train": "c", "model": "m", "model_fmt": "npy"}"#), Err(DepVecError::Json(_))));
    }

    #[test]
    fn reads_the_file_named_on_the_command_line() {

        let mut f = NamedTempFile::new().unwrap();
        write!(f, r#"{{"train": "c", "model": "m", "vocab_m": "v", "size_a": 0, "vocab_d": "d"}}"#).unwrap();
        f.flush().unwrap();

        let args = vec!["dep2vec".to_string(), f.path().display().to_string()];
        assert_eq!(Config::new(&args).unwrap().get_params().size_a, 0);
        assert!(Config::new(&args[..1]).is_err());
    }
}
