pub mod errors;
pub mod config;
pub mod vocabulary;
pub mod vectors;
pub mod conll;
pub mod phrases;
pub mod random;
pub mod matrix;
pub mod noise;
pub mod provider;
pub mod train;
pub mod pipeline;

pub use config::{Config, Params, Task};
pub use errors::{DepVecError, Result};
pub use phrases::PhraseMatcher;
pub use pipeline::Pipeline;
pub use provider::{ExtractionParams, LearningExample, LearningExampleProvider};
pub use train::{TrainParams, Trainer};
pub use vectors::{VectorsFormat, VectorsModel};
pub use vocabulary::{Vocabulary, VocabularyEntry};
