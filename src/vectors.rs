// imports
use crate::errors::{DepVecError, Result};

use ndarray::{Array2, ArrayView1, Axis};
use rand::Rng;
use serde::Deserialize;
use std::fmt::Display;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;


/// On-disk encoding of the rows of a vectors model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum VectorsFormat {
    /// `word` + one space + `dim` little-endian f32 + `\n`
    #[default]
    #[serde(rename = "bin")]
    Binary,
    /// `word` + ` %f` for every dimension + `\n`
    #[serde(rename = "txt")]
    Text,
}

impl Display for VectorsFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VectorsFormat::Binary => write!(f, "bin"),
            VectorsFormat::Text => write!(f, "txt"),
        }
    }
}

/// A word-indexed matrix of vectors, rows follow the order of `vocab`.
#[derive(Clone, Debug)]
pub struct VectorsModel {
    pub vocab: Vec<String>,
    pub embeddings: Array2<f32>,
}

impl VectorsModel {

    pub fn new(vocab: Vec<String>, embeddings: Array2<f32>) -> Result<Self> {
        if vocab.len() != embeddings.dim().0 {
            return Err(DepVecError::DimensionMismatch { expected: vocab.len(), found: embeddings.dim().0 });
        }
        Ok(Self { vocab, embeddings })
    }

    pub fn words_count(&self) -> usize {
        self.vocab.len()
    }

    pub fn emb_size(&self) -> usize {
        self.embeddings.dim().1
    }

    pub fn row(&self, idx: usize) -> ArrayView1<f32> {
        self.embeddings.row(idx)
    }

    /// Loads a whole model into memory. With `normalize` every row is scaled to unit length,
    /// a zero row fails the whole load.
    pub fn load<P: AsRef<Path>>(path: P, format: VectorsFormat, normalize: bool) -> Result<Self> {

        let path = path.as_ref();
        let mut reader = BufReader::new(File::open(path)?);

        // header: "<words_count> <emb_size>"
        let mut header = String::new();
        reader.read_line(&mut header)?;
        let sizes = header
            .split_whitespace()
            .map(|x| x.parse::<usize>())
            .collect::<std::result::Result<Vec<usize>, _>>()
            .map_err(|_| DepVecError::format(path, 1, "bad header"))?;
        let (words_count, emb_size) = match sizes.as_slice() {
            [w, e] => (*w, *e),
            _ => return Err(DepVecError::format(path, 1, "header should be '<words> <dim>'")),
        };

        // the header is untrusted, sizes are checked before anything is allocated
        let too_large = || DepVecError::Allocation(format!("{} words x {} dims", words_count, emb_size));
        let cells = words_count.checked_mul(emb_size).ok_or_else(too_large)?;
        let record_bytes = emb_size.checked_mul(4).ok_or_else(too_large)?;

        let mut data: Vec<f32> = Vec::new();
        data.try_reserve_exact(cells).map_err(|_| too_large())?;
        let mut vocab: Vec<String> = Vec::new();
        vocab.try_reserve_exact(words_count).map_err(|_| too_large())?;
        let mut raw: Vec<u8> = Vec::new();
        if format == VectorsFormat::Binary {
            raw.try_reserve_exact(record_bytes).map_err(|_| too_large())?;
            raw.resize(record_bytes, 0);
        }
        let mut buf: Vec<u8> = Vec::new();

        for w in 0..words_count {

            let line_no = w + 2;

            // the word runs until the first space
            buf.clear();
            reader.read_until(b' ', &mut buf)?;
            if buf.last() != Some(&b' ') {
                return Err(DepVecError::format(path, line_no, format!("expected {} records, file ends at {}", words_count, w)));
            }
            buf.pop();
            let word = String::from_utf8(buf.clone())
                .map_err(|_| DepVecError::format(path, line_no, "word is not utf-8"))?;
            let word = word.trim_start_matches(['\n', '\r']).to_owned();

            match format {
                VectorsFormat::Binary => {
                    reader.read_exact(&mut raw)?;
                    data.extend(raw.chunks_exact(4).map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]])));
                    // rest of the record is the line terminator
                    buf.clear();
                    reader.read_until(b'\n', &mut buf)?;
                },
                VectorsFormat::Text => {
                    buf.clear();
                    reader.read_until(b'\n', &mut buf)?;
                    let line = String::from_utf8_lossy(&buf);
                    let before = data.len();
                    for field in line.split_whitespace() {
                        let value: f32 = field
                            .parse()
                            .map_err(|_| DepVecError::format(path, line_no, format!("bad float '{}'", field)))?;
                        data.push(value);
                    }
                    if data.len() - before != emb_size {
                        return Err(DepVecError::format(
                            path, line_no, format!("expected {} values, found {}", emb_size, data.len() - before)));
                    }
                },
            }

            vocab.push(word);
        }

        let embeddings = Array2::from_shape_vec((words_count, emb_size), data)
            .map_err(|e| DepVecError::format(path, 1, e.to_string()))?;
        let mut model = Self { vocab, embeddings };

        if normalize {
            model.normalize()?;
        }
        Ok(model)
    }

    /// Scales every row to unit L2 norm.
    pub fn normalize(&mut self) -> Result<()> {

        // check first, the model is left untouched on failure
        let norms: Vec<f32> = self.embeddings
            .axis_iter(Axis(0))
            .map(|row| row.dot(&row).sqrt())
            .collect();
        if let Some(idx) = norms.iter().position(|n| *n == 0.0) {
            return Err(DepVecError::DivisionByZero { word: self.vocab[idx].clone() });
        }

        for (mut row, norm) in self.embeddings.axis_iter_mut(Axis(0)).zip(norms) {
            row.mapv_inplace(|a| a / norm);
        }
        Ok(())
    }

    pub fn save<P: AsRef<Path>>(&self, path: P, format: VectorsFormat) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{} {}", self.words_count(), self.emb_size())?;
        for (word, row) in self.vocab.iter().zip(self.embeddings.axis_iter(Axis(0))) {
            match row.as_slice() {
                Some(slice) => VectorsModel::write_embedding(&mut out, format, word, slice)?,
                None => VectorsModel::write_embedding(&mut out, format, word, &row.to_vec())?,
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Linear scan, only used off the training hot path.
    pub fn get_word_idx(&self, word: &str) -> Option<usize> {
        self.vocab.iter().position(|w| w == word)
    }

    /// Fills `new_embedding` with a copy of `base_embedding` where every component is moved
    /// by `distance_factor` percent of its own magnitude, in a random direction.
    pub fn make_embedding_as_neighbour<R: Rng>(rng: &mut R, base_embedding: &[f32], new_embedding: &mut [f32], distance_factor: f32) -> Result<()> {
        if base_embedding.len() != new_embedding.len() {
            return Err(DepVecError::DimensionMismatch { expected: base_embedding.len(), found: new_embedding.len() });
        }
        for (new, base) in new_embedding.iter_mut().zip(base_embedding) {
            let sign = if rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            *new = *base + sign * (*base / 100.0 * distance_factor);
        }
        Ok(())
    }

    pub fn write_embedding<W: Write>(out: &mut W, format: VectorsFormat, word: &str, embedding: &[f32]) -> Result<()> {
        VectorsModel::write_embedding_slice(out, format, word, embedding, 0, embedding.len())
    }

    /// Writes one record made of the `[begin, end)` dimensions of `embedding`.
    pub fn write_embedding_slice<W: Write>(out: &mut W, format: VectorsFormat, word: &str, embedding: &[f32], begin: usize, end: usize) -> Result<()> {
        let values = embedding
            .get(begin..end)
            .ok_or(DepVecError::DimensionMismatch { expected: end.max(begin), found: embedding.len() })?;
        out.write_all(word.as_bytes())?;
        match format {
            VectorsFormat::Binary => {
                out.write_all(b" ")?;
                for value in values {
                    out.write_all(&value.to_le_bytes())?;
                }
            },
            VectorsFormat::Text => {
                for value in values {
                    write!(out, " {:.6}", value)?;
                }
            },
        }
        out.write_all(b"\n")?;
        Ok(())
    }

}
