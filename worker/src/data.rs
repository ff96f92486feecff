//! Corpus loading for the in-memory dispenser.
//!
//! The feature pipeline proper is out of scope; small corpora are read from
//! a JSON file of utterances, each a time-major feature matrix with its
//! label vector.

use std::{fs, path::Path};

use ndarray::{Array1, Array2};
use seqml::MemoryDispenser;

use crate::error::{Result, TrainerErr};

#[derive(Debug, serde::Deserialize)]
struct Utterance {
    input: Vec<Vec<f32>>,
    targets: Vec<i32>,
}

/// Loads a corpus file into (features, labels) pairs.
pub fn load_corpus(path: &Path) -> Result<Vec<(Array2<f32>, Array1<i32>)>> {
    let raw = fs::read_to_string(path)?;
    let utterances: Vec<Utterance> =
        serde_json::from_str(&raw).map_err(|e| TrainerErr::Config(e.to_string()))?;

    let mut corpus = Vec::with_capacity(utterances.len());
    for (index, utterance) in utterances.into_iter().enumerate() {
        let rows = utterance.input.len();
        let dim = utterance.input.first().map(Vec::len).unwrap_or_default();

        let mut flat = Vec::with_capacity(rows * dim);
        for row in &utterance.input {
            if row.len() != dim {
                return Err(TrainerErr::Config(format!(
                    "utterance {index} has ragged feature rows"
                )));
            }
            flat.extend_from_slice(row);
        }

        let input = Array2::from_shape_vec((rows, dim), flat)
            .map_err(|e| TrainerErr::Config(e.to_string()))?;

        corpus.push((input, Array1::from_vec(utterance.targets)));
    }

    Ok(corpus)
}

/// Loads a corpus file straight into a dispenser.
pub fn load_dispenser(path: &Path, batch_size: usize) -> Result<MemoryDispenser> {
    let corpus = load_corpus(path)?;
    MemoryDispenser::new(corpus, batch_size).map_err(TrainerErr::Ml)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corpora_load_from_json() {
        let path = std::env::temp_dir().join(format!("trainer-corpus-{}", std::process::id()));
        fs::write(
            &path,
            r#"[
                {"input": [[1.0, 2.0], [3.0, 4.0]], "targets": [0, 1]},
                {"input": [[5.0, 6.0]], "targets": [1]}
            ]"#,
        )
        .unwrap();

        let corpus = load_corpus(&path).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus[0].0.shape(), [2, 2]);
        assert_eq!(corpus[1].1.to_vec(), vec![1]);

        let dispenser = load_dispenser(&path, 2).unwrap();
        assert_eq!(seqml::BatchDispenser::num_batches(&dispenser), 1.0);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let path = std::env::temp_dir().join(format!("trainer-ragged-{}", std::process::id()));
        fs::write(&path, r#"[{"input": [[1.0, 2.0], [3.0]], "targets": [0]}]"#).unwrap();

        assert!(load_corpus(&path).is_err());
        let _ = fs::remove_file(&path);
    }
}
