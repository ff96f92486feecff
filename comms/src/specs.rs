//! Serde specifications shared between the training nodes.
//!
//! Every process in an experiment loads the same JSON file; the derived
//! quantities (shard layout, step horizon) are computed identically on each
//! node from these shared values.

use std::ops::Range;

use serde::{Deserialize, Serialize};

/// The cluster layout: ordered worker and parameter-server endpoints.
///
/// A node's task index is its position in its job's list. Absent in
/// single-process runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterSpec {
    pub worker: Vec<String>,
    pub ps: Vec<String>,
}

impl ClusterSpec {
    /// The number of worker replicas.
    pub fn num_replicas(&self) -> usize {
        self.worker.len()
    }

    /// The number of parameter servers.
    pub fn num_servers(&self) -> usize {
        self.ps.len()
    }
}

/// The trainer type, selecting the loss/decoding strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainerType {
    CrossEntropy,
    Ctc,
}

/// Training options recognized by the driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerSpec {
    pub trainer: TrainerType,
    pub num_epochs: usize,
    /// 0 selects non-synchronous single-replica application.
    pub numbatches_to_aggregate: usize,
    pub initial_learning_rate: f32,
    pub learning_rate_decay: f32,
    /// 0 disables validation.
    pub valid_frequency: i64,
    /// CTC decoding beam width.
    #[serde(default = "default_beam_width")]
    pub beam_width: usize,
}

fn default_beam_width() -> usize {
    1
}

/// The model surface the driver needs: the encoder factory kind and the
/// output dimensionality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub encoder: String,
    pub num_labels: usize,
    #[serde(default = "default_hidden_units")]
    pub hidden_units: usize,
    /// Weight initialization seed.
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_hidden_units() -> usize {
    128
}

/// Dataset dimensions and file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataSpec {
    pub input_dim: usize,
    pub max_input_length: usize,
    pub max_target_length: usize,
    pub batch_size: usize,
    /// Training utterances, JSON; see `seqml::dispenser`.
    #[serde(default)]
    pub train: Option<String>,
    /// Validation utterances, JSON.
    #[serde(default)]
    pub valid: Option<String>,
}

/// The complete experiment specification loaded by every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentSpec {
    #[serde(default)]
    pub cluster: Option<ClusterSpec>,
    pub trainer: TrainerSpec,
    pub model: ModelSpec,
    pub data: DataSpec,
    pub logdir: String,
}

/// The contiguous chunk of a flat parameter vector hosted by server `task`.
///
/// The first `num_params % num_servers` shards carry one extra element, so
/// the ranges tile the vector exactly.
///
/// # Arguments
/// * `num_params` - The total flat parameter count.
/// * `num_servers` - The number of parameter servers.
/// * `task` - The server task index.
///
/// # Returns
/// The half-open index range of the shard.
pub fn shard_range(num_params: usize, num_servers: usize, task: usize) -> Range<usize> {
    debug_assert!(task < num_servers);

    let base = num_params / num_servers;
    let extra = num_params % num_servers;

    let start = task * base + task.min(extra);
    let len = base + usize::from(task < extra);

    start..start + len
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_ranges_tile_the_vector() {
        for (params, servers) in [(10, 3), (15, 4), (7, 7), (3, 5), (100, 1)] {
            let mut covered = 0;
            for task in 0..servers {
                let range = shard_range(params, servers, task);
                assert_eq!(range.start, covered);
                covered = range.end;
            }
            assert_eq!(covered, params);
        }
    }

    #[test]
    fn shard_sizes_differ_by_at_most_one() {
        let sizes: Vec<usize> = (0..4).map(|t| shard_range(10, 4, t).len()).collect();
        assert_eq!(sizes, [3, 3, 2, 2]);
    }
}
