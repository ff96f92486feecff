//! The training-graph builder.
//!
//! The analog of graph construction: everything static about a run is
//! resolved and validated here once, before any session traffic: the
//! classifier from the encoder factory, the loss/decoding strategy, the
//! step horizon, and the shard layout across the parameter servers.
//! Configuration errors fail fast at startup.

use std::ops::Range;

use comms::specs::{shard_range, ExperimentSpec, TrainerType};
use seqml::{
    encoder_factory,
    loss::{CrossEntropy, Ctc, LossStrategy},
    Classifier, ParamBlock,
};

use crate::error::{Result, TrainerErr};

/// The bound, validated static state of a training run.
pub struct TrainGraph {
    pub classifier: Box<dyn Classifier>,
    pub strategy: Box<dyn LossStrategy>,
    /// Named blocks tiling the flat parameter vector.
    pub layout: Vec<ParamBlock>,
    /// One contiguous chunk per parameter server, tiling the vector.
    pub shards: Vec<Range<usize>>,
    pub num_params: usize,
    pub num_steps: i64,
    pub batch_size: usize,
    pub max_input_length: usize,
    pub max_target_length: usize,
    pub valid_frequency: i64,
    /// Whether contributions are token-gated (K > 0).
    pub synchronous: bool,
}

impl TrainGraph {
    /// Builds and validates the graph.
    ///
    /// # Arguments
    /// * `spec` - The shared experiment specification.
    /// * `num_batches` - The training dispenser's batches per epoch; may be
    ///   fractional.
    /// * `num_servers` - The number of parameter servers (1 in local mode).
    ///
    /// # Errors
    /// `TrainerErr::Config` for any invalid option, including an unknown
    /// encoder kind.
    pub fn build(spec: &ExperimentSpec, num_batches: f32, num_servers: usize) -> Result<Self> {
        let trainer = &spec.trainer;

        if spec.data.batch_size == 0 {
            return Err(config("batch_size must be at least 1"));
        }
        if spec.data.input_dim == 0 {
            return Err(config("input_dim must be at least 1"));
        }
        if spec.data.max_input_length == 0 || spec.data.max_target_length == 0 {
            return Err(config("the maximum sequence lengths must be at least 1"));
        }
        if spec.model.num_labels == 0 {
            return Err(config("num_labels must be at least 1"));
        }
        if trainer.num_epochs == 0 {
            return Err(config("num_epochs must be at least 1"));
        }
        if trainer.initial_learning_rate <= 0.0 {
            return Err(config("initial_learning_rate must be positive"));
        }
        if trainer.learning_rate_decay <= 0.0 || trainer.learning_rate_decay > 1.0 {
            return Err(config("learning_rate_decay must be in (0, 1]"));
        }
        if trainer.valid_frequency < 0 {
            return Err(config("valid_frequency cannot be negative"));
        }
        if num_servers == 0 {
            return Err(config("the cluster needs at least one parameter server"));
        }
        if num_batches <= 0.0 {
            return Err(config("the training corpus is empty"));
        }

        let classifier = encoder_factory(
            &spec.model.encoder,
            spec.data.input_dim,
            spec.model.hidden_units,
            spec.model.num_labels,
            spec.model.seed.unwrap_or_default(),
        )
        .map_err(|e| config(&e.to_string()))?;

        let strategy: Box<dyn LossStrategy> = match trainer.trainer {
            TrainerType::CrossEntropy => Box::new(CrossEntropy),
            TrainerType::Ctc => {
                Box::new(Ctc::new(trainer.beam_width).map_err(|e| config(&e.to_string()))?)
            }
        };

        let aggregate = trainer.numbatches_to_aggregate.max(1) as f32;
        let num_steps = (num_batches * trainer.num_epochs as f32 / aggregate).ceil() as i64;

        let num_params = classifier.num_params();
        let shards = (0..num_servers)
            .map(|task| shard_range(num_params, num_servers, task))
            .collect();

        Ok(Self {
            layout: classifier.param_layout(),
            num_params,
            classifier,
            strategy,
            shards,
            num_steps,
            batch_size: spec.data.batch_size,
            max_input_length: spec.data.max_input_length,
            max_target_length: spec.data.max_target_length,
            valid_frequency: trainer.valid_frequency,
            synchronous: trainer.numbatches_to_aggregate > 0,
        })
    }
}

fn config(msg: &str) -> TrainerErr {
    TrainerErr::Config(msg.to_string())
}

#[cfg(test)]
mod tests {
    use comms::specs::{DataSpec, ModelSpec, TrainerSpec};

    use super::*;

    fn spec() -> ExperimentSpec {
        ExperimentSpec {
            cluster: None,
            trainer: TrainerSpec {
                trainer: TrainerType::CrossEntropy,
                num_epochs: 2,
                numbatches_to_aggregate: 4,
                initial_learning_rate: 0.1,
                learning_rate_decay: 0.9,
                valid_frequency: 5,
                beam_width: 1,
            },
            model: ModelSpec {
                encoder: "dnn".to_string(),
                num_labels: 3,
                hidden_units: 8,
                seed: Some(7),
            },
            data: DataSpec {
                input_dim: 4,
                max_input_length: 10,
                max_target_length: 10,
                batch_size: 2,
                train: None,
                valid: None,
            },
            logdir: "logs".to_string(),
        }
    }

    #[test]
    fn the_step_horizon_rounds_up() {
        // ceil(10.5 batches * 2 epochs / 4 aggregated) = ceil(5.25) = 6
        let graph = TrainGraph::build(&spec(), 10.5, 2).unwrap();
        assert_eq!(graph.num_steps, 6);
        assert!(graph.synchronous);
    }

    #[test]
    fn zero_aggregation_selects_per_replica_apply() {
        let mut spec = spec();
        spec.trainer.numbatches_to_aggregate = 0;

        let graph = TrainGraph::build(&spec, 10.0, 1).unwrap();
        assert!(!graph.synchronous);
        assert_eq!(graph.num_steps, 20);
    }

    #[test]
    fn shards_tile_the_parameter_vector() {
        let graph = TrainGraph::build(&spec(), 4.0, 3).unwrap();

        let mut covered = 0;
        for shard in &graph.shards {
            assert_eq!(shard.start, covered);
            covered = shard.end;
        }
        assert_eq!(covered, graph.num_params);
    }

    #[test]
    fn unknown_encoder_kinds_fail_fast() {
        let mut spec = spec();
        spec.model.encoder = "listener".to_string();

        assert!(matches!(
            TrainGraph::build(&spec, 4.0, 1),
            Err(TrainerErr::Config(_))
        ));
    }

    #[test]
    fn invalid_options_fail_fast() {
        let mut bad = spec();
        bad.trainer.learning_rate_decay = 1.5;
        assert!(TrainGraph::build(&bad, 4.0, 1).is_err());

        let mut bad = spec();
        bad.trainer.num_epochs = 0;
        assert!(TrainGraph::build(&bad, 4.0, 1).is_err());

        let mut bad = spec();
        bad.data.batch_size = 0;
        assert!(TrainGraph::build(&bad, 4.0, 1).is_err());
    }
}
