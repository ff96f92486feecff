//! End-to-end training runs over in-process parameter servers.

mod common;

use std::time::Duration;

use comms::{
    msg::VarId,
    specs::{DataSpec, ExperimentSpec, ModelSpec, TrainerSpec, TrainerType},
};
use ndarray::{Array1, Array2};
use seqml::{BatchDispenser, MemoryDispenser};
use worker::{checkpoint, LocalSession, TrainGraph, Trainer};

fn spec(
    trainer: TrainerType,
    aggregate: usize,
    num_epochs: usize,
    valid_frequency: i64,
    logdir: &std::path::Path,
) -> ExperimentSpec {
    ExperimentSpec {
        cluster: None,
        trainer: TrainerSpec {
            trainer,
            num_epochs,
            numbatches_to_aggregate: aggregate,
            initial_learning_rate: 0.05,
            learning_rate_decay: 0.9,
            valid_frequency,
            beam_width: 2,
        },
        model: ModelSpec {
            encoder: "dnn".to_string(),
            num_labels: 3,
            hidden_units: 4,
            seed: Some(11),
        },
        data: DataSpec {
            input_dim: 2,
            max_input_length: 4,
            max_target_length: 4,
            batch_size: 2,
            train: None,
            valid: None,
        },
        logdir: logdir.display().to_string(),
    }
}

/// Frame-aligned utterances for cross-entropy: targets as long as inputs.
fn aligned_corpus(n: usize) -> Vec<(Array2<f32>, Array1<i32>)> {
    (0..n)
        .map(|i| {
            let input = Array2::from_shape_fn((3, 2), |(t, f)| ((i + t) as f32 - f as f32) * 0.2);
            (input, Array1::from_vec(vec![0, 1, 2]))
        })
        .collect()
}

/// Unaligned utterances for CTC: short label sequences, blank = 2.
fn ctc_corpus(n: usize) -> Vec<(Array2<f32>, Array1<i32>)> {
    (0..n)
        .map(|i| {
            let input = Array2::from_shape_fn((4, 2), |(t, f)| ((i * 2 + t) as f32 + f as f32) * 0.1);
            let targets = if i % 2 == 0 { vec![0, 1] } else { vec![1] };
            (input, Array1::from_vec(targets))
        })
        .collect()
}

#[tokio::test]
async fn cross_entropy_trains_to_completion_and_saves_the_final_model() -> worker::Result<()> {
    let logdir = common::scratch_logdir("ce-e2e");

    // 4 utterances, batch 2, 2 epochs, aggregate 1 -> 4 synchronous steps.
    let spec = spec(TrainerType::CrossEntropy, 1, 2, 2, &logdir);
    let mut dispenser = MemoryDispenser::new(aligned_corpus(4), 2)?;
    // 3 validation utterances: the second validation batch is short.
    let mut val_dispenser = MemoryDispenser::new(aligned_corpus(3), 2)?;

    let graph = TrainGraph::build(&spec, dispenser.num_batches(), 1)?;
    assert_eq!(graph.num_steps, 4);
    let num_params = graph.num_params;

    let (clients, runner_link, barrier) = LocalSession::start(&spec.trainer, true)?.into_parts();
    let mut trainer = Trainer::new(graph, clients, runner_link, 0, logdir.clone())?;

    tokio::time::timeout(
        Duration::from_secs(60),
        trainer.train(
            &mut dispenser,
            Some(&mut val_dispenser as &mut dyn BatchDispenser),
        ),
    )
    .await
    .expect("training stalled")?;

    tokio::time::timeout(Duration::from_secs(5), barrier.finished())
        .await
        .expect("the shutdown barrier did not release");

    let fin = checkpoint::restore(&logdir.join(checkpoint::FINAL_CHECKPOINT))?
        .expect("the chief must save the final model");
    assert_eq!(fin.state.global_step, 4);
    assert_eq!(fin.params.len(), num_params);
    assert!(fin.params.iter().all(|p| p.is_finite()));

    // Validation ran: a periodic checkpoint and summary events exist.
    assert!(logdir.join(checkpoint::CHECKPOINT).exists());
    let events = std::fs::read_to_string(logdir.join("events.jsonl"))?;
    assert!(events.lines().any(|l| l.contains("validation loss")));
    assert!(events.lines().any(|l| l.contains("histogram")));

    let _ = std::fs::remove_dir_all(&logdir);
    Ok(())
}

#[tokio::test]
async fn ctc_trains_without_aggregation_or_validation() -> worker::Result<()> {
    let logdir = common::scratch_logdir("ctc-e2e");

    // Aggregation 0: per-replica apply, no tokens; valid_frequency 0
    // disables validation entirely.
    let spec = spec(TrainerType::Ctc, 0, 1, 0, &logdir);
    let mut dispenser = MemoryDispenser::new(ctc_corpus(4), 2)?;

    let graph = TrainGraph::build(&spec, dispenser.num_batches(), 1)?;
    assert_eq!(graph.num_steps, 2);
    assert!(!graph.synchronous);

    let (clients, runner_link, barrier) = LocalSession::start(&spec.trainer, false)?.into_parts();
    let mut trainer = Trainer::new(graph, clients, runner_link, 0, logdir.clone())?;

    tokio::time::timeout(Duration::from_secs(60), trainer.train(&mut dispenser, None))
        .await
        .expect("training stalled")?;

    tokio::time::timeout(Duration::from_secs(5), barrier.finished())
        .await
        .expect("the shutdown barrier did not release");

    let fin = checkpoint::restore(&logdir.join(checkpoint::FINAL_CHECKPOINT))?
        .expect("the chief must save the final model");
    assert_eq!(fin.state.global_step, 2);

    // No validation: no periodic checkpoint was written.
    assert!(!logdir.join(checkpoint::CHECKPOINT).exists());

    let _ = std::fs::remove_dir_all(&logdir);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_workers_advance_in_lockstep() -> worker::Result<()> {
    const AGGREGATE: usize = 2;

    let chief_logdir = common::scratch_logdir("lockstep-chief");
    let other_logdir = common::scratch_logdir("lockstep-other");

    // 4 utterances, batch 2, 4 epochs, aggregate 2 -> 4 aggregated steps.
    let chief_spec = spec(TrainerType::CrossEntropy, AGGREGATE, 4, 0, &chief_logdir);
    let other_spec = spec(TrainerType::CrossEntropy, AGGREGATE, 4, 0, &other_logdir);

    let (state, waiter) = common::server(2, AGGREGATE);

    let mut tasks = Vec::new();
    for (task_index, spec) in [chief_spec, other_spec].into_iter().enumerate() {
        let clients = vec![common::link(&state)];
        let runner_link = (task_index == 0).then(|| common::link(&state));
        let logdir = std::path::PathBuf::from(&spec.logdir);

        tasks.push(tokio::spawn(async move {
            let mut dispenser = MemoryDispenser::new(aligned_corpus(4), 2)?;
            let graph = TrainGraph::build(&spec, dispenser.num_batches(), 1)?;
            assert_eq!(graph.num_steps, 4);

            let mut trainer = Trainer::new(graph, clients, runner_link, task_index, logdir)?;
            trainer.train(&mut dispenser, None).await
        }));
    }

    for task in tasks {
        tokio::time::timeout(Duration::from_secs(60), task)
            .await
            .expect("a worker stalled")
            .unwrap()?;
    }

    // Both workers enqueued their shutdown tokens.
    tokio::time::timeout(Duration::from_secs(5), waiter.wait())
        .await
        .expect("the shutdown barrier did not release");

    // The aggregate advanced through the whole horizon; a contribution
    // already in flight at the end may add at most one extra step.
    let mut probe = common::link(&state);
    let step = probe.read_int(VarId::GlobalStep).await?;
    assert!((4..=5).contains(&step), "global step ended at {step}");

    assert!(chief_logdir.join(checkpoint::FINAL_CHECKPOINT).exists());

    let _ = std::fs::remove_dir_all(&chief_logdir);
    let _ = std::fs::remove_dir_all(&other_logdir);
    Ok(())
}
