//! Checkpoint restart: the restored session continues where the crashed
//! one left off.

mod common;

use std::time::Duration;

use comms::{
    msg::{ControlSnapshot, VarId},
    specs::{DataSpec, ExperimentSpec, ModelSpec, TrainerSpec, TrainerType},
};
use ndarray::{Array1, Array2};
use seqml::BatchDispenser;
use worker::{checkpoint, LocalSession, TrainGraph, Trainer};

#[tokio::test]
async fn a_restored_session_sees_the_saved_step_and_position() -> worker::Result<()> {
    let (state, _waiter) = common::server(1, 0);
    let mut client = common::link(&state);

    client.configure(100).await?;
    client
        .restore_state(ControlSnapshot {
            global_step: 7,
            position: 16,
            validated_step: 5,
            validation_loss: 1.25,
            learning_rate_fact: 0.5,
        })
        .await?;
    client.set_weights(&[0.5, -0.5]).await?;

    let (step, validated_step, should_terminate) = client.loop_state().await?;
    assert_eq!(step, 7);
    assert_eq!(validated_step, 5);
    assert!(!should_terminate);

    // The next read starts at the saved cursor.
    assert_eq!(client.read_int(VarId::Position).await?, 16);
    assert_eq!(client.read_float(VarId::LearningRateFact).await?, 0.5);

    let mut weights = [0.0; 2];
    client.pull_weights_into(&mut weights).await?;
    assert_eq!(weights, [0.5, -0.5]);

    Ok(())
}

fn corpus(n: usize) -> Vec<(Array2<f32>, Array1<i32>)> {
    (0..n)
        .map(|i| {
            let input = Array2::from_shape_fn((3, 2), |(t, f)| (i + t + f) as f32 * 0.1);
            let targets = Array1::from_vec(vec![0, 1, 2]);
            (input, targets)
        })
        .collect()
}

fn spec(logdir: &std::path::Path) -> ExperimentSpec {
    ExperimentSpec {
        cluster: None,
        trainer: TrainerSpec {
            trainer: TrainerType::CrossEntropy,
            num_epochs: 1,
            numbatches_to_aggregate: 0,
            initial_learning_rate: 0.05,
            learning_rate_decay: 0.9,
            valid_frequency: 1,
            beam_width: 1,
        },
        model: ModelSpec {
            encoder: "dnn".to_string(),
            num_labels: 3,
            hidden_units: 4,
            seed: Some(3),
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

async fn run_session(spec: &ExperimentSpec) -> worker::Result<()> {
    let mut dispenser = seqml::MemoryDispenser::new(corpus(8), 2)?;
    let mut val_dispenser = seqml::MemoryDispenser::new(corpus(2), 2)?;

    let graph = TrainGraph::build(spec, dispenser.num_batches(), 1)?;
    let (clients, runner_link, barrier) = LocalSession::start(&spec.trainer, false)?.into_parts();

    let mut trainer = Trainer::new(graph, clients, runner_link, 0, spec.logdir.clone().into())?;
    trainer
        .train(&mut dispenser, Some(&mut val_dispenser as &mut dyn BatchDispenser))
        .await?;

    tokio::time::timeout(Duration::from_secs(5), barrier.finished())
        .await
        .expect("the local shutdown barrier did not release");
    Ok(())
}

#[tokio::test]
async fn training_resumes_from_the_periodic_checkpoint() -> worker::Result<()> {
    let logdir = common::scratch_logdir("resume");
    let spec = spec(&logdir);

    // First session: 8 utterances, batch 2, one epoch -> 4 steps, one
    // validation (and one periodic checkpoint) before every step.
    tokio::time::timeout(Duration::from_secs(60), run_session(&spec))
        .await
        .expect("the first session stalled")?;

    let periodic = checkpoint::restore(&logdir.join(checkpoint::CHECKPOINT))?
        .expect("validation must have written a periodic checkpoint");
    assert_eq!(periodic.state.global_step, 3);
    assert_eq!(periodic.state.position, 6);

    // Second session, same log directory: restores step 3 at position 6
    // and finishes the single remaining step.
    tokio::time::timeout(Duration::from_secs(60), run_session(&spec))
        .await
        .expect("the restored session stalled")?;

    let fin = checkpoint::restore(&logdir.join(checkpoint::FINAL_CHECKPOINT))?
        .expect("the chief must save the final model");
    assert_eq!(fin.state.global_step, 4);
    assert_eq!(fin.state.position, 0);

    let _ = std::fs::remove_dir_all(&logdir);
    Ok(())
}
