//! The coordinator: session establishment and the step loop.
//!
//! Each worker drives one copy of this loop. The chief (task 0) is
//! additionally responsible for restoring and pushing parameters, seeding
//! the token queue, running the queue runner, validating, writing summaries
//! and checkpoints, and saving the final model. Every exit path ends with
//! one shutdown token enqueued on every parameter server.

use std::{
    path::PathBuf,
    time::{Duration, Instant},
};

use comms::msg::{VarId, VarValue};
use log::{debug, info, warn};
use seqml::{
    loss::LossGrad,
    seq::{pad, pad_labels},
    Batch, BatchDispenser,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    task::JoinHandle,
    time::sleep,
};

use crate::{
    checkpoint,
    client::PsClient,
    error::{Result, TrainerErr},
    graph::TrainGraph,
    summary::SummaryWriter,
};

/// How long a worker sleeps between reader-flag acquisition attempts.
const READER_POLL: Duration = Duration::from_secs(1);

/// The per-worker training driver.
pub struct Trainer<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    graph: TrainGraph,
    /// One connection per parameter server; index 0 is the chief server
    /// hosting the control variables and the token queue.
    clients: Vec<PsClient<R, W>>,
    /// The chief's dedicated queue-runner connection to server 0.
    runner_link: Option<PsClient<R, W>>,
    task_index: usize,
    is_chief: bool,
    logdir: PathBuf,
    summary: Option<SummaryWriter>,
    /// Persistent local copy of the flat parameters, reused across steps.
    params: Vec<f32>,
}

impl<R, W> Trainer<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a new `Trainer`.
    ///
    /// # Arguments
    /// * `graph` - The bound training graph.
    /// * `clients` - One protocol client per parameter server, in task
    ///   order.
    /// * `runner_link` - A dedicated connection to server 0 for the queue
    ///   runner; required on the chief in synchronous mode.
    /// * `task_index` - This worker's position in the cluster's worker
    ///   list.
    /// * `logdir` - Where checkpoints and summaries are written.
    pub fn new(
        graph: TrainGraph,
        clients: Vec<PsClient<R, W>>,
        runner_link: Option<PsClient<R, W>>,
        task_index: usize,
        logdir: PathBuf,
    ) -> Result<Self> {
        if clients.len() != graph.shards.len() {
            return Err(TrainerErr::Config(format!(
                "{} server connections for {} shards",
                clients.len(),
                graph.shards.len()
            )));
        }

        let is_chief = task_index == 0;
        let summary = if is_chief {
            Some(SummaryWriter::create(&logdir)?)
        } else {
            None
        };

        let params = vec![0.0; graph.num_params];

        Ok(Self {
            graph,
            clients,
            runner_link,
            task_index,
            is_chief,
            logdir,
            summary,
            params,
        })
    }

    /// Trains the model to completion.
    ///
    /// The shutdown protocol runs on every exit path: a global stop request
    /// followed by one done token per parameter server.
    pub async fn train(
        &mut self,
        dispenser: &mut dyn BatchDispenser,
        val_dispenser: Option<&mut dyn BatchDispenser>,
    ) -> Result<()> {
        let runner = self.start_session().await?;
        let result = self.run(dispenser, val_dispenser).await;

        self.shutdown(runner).await;
        result
    }

    /// Session establishment: chief restore/init and queue-runner start.
    async fn start_session(&mut self) -> Result<Option<JoinHandle<Result<()>>>> {
        for client in &mut self.clients {
            client.attach(self.task_index).await?;
        }

        if !self.is_chief {
            // Non-chief local init: nothing to install; the first weight
            // pull blocks until the chief has initialized the shards.
            return Ok(None);
        }

        for client in &mut self.clients {
            client.configure(self.graph.num_steps).await?;
        }

        match checkpoint::restore(&self.logdir.join(checkpoint::CHECKPOINT))? {
            Some(restored) => {
                if restored.params.len() != self.graph.num_params {
                    return Err(TrainerErr::Checkpoint(format!(
                        "checkpoint holds {} parameters, the model has {}",
                        restored.params.len(),
                        self.graph.num_params
                    )));
                }

                info!(
                    "restoring the session from step {}, position {}",
                    restored.state.global_step, restored.state.position
                );

                for client in &mut self.clients {
                    client.restore_state(restored.state).await?;
                }
                self.params = restored.params;
            }
            None => self.params = self.graph.classifier.params(),
        }

        for (client, shard) in self.clients.iter_mut().zip(&self.graph.shards) {
            client.set_weights(&self.params[shard.clone()]).await?;
        }

        if !self.graph.synchronous {
            return Ok(None);
        }

        let Some(mut link) = self.runner_link.take() else {
            return Err(TrainerErr::Config(
                "the chief needs a queue-runner connection in synchronous mode".to_string(),
            ));
        };

        // The subscription must be registered before any token exists:
        // otherwise the first applied-step event could slip past the queue
        // runner and the token queue would never refill.
        link.subscribe_applied().await?;
        self.clients[0].init_tokens().await?;

        Ok(Some(spawn_queue_runner(link)))
    }

    /// The main step loop.
    async fn run(
        &mut self,
        dispenser: &mut dyn BatchDispenser,
        mut val_dispenser: Option<&mut dyn BatchDispenser>,
    ) -> Result<()> {
        // Another worker may have crashed while holding the reader flag.
        self.clients[0].release_reader().await?;

        loop {
            let (step, validated_step, should_terminate) = self.clients[0].loop_state().await?;

            if should_terminate {
                info!(task_index = self.task_index; "stop requested, leaving the step loop");
                break;
            }
            if step >= self.graph.num_steps {
                break;
            }

            if let Some(val) = val_dispenser.as_deref_mut() {
                if self.is_chief
                    && self.graph.valid_frequency > 0
                    && step - validated_step >= self.graph.valid_frequency
                {
                    self.validate(val, step).await?;
                }
            }

            let start = Instant::now();
            let batch = self.read_batch(dispenser).await?;
            let (loss, learning_rate) = self.update(&batch).await?;

            let step = self.clients[0].read_int(VarId::GlobalStep).await?;
            info!(
                "step {}/{} loss: {:.6}, learning rate: {:.6}, time elapsed: {:.3} sec",
                step,
                self.graph.num_steps,
                loss,
                learning_rate,
                start.elapsed().as_secs_f32()
            );
        }

        if self.is_chief {
            self.save_final().await?;
        }

        Ok(())
    }

    /// The reader-exclusion protocol around one dispenser read.
    ///
    /// The shared flag makes the shared cursor the single source of truth:
    /// a worker acquires the flag (compare-and-set, polling with one-second
    /// sleeps), seeds the dispenser from the shared cursor, reads one
    /// batch, publishes the advanced cursor and releases the flag, so two
    /// workers never pull the same batch.
    async fn read_batch(&mut self, dispenser: &mut dyn BatchDispenser) -> Result<Batch> {
        while !self.clients[0].acquire_reader().await? {
            sleep(READER_POLL).await;
        }

        let position = self.clients[0].read_int(VarId::Position).await?;
        dispenser.set_pos(position.max(0) as usize);

        let batch = dispenser.get_batch()?;

        self.clients[0]
            .write_var(VarId::Position, VarValue::Int(dispenser.pos() as i64))
            .await?;
        self.clients[0].release_reader().await?;

        Ok(batch)
    }

    /// One model update: pull, forward, loss, backward, clip, push.
    async fn update(&mut self, batch: &Batch) -> Result<(f32, f32)> {
        let Self {
            graph,
            clients,
            params,
            ..
        } = self;

        if graph.synchronous {
            clients[0].acquire_token().await?;
        }

        for (client, shard) in clients.iter_mut().zip(&graph.shards) {
            client.pull_weights_into(&mut params[shard.clone()]).await?;
        }
        graph.classifier.set_params(params)?;

        let input_seq_length = batch.input_seq_length();
        let target_seq_length = batch.target_seq_length();
        let inputs = pad(&batch.inputs, graph.max_input_length)?;
        let targets = pad_labels(&batch.targets, graph.max_target_length)?;

        let logits = graph
            .classifier
            .forward(inputs.view(), &input_seq_length, true)?;
        let LossGrad { loss, d_logits } =
            graph
                .strategy
                .compute_loss(targets.view(), &logits, &target_seq_length)?;
        let mut grads = graph
            .classifier
            .backward(inputs.view(), &input_seq_length, d_logits.view())?;

        for g in &mut grads {
            *g = g.clamp(-1.0, 1.0);
        }

        let mut learning_rate = 0.0;
        for (index, (client, shard)) in clients.iter_mut().zip(&graph.shards).enumerate() {
            let lr = client.push_gradient(&grads[shard.clone()]).await?;
            if index == 0 {
                learning_rate = lr;
            }
        }

        Ok((loss, learning_rate))
    }

    /// One validation pass over the whole validation set, followed by the
    /// learning-rate regression check.
    async fn validate(&mut self, val: &mut dyn BatchDispenser, step: i64) -> Result<()> {
        self.clients[0].mark_validated().await?;

        let Self {
            graph,
            clients,
            params,
            ..
        } = self;

        // Score against the current aggregate parameters.
        for (client, shard) in clients.iter_mut().zip(&graph.shards) {
            client.pull_weights_into(&mut params[shard.clone()]).await?;
        }
        graph.classifier.set_params(params)?;

        val.set_pos(0);
        let passes = val.num_batches().ceil() as usize;
        let mut errors = Vec::new();

        for _ in 0..passes {
            let batch = val.get_batch_stop_at_end()?;
            if batch.is_empty() {
                break;
            }

            let input_seq_length = batch.input_seq_length();
            let inputs = pad(&batch.inputs, graph.max_input_length)?;
            let logits = graph
                .classifier
                .forward(inputs.view(), &input_seq_length, false)?;

            // The final batch may be short; the metric scores exactly the
            // batch's true utterances.
            let outputs = graph.strategy.validation_output(&logits)?;
            errors.extend(graph.strategy.validation_metric(&outputs, &batch.targets)?);
        }

        let validation_loss = errors.iter().sum::<f32>() / errors.len().max(1) as f32;
        info!("validation loss: {validation_loss:.6}");

        let stored = clients[0].read_float(VarId::ValidationLoss).await?;
        if validation_loss > stored {
            info!("halving learning rate");
            for client in clients.iter_mut() {
                client.halve_learning_rate_fact().await?;
            }
        }

        clients[0]
            .write_var(VarId::ValidationLoss, VarValue::Float(validation_loss))
            .await?;

        let learning_rate = clients[0].read_float(VarId::LearningRate).await?;
        if let Some(summary) = self.summary.as_mut() {
            summary.scalar(step, "validation loss", validation_loss)?;
            summary.scalar(step, "learning rate", learning_rate)?;

            let mut offset = 0;
            for block in &graph.layout {
                summary.histogram(step, &block.name, &params[offset..offset + block.len])?;
                offset += block.len;
            }
        }

        let snapshot = clients[0].snapshot_state().await?;
        checkpoint::save(&self.logdir.join(checkpoint::CHECKPOINT), params, &snapshot)?;

        Ok(())
    }

    /// The chief's final save after a normal loop exit.
    async fn save_final(&mut self) -> Result<()> {
        let Self {
            graph,
            clients,
            params,
            ..
        } = self;

        for (client, shard) in clients.iter_mut().zip(&graph.shards) {
            client.pull_weights_into(&mut params[shard.clone()]).await?;
        }

        let snapshot = clients[0].snapshot_state().await?;
        let path = self.logdir.join(checkpoint::FINAL_CHECKPOINT);
        checkpoint::save(&path, params, &snapshot)?;

        info!("saved the final model to {}", path.display());
        Ok(())
    }

    /// The session exit hook, run on every exit path: request a global
    /// stop, enqueue one done token per parameter server, stop the queue
    /// runner.
    async fn shutdown(&mut self, runner: Option<JoinHandle<Result<()>>>) {
        if let Err(e) = self.clients[0].terminate().await {
            warn!("failed to request a global stop: {e}");
        }

        for (task, client) in self.clients.iter_mut().enumerate() {
            if let Err(e) = client.done().await {
                warn!("failed to enqueue the shutdown token on server {task}: {e}");
            }
        }

        if let Some(runner) = runner {
            runner.abort();
            let _ = runner.await;
        }
    }
}

/// The chief queue runner: turns every applied-step event from server 0
/// into a token refill for the next synchronous step.
fn spawn_queue_runner<R, W>(mut link: PsClient<R, W>) -> JoinHandle<Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(global_step) = link.next_applied().await? {
            debug!(global_step = global_step; "refilling the token queue");
            link.refill_tokens().await?;
        }

        Ok(())
    })
}
