//! The typed protocol client for one parameter-server connection.

use comms::{
    msg::{Command, ControlSnapshot, Msg, Payload, Reply, VarId, VarValue},
    WireReceiver, WireSender,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{Result, TrainerErr};

/// One worker-side connection to a parameter server, with a typed call per
/// protocol operation.
pub struct PsClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    rx: WireReceiver<R>,
    tx: WireSender<W>,
}

impl<R, W> PsClient<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a new `PsClient` over a framed channel.
    pub fn new(rx: WireReceiver<R>, tx: WireSender<W>) -> Self {
        Self { rx, tx }
    }

    fn unexpected(expected: &'static str, got: impl std::fmt::Debug) -> TrainerErr {
        TrainerErr::UnexpectedReply {
            expected,
            got: format!("{got:?}"),
        }
    }

    /// Sends a command and waits for its reply.
    async fn roundtrip(&mut self, command: Command) -> Result<Reply> {
        self.tx.send(&Msg::Control(command)).await?;

        match self.rx.recv().await? {
            Msg::Reply(reply) => Ok(reply),
            Msg::Err(detail) => Err(TrainerErr::Server(detail.into_owned())),
            other => Err(Self::unexpected("a reply", other)),
        }
    }

    /// Sends a command and expects a bare acknowledgement.
    async fn expect_ok(&mut self, command: Command) -> Result<()> {
        match self.roundtrip(command).await? {
            Reply::Ok => Ok(()),
            other => Err(Self::unexpected("an acknowledgement", other)),
        }
    }

    pub async fn attach(&mut self, task_index: usize) -> Result<()> {
        self.expect_ok(Command::Attach { task_index }).await
    }

    pub async fn configure(&mut self, num_steps: i64) -> Result<()> {
        self.expect_ok(Command::Configure { num_steps }).await
    }

    pub async fn restore_state(&mut self, snapshot: ControlSnapshot) -> Result<()> {
        self.expect_ok(Command::RestoreState(snapshot)).await
    }

    pub async fn read_var(&mut self, id: VarId) -> Result<VarValue> {
        match self.roundtrip(Command::ReadVar(id)).await? {
            Reply::Value(value) => Ok(value),
            other => Err(Self::unexpected("a variable value", other)),
        }
    }

    pub async fn write_var(&mut self, id: VarId, value: VarValue) -> Result<()> {
        self.expect_ok(Command::WriteVar(id, value)).await
    }

    /// Reads a variable that must be an integer.
    pub async fn read_int(&mut self, id: VarId) -> Result<i64> {
        self.read_var(id)
            .await?
            .as_int()
            .ok_or(Self::unexpected("an integer variable", id))
    }

    /// Reads a variable that must be a float.
    pub async fn read_float(&mut self, id: VarId) -> Result<f32> {
        self.read_var(id)
            .await?
            .as_float()
            .ok_or(Self::unexpected("a float variable", id))
    }

    /// Everything the step loop polls, in one round trip.
    pub async fn loop_state(&mut self) -> Result<(i64, i64, bool)> {
        match self.roundtrip(Command::ReadLoopState).await? {
            Reply::LoopState {
                global_step,
                validated_step,
                should_terminate,
            } => Ok((global_step, validated_step, should_terminate)),
            other => Err(Self::unexpected("the loop state", other)),
        }
    }

    /// The persistent control variables, for checkpoints.
    pub async fn snapshot_state(&mut self) -> Result<ControlSnapshot> {
        match self.roundtrip(Command::SnapshotState).await? {
            Reply::State(snapshot) => Ok(snapshot),
            other => Err(Self::unexpected("a state snapshot", other)),
        }
    }

    /// One compare-and-set attempt on the reader flag.
    pub async fn acquire_reader(&mut self) -> Result<bool> {
        match self.roundtrip(Command::AcquireReader).await? {
            Reply::Acquired(acquired) => Ok(acquired),
            other => Err(Self::unexpected("a reader outcome", other)),
        }
    }

    pub async fn release_reader(&mut self) -> Result<()> {
        self.expect_ok(Command::ReleaseReader).await
    }

    pub async fn mark_validated(&mut self) -> Result<()> {
        self.expect_ok(Command::MarkValidated).await
    }

    pub async fn halve_learning_rate_fact(&mut self) -> Result<()> {
        self.expect_ok(Command::HalveLearningRateFact).await
    }

    pub async fn terminate(&mut self) -> Result<()> {
        self.expect_ok(Command::Terminate).await
    }

    pub async fn init_tokens(&mut self) -> Result<()> {
        self.expect_ok(Command::InitTokens).await
    }

    /// Blocks until a contribution token is granted.
    pub async fn acquire_token(&mut self) -> Result<()> {
        match self.roundtrip(Command::AcquireToken).await? {
            Reply::Token => Ok(()),
            other => Err(Self::unexpected("a token", other)),
        }
    }

    /// Enters the queue-runner event stream.
    ///
    /// Returns once the server has registered the subscription, so no
    /// applied-step event published afterwards can be missed.
    pub async fn subscribe_applied(&mut self) -> Result<()> {
        self.expect_ok(Command::SubscribeApplied).await
    }

    /// Waits for the next applied-step event on a subscribed channel.
    ///
    /// # Returns
    /// `None` when the server closed the stream (termination or shutdown).
    pub async fn next_applied(&mut self) -> Result<Option<i64>> {
        match self.rx.recv().await {
            Ok(Msg::Reply(Reply::Applied { global_step })) => Ok(Some(global_step)),
            Ok(Msg::Err(detail)) => Err(TrainerErr::Server(detail.into_owned())),
            Ok(other) => Err(Self::unexpected("an applied-step event", other)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Releases the tokens for the next step; no reply on the runner
    /// channel.
    pub async fn refill_tokens(&mut self) -> Result<()> {
        self.tx.send(&Msg::Control(Command::RefillTokens)).await?;
        Ok(())
    }

    /// Pushes one clipped gradient chunk for this server's shard.
    ///
    /// # Returns
    /// The learning rate of the step the contribution belongs to.
    pub async fn push_gradient(&mut self, grad: &[f32]) -> Result<f32> {
        self.tx.send(&Msg::Data(Payload::Gradient(grad))).await?;

        match self.rx.recv().await? {
            Msg::Reply(Reply::Pushed { learning_rate }) => Ok(learning_rate),
            Msg::Err(detail) => Err(TrainerErr::Server(detail.into_owned())),
            other => Err(Self::unexpected("a contribution acknowledgement", other)),
        }
    }

    /// Pulls this server's weight shard into `out`.
    pub async fn pull_weights_into(&mut self, out: &mut [f32]) -> Result<()> {
        self.tx.send(&Msg::Control(Command::PullWeights)).await?;

        match self.rx.recv().await? {
            Msg::Data(Payload::Weights(weights)) => {
                if weights.len() != out.len() {
                    return Err(TrainerErr::UnexpectedReply {
                        expected: "a shard of the local size",
                        got: format!("{} weights, expected {}", weights.len(), out.len()),
                    });
                }
                out.copy_from_slice(weights);
                Ok(())
            }
            Msg::Err(detail) => Err(TrainerErr::Server(detail.into_owned())),
            other => Err(Self::unexpected("a weight shard", other)),
        }
    }

    /// Installs this server's weight shard (chief initialization).
    pub async fn set_weights(&mut self, weights: &[f32]) -> Result<()> {
        self.tx.send(&Msg::Data(Payload::Weights(weights))).await?;

        match self.rx.recv().await? {
            Msg::Reply(Reply::Ok) => Ok(()),
            Msg::Err(detail) => Err(TrainerErr::Server(detail.into_owned())),
            other => Err(Self::unexpected("an acknowledgement", other)),
        }
    }

    /// Enqueues this worker's shutdown token.
    pub async fn done(&mut self) -> Result<()> {
        self.expect_ok(Command::Done).await
    }
}
