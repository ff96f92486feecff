//! The per-connection protocol service.
//!
//! Every worker connection is served independently against the shared
//! `ServerState`. Protocol violations and state errors are answered with
//! error messages; a closed stream ends the connection task cleanly.

use std::{borrow::Cow, io, sync::Arc};

use comms::{
    msg::{Command, Msg, Payload, Reply},
    WireReceiver, WireSender,
};
use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::state::ServerState;

/// Serves one worker connection until the stream closes.
///
/// # Arguments
/// * `state` - The shared server state.
/// * `rx` - The receiving end of the connection.
/// * `tx` - The sending end of the connection.
pub async fn serve<R, W>(
    state: Arc<ServerState>,
    mut rx: WireReceiver<R>,
    mut tx: WireSender<W>,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        // Data payloads borrow the receive buffer, so they are handled (and
        // answered with an owned reply) before the next command dispatch.
        let mut command = None;
        let reply = {
            let msg: Msg = match rx.recv().await {
                Ok(msg) => msg,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };

            match msg {
                Msg::Control(cmd) => {
                    command = Some(cmd);
                    None
                }
                Msg::Data(Payload::Gradient(grad)) => Some(match state.push_gradient(grad) {
                    Ok(learning_rate) => Msg::Reply(Reply::Pushed { learning_rate }),
                    Err(e) => Msg::Err(Cow::Owned(e.to_string())),
                }),
                Msg::Data(Payload::Weights(weights)) => {
                    state.init_params(weights);
                    Some(Msg::Reply(Reply::Ok))
                }
                other => Some(Msg::Err(Cow::Owned(format!(
                    "received an unexpected message kind: {other:?}"
                )))),
            }
        };

        if let Some(reply) = reply {
            tx.send(&reply).await?;
        }

        let Some(command) = command else {
            continue;
        };

        if let Flow::Close = dispatch(&state, command, &mut rx, &mut tx).await? {
            return Ok(());
        }
    }
}

enum Flow {
    Continue,
    Close,
}

async fn dispatch<R, W>(
    state: &Arc<ServerState>,
    command: Command,
    rx: &mut WireReceiver<R>,
    tx: &mut WireSender<W>,
) -> io::Result<Flow>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let reply = match command {
        Command::Attach { task_index } => {
            debug!(task_index = task_index; "worker attached");
            Reply::Ok
        }
        Command::Configure { num_steps } => {
            state.configure(num_steps);
            Reply::Ok
        }
        Command::RestoreState(snapshot) => {
            state.restore(snapshot);
            Reply::Ok
        }
        Command::ReadVar(id) => Reply::Value(state.control().read(id)),
        Command::WriteVar(id, value) => {
            if !state.control().write(id, value) {
                let detail = format!("cannot write {value:?} into {id:?}");
                tx.send(&Msg::Err(Cow::Owned(detail))).await?;
                return Ok(Flow::Continue);
            }
            Reply::Ok
        }
        Command::SnapshotState => Reply::State(state.control().snapshot()),
        Command::ReadLoopState => {
            let (global_step, validated_step, should_terminate) = state.control().loop_state();
            Reply::LoopState {
                global_step,
                validated_step,
                should_terminate,
            }
        }
        Command::AcquireReader => Reply::Acquired(state.control().try_acquire_reader()),
        Command::ReleaseReader => {
            state.control().release_reader();
            Reply::Ok
        }
        Command::MarkValidated => {
            state.control().mark_validated();
            Reply::Ok
        }
        Command::HalveLearningRateFact => {
            state.control().halve_learning_rate_fact();
            Reply::Ok
        }
        Command::Terminate => {
            state.terminate();
            Reply::Ok
        }
        Command::InitTokens | Command::RefillTokens => {
            state.add_tokens();
            Reply::Ok
        }
        Command::AcquireToken => {
            state.acquire_token().await;
            Reply::Token
        }
        Command::SubscribeApplied => return run_queue_runner_channel(state, rx, tx).await,
        Command::PullWeights => {
            let weights = state.pull_weights().await;
            tx.send(&Msg::Data(Payload::Weights(&weights))).await?;
            return Ok(Flow::Continue);
        }
        Command::Done => {
            state.enqueue_done();
            Reply::Ok
        }
    };

    tx.send(&Msg::Reply(reply)).await?;
    Ok(Flow::Continue)
}

/// The chief queue runner's event stream: one applied-step event out, one
/// token refill back, until the chief hangs up or the run terminates.
async fn run_queue_runner_channel<R, W>(
    state: &Arc<ServerState>,
    rx: &mut WireReceiver<R>,
    tx: &mut WireSender<W>,
) -> io::Result<Flow>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut applied = state.subscribe_applied();
    let mut terminate = state.subscribe_terminate();

    // Acknowledge only after the subscription is registered, so the chief
    // can seed tokens knowing no applied event can be missed.
    tx.send(&Msg::Reply(Reply::Ok)).await?;

    loop {
        tokio::select! {
            changed = applied.changed() => {
                if changed.is_err() {
                    return Ok(Flow::Close);
                }

                let global_step = *applied.borrow_and_update();
                tx.send(&Msg::Reply(Reply::Applied { global_step })).await?;

                match rx.recv().await {
                    Ok(Msg::Control(Command::RefillTokens)) => state.add_tokens(),
                    Ok(other) => {
                        let detail = format!(
                            "the queue runner channel expects token refills, got: {other:?}"
                        );
                        tx.send(&Msg::Err(Cow::Owned(detail))).await?;
                        return Ok(Flow::Close);
                    }
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return Ok(Flow::Close);
                    }
                    Err(e) => return Err(e),
                }
            }
            _ = async { let _ = terminate.wait_for(|&t| t).await; } => return Ok(Flow::Close),
        }
    }
}
