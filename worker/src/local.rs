//! Single-process training.
//!
//! When no cluster is configured the worker hosts its own parameter server
//! in-process, connected over in-memory duplex links: one replica, one
//! shard, the worker is the chief. The training path is identical to the
//! distributed one.

use std::sync::Arc;

use comms::specs::TrainerSpec;
use parameter_server::{serve, ServerConfig, ServerState};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    task::JoinHandle,
};

use crate::{
    client::PsClient,
    error::{Result, TrainerErr},
};

const LINK_CAPACITY: usize = 1 << 16;

/// A client side of an in-process link.
pub type LocalClient = PsClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// An in-process parameter server with connected protocol clients.
pub struct LocalSession {
    /// The single shard connection (this worker is the chief).
    pub clients: Vec<LocalClient>,
    /// The queue-runner connection, present in synchronous mode.
    pub runner_link: Option<LocalClient>,
    state: Arc<ServerState>,
    waiter: JoinHandle<()>,
}

/// The server half left behind once the links are handed to the trainer.
pub struct LocalBarrier {
    state: Arc<ServerState>,
    waiter: JoinHandle<()>,
}

impl LocalBarrier {
    /// Waits for the shutdown barrier: the session's worker has enqueued
    /// its done token and the server side has drained it.
    pub async fn finished(self) {
        let _ = self.waiter.await;
        drop(self.state);
    }
}

impl LocalSession {
    /// Hosts an in-process parameter server for a single-worker run.
    ///
    /// # Arguments
    /// * `trainer` - The shared trainer options.
    /// * `synchronous` - Whether a queue-runner link is needed.
    pub fn start(trainer: &TrainerSpec, synchronous: bool) -> Result<Self> {
        let config = ServerConfig::from_trainer(trainer, 1).map_err(TrainerErr::Config)?;
        let (state, waiter) = ServerState::new(config);

        let clients = vec![connect(&state)];
        let runner_link = synchronous.then(|| connect(&state));
        let waiter = tokio::spawn(waiter.wait());

        Ok(Self {
            clients,
            runner_link,
            state,
            waiter,
        })
    }

    /// Splits the session into the trainer-facing links and the barrier to
    /// await after training.
    pub fn into_parts(self) -> (Vec<LocalClient>, Option<LocalClient>, LocalBarrier) {
        (
            self.clients,
            self.runner_link,
            LocalBarrier {
                state: self.state,
                waiter: self.waiter,
            },
        )
    }
}

/// Opens one duplex link and serves its server side in the background.
fn connect(state: &Arc<ServerState>) -> LocalClient {
    let (server_stream, client_stream) = io::duplex(LINK_CAPACITY);

    let (server_rx, server_tx) = io::split(server_stream);
    let (server_rx, server_tx) = comms::channel(server_rx, server_tx);

    let state = Arc::clone(state);
    tokio::spawn(async move {
        let _ = serve(state, server_rx, server_tx).await;
    });

    let (client_rx, client_tx) = io::split(client_stream);
    let (client_rx, client_tx) = comms::channel(client_rx, client_tx);
    PsClient::new(client_rx, client_tx)
}
