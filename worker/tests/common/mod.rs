#![allow(dead_code)]

use std::sync::Arc;

use parameter_server::{serve, DoneWaiter, OptimizerKind, ServerConfig, ServerState};
use tokio::io::{self, DuplexStream, ReadHalf, WriteHalf};
use worker::PsClient;

pub type TestClient = PsClient<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

/// An in-process parameter server with predictable (plain SGD) updates.
pub fn server(num_replicas: usize, aggregate: usize) -> (Arc<ServerState>, DoneWaiter) {
    ServerState::new(ServerConfig {
        num_replicas,
        numbatches_to_aggregate: aggregate,
        initial_learning_rate: 0.1,
        learning_rate_decay: 1.0,
        valid_frequency: 5,
        optimizer: OptimizerKind::Sgd,
    })
}

/// One duplex connection to the server, served in the background.
pub fn link(state: &Arc<ServerState>) -> TestClient {
    const LINK_CAPACITY: usize = 1 << 16;

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

/// A scratch log directory unique to one test.
pub fn scratch_logdir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("trainer-test-{name}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}
