use std::{env, fs, io, process::exit, sync::Arc};

use comms::specs::ExperimentSpec;
use log::{info, warn};
use parameter_server::{serve, ServerConfig, ServerState};
use tokio::{net::TcpListener, signal};

fn usage() -> ! {
    eprintln!("usage: parameter_server --spec <experiment.json> --task-index <n>");
    exit(2)
}

fn parse_args() -> (String, usize) {
    let mut spec = None;
    let mut task_index = 0;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--spec" => spec = args.next(),
            "--task-index" => {
                task_index = args
                    .next()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or_else(|| usage())
            }
            _ => usage(),
        }
    }

    (spec.unwrap_or_else(|| usage()), task_index)
}

fn invalid<E: ToString>(e: E) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, e.to_string())
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) -> io::Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let (rx, tx) = stream.into_split();
            let (rx, tx) = comms::channel(rx, tx);

            if let Err(e) = serve(state, rx, tx).await {
                warn!("connection from {peer} failed: {e}");
            }
        });
    }
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let (spec_path, task_index) = parse_args();
    let spec: ExperimentSpec =
        serde_json::from_str(&fs::read_to_string(&spec_path)?).map_err(invalid)?;

    let cluster = spec
        .cluster
        .as_ref()
        .ok_or_else(|| invalid("the experiment has no cluster specification"))?;
    let addr = cluster
        .ps
        .get(task_index)
        .ok_or_else(|| invalid(format!("no ps endpoint for task index {task_index}")))?;

    let config =
        ServerConfig::from_trainer(&spec.trainer, cluster.num_replicas()).map_err(invalid)?;
    let (state, waiter) = ServerState::new(config);

    let listener = TcpListener::bind(addr).await?;
    info!(task_index = task_index; "parameter server listening on {addr}");

    // Serve until every worker has enqueued its shutdown token, then let
    // the process exit; no server terminates while a worker still depends
    // on its shard.
    tokio::select! {
        res = accept_loop(listener, Arc::clone(&state)) => res,
        _ = waiter.wait() => {
            info!("all workers have finished");
            Ok(())
        }
        _ = signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}
