use std::{env, fs, io, path::PathBuf, process::exit};

use comms::specs::ExperimentSpec;
use log::{info, warn};
use seqml::BatchDispenser;
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    signal,
};
use worker::{data, LocalSession, PsClient, TrainGraph, Trainer};

fn usage() -> ! {
    eprintln!("usage: worker --spec <experiment.json> --task-index <n>");
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

type NetClient = PsClient<OwnedReadHalf, OwnedWriteHalf>;

async fn connect(addr: &str) -> io::Result<NetClient> {
    let stream = TcpStream::connect(addr).await?;
    let (rx, tx) = stream.into_split();
    let (rx, tx) = comms::channel(rx, tx);
    Ok(PsClient::new(rx, tx))
}

#[tokio::main]
async fn main() -> io::Result<()> {
    env_logger::init();

    let (spec_path, task_index) = parse_args();
    let spec: ExperimentSpec =
        serde_json::from_str(&fs::read_to_string(&spec_path)?).map_err(invalid)?;

    let train_path = spec
        .data
        .train
        .clone()
        .ok_or_else(|| invalid("the experiment has no training corpus"))?;
    let mut dispenser = data::load_dispenser(train_path.as_ref(), spec.data.batch_size)?;

    let mut val_dispenser = match &spec.data.valid {
        Some(path) => Some(data::load_dispenser(
            path.as_ref(),
            spec.data.batch_size,
        )?),
        None => None,
    };

    let num_servers = spec.cluster.as_ref().map_or(1, |c| c.num_servers());
    let graph = TrainGraph::build(&spec, dispenser.num_batches(), num_servers)?;
    let logdir = PathBuf::from(&spec.logdir);

    info!(
        task_index = task_index;
        "training for {} steps, {} parameters across {num_servers} servers",
        graph.num_steps, graph.num_params
    );

    match &spec.cluster {
        Some(cluster) => {
            if task_index >= cluster.num_replicas() {
                return Err(invalid(format!(
                    "no worker endpoint for task index {task_index}"
                )));
            }

            let mut clients = Vec::with_capacity(cluster.ps.len());
            for addr in &cluster.ps {
                clients.push(connect(addr).await?);
            }

            let runner_link = if task_index == 0 && graph.synchronous {
                Some(connect(&cluster.ps[0]).await?)
            } else {
                None
            };

            // An interrupt raises the global stop flag on its own
            // connection; the step loop observes it and exits through the
            // normal shutdown path, done tokens included.
            let mut stop_link = connect(&cluster.ps[0]).await?;
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("interrupted, requesting a global stop");
                    if let Err(e) = stop_link.terminate().await {
                        warn!("failed to request a global stop: {e}");
                    }
                }
            });

            let mut trainer = Trainer::new(graph, clients, runner_link, task_index, logdir)?;
            trainer
                .train(&mut dispenser, as_dispenser(&mut val_dispenser))
                .await?;
        }
        None => {
            let session = LocalSession::start(&spec.trainer, graph.synchronous)?;
            let (clients, runner_link, barrier) = session.into_parts();

            let mut trainer = Trainer::new(graph, clients, runner_link, 0, logdir)?;
            trainer
                .train(&mut dispenser, as_dispenser(&mut val_dispenser))
                .await?;

            barrier.finished().await;
        }
    }

    info!("training finished");
    Ok(())
}

fn as_dispenser(
    val: &mut Option<seqml::MemoryDispenser>,
) -> Option<&mut dyn BatchDispenser> {
    val.as_mut().map(|d| d as &mut dyn BatchDispenser)
}
