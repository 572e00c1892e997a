use clap::Parser;
use phylo_worker::{
    config::{load_config, WorkerConfig},
    file_format::UploadPayload,
    logging::init_logging,
    worker::{Inbound, OutboundMessage, Worker, WorkerRequest},
};
use tokio::{
    io::{stdin, stdout, AsyncBufReadExt, AsyncWriteExt, BufReader},
    sync::mpsc::unbounded_channel,
};
use tracing::{error, info};

/// Serve tree queries over newline-delimited JSON on stdin/stdout.
#[derive(Parser)]
#[command(version, about)]
struct WorkerOpts {
    /// TOML file with worker tunables; defaults are used when absent
    #[arg(long, env = "PHYLO_WORKER_CONFIG")]
    config: Option<String>,

    /// Dataset to load at startup, as if it had been uploaded
    #[arg(long)]
    load: Option<String>,

    /// Filetype of the `--load` dataset, e.g. `nwk`
    #[arg(long)]
    filetype: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let opts = WorkerOpts::parse();

    let config = match &opts.config {
        Some(path) => load_config(path)?,
        None => WorkerConfig::default(),
    };
    info!(?config, "starting worker");

    let (outbox, mut outbound) = unbounded_channel::<OutboundMessage>();
    let (inbox_tx, inbox) = unbounded_channel::<Inbound>();
    let worker = Worker::new(config, outbox.clone());

    let writer = tokio::spawn(async move {
        let mut out = stdout();
        while let Some(msg) = outbound.recv().await {
            let line = match msg.to_line() {
                Ok(line) => line,
                Err(err) => {
                    error!(%err, "unable to encode response");
                    continue;
                }
            };
            if out.write_all(line.as_bytes()).await.is_err()
                || out.write_all(b"\n").await.is_err()
                || out.flush().await.is_err()
            {
                break;
            }
        }
    });

    if let Some(path) = opts.load {
        let request = WorkerRequest::Upload(UploadPayload {
            filename: Some(path.clone()),
            filetype: opts.filetype,
            data: None,
            path: Some(path),
        });
        // The receiver lives in `worker.run` below, so this can't fail yet.
        let _ = inbox_tx.send(Inbound {
            request_id: None,
            request,
        });
    }

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stdin()).lines();
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(err) => {
                    error!(%err, "stdin read failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match Inbound::parse_line(&line) {
                Ok(inbound) => {
                    if inbox_tx.send(inbound).is_err() {
                        break;
                    }
                }
                Err(response) => {
                    let _ = outbox.send(response);
                }
            }
        }
    });

    worker.run(inbox).await;
    reader.await?;
    drop(worker);
    writer.await?;
    Ok(())
}
