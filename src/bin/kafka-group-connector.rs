use anyhow::Context as _;
use clap::Parser;
use kafka_group_connector::prelude::*;
use log::{error, info, warn};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// kafkaのトピックを購読し、イベントをJSON Linesとして標準出力に書き出す。
#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// JSON形式の設定ファイル
    #[clap(short, long)]
    config: PathBuf,

    /// 設定ファイルの`workers`を上書きする
    #[clap(short, long)]
    workers: Option<usize>,

    /// 設定を検査して終了する
    #[clap(long)]
    check: bool,

    #[clap(long, default_value_t = 1024)]
    buffer: usize,
}

/// SIGINTかSIGTERMを受け取ると完了する。
fn shutdown_signal() -> anyhow::Result<oneshot::Receiver<i32>> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = oneshot::channel();
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            let _ = tx.send(signal);
        }
    });
    Ok(rx)
}

async fn write_events(mut deliveries: mpsc::Receiver<Delivery>) {
    let stdout = std::io::stdout();
    while let Some(delivery) = deliveries.recv().await {
        let line = match serde_json::to_string(&delivery.event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to serialize event.(tag={}): {}", delivery.event.tag, e);
                delivery.nack();
                continue;
            }
        };
        let mut out = stdout.lock();
        if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
            error!("Failed to write event.(tag={}): {}", delivery.event.tag, e);
            delivery.nack();
            break;
        }
        delivery.ack();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = ConnectorConfig::from_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    if let Some(workers) = args.workers {
        config.workers(workers);
    }
    config.validate()?;
    if args.check {
        println!(
            "{}",
            serde_json::json!({
                "topics": config.subscription()?.to_string(),
                "workers": config.workers,
                "multi_workers_ready": config.multi_workers_ready(),
            })
        );
        return Ok(());
    }

    let (pipeline, deliveries) = ChannelPipeline::channel(args.buffer);
    let writer = tokio::spawn(write_events(deliveries));

    let mut connector = Connector::builder(config)
        .pipeline(Arc::new(pipeline))
        .build()?;
    let signal = shutdown_signal()?;
    let result = connector.run(signal).await;
    info!("Connector finished.(stats={:?})", connector.stats());

    // パイプラインの送信側を閉じて書き込みの終了を待つ
    drop(connector);
    writer.await?;
    Ok(result?)
}
