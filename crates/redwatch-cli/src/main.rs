use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use redwatch_consumer::Consumer;
use redwatch_producer::{Producer, ProducerConfig};
use redwatch_queue::{AmqpSink, QueueConfig};
use redwatch_source::{HtmlNoticeSource, HtmlSourceConfig};
use redwatch_store::{NoticeStore, PgNoticeStore, StoreConfig};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "redwatch")]
#[command(about = "Red-notice harvest pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run harvesting cycles and publish notices to the queue.
    Produce,
    /// Consume queued notices into the store.
    Consume,
    /// Serve the read-only web surface.
    Serve {
        #[arg(long, env = "WEB_PORT", default_value_t = 5000)]
        port: u16,
    },
    /// Create the schema and exit.
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Produce => {
            let source = HtmlNoticeSource::new(HtmlSourceConfig::from_env())?;
            let sink = AmqpSink::new(QueueConfig::from_env());
            let producer = Producer::new(
                Arc::new(source),
                Arc::new(sink),
                ProducerConfig::from_env(),
            );
            producer.run_forever(shutdown_signal()).await
        }
        Commands::Consume => {
            let store = PgNoticeStore::connect(&StoreConfig::from_env()).await?;
            store.ensure_schema().await?;
            let store: Arc<dyn NoticeStore> = Arc::new(store);
            let consumer = Consumer::new(QueueConfig::from_env(), store);
            consumer.run(shutdown_signal()).await
        }
        Commands::Serve { port } => {
            let store = PgNoticeStore::connect(&StoreConfig::from_env()).await?;
            store.ensure_schema().await?;
            info!(port, "serving web surface");
            redwatch_web::serve(Arc::new(store), port).await
        }
        Commands::InitDb => {
            let store = PgNoticeStore::connect(&StoreConfig::from_env()).await?;
            store.ensure_schema().await?;
            store.close().await;
            info!("schema ready");
            Ok(())
        }
    }
}

/// Watch channel flipped to `true` on the first interrupt signal. The
/// loops stop accepting work and close their connections; in-flight
/// messages stay unacked and redeliver on the next run.
fn shutdown_signal() -> watch::Receiver<bool> {
    shutdown_from(tokio::signal::ctrl_c())
}

fn shutdown_from<F>(signal: F) -> watch::Receiver<bool>
where
    F: Future<Output = std::io::Result<()>> + Send + 'static,
{
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        match signal.await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = tx.send(true);
            }
            Err(err) => {
                error!(error = %err, "interrupt handler failed, running without one");
                // Keep the sender alive: dropping it would make the loops
                // read the closed channel as a shutdown request.
                let _keep_alive = tx;
                std::future::pending::<()>().await;
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signal_flips_the_shutdown_channel() {
        let mut rx = shutdown_from(async { Ok(()) });
        tokio::time::timeout(Duration::from_secs(1), rx.changed())
            .await
            .expect("channel should change")
            .unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn failed_handler_install_does_not_read_as_shutdown() {
        let mut rx = shutdown_from(async {
            Err(std::io::Error::other("no signal handler"))
        });
        let waited =
            tokio::time::timeout(Duration::from_millis(50), rx.changed()).await;
        assert!(waited.is_err(), "channel must stay open and unchanged");
        assert!(!*rx.borrow());
    }
}
