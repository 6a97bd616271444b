//! 🚀 bkt-cli — the front door, the bouncer, the maitre d' of bkt.
//!
//! 🎬 *[narrator voice]* "It all started with a simple main() function..."
//! 📦 This binary crate is the thin CLI wrapper that loads config, sets up logging, builds a
//! storage backend, and then drains the connector to stdout, one NDJSON line per part.
//! Like a manager, but it actually writes things down. 🦆

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bkt::backends::{ObjectStoreBackend, ObjectStoreClient};
use bkt::{AppConfig, Connector, ConnectorError};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// 🚀 main() — where it all begins. The "I pressed F5 and held my breath" moment.
///
/// 🔧 Steps:
/// 1. Init tracing (so we can see what goes wrong, and when)
/// 2. Parse args (or don't, we're not picky)
/// 3. Load config (the moment of truth)
/// 4. Drain the bucket (send it and pray 🙏)
/// 5. Handle errors (cry)
#[tokio::main]
async fn main() -> Result<()> {
    // 📡 logs go to stderr; stdout belongs to the data
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let path_arg = args.get(1).map(String::as_str).unwrap_or("bkt.toml");

    // 🔒 A missing file is fine: BKT_* environment variables can carry the whole config
    let config_file = Path::new(path_arg);
    let config_file = config_file
        .try_exists()
        .with_context(|| {
            format!(
                "💀 Couldn't check whether the configuration file exists. Was checking here: '{}'",
                config_file.display()
            )
        })?
        .then_some(config_file);

    let result = match bkt::load_config(config_file) {
        Ok(app_config) => run(app_config).await,
        Err(err) => Err(err.context("💀 In bkt-cli, main, we couldn't load the config. Take a look at the file and the BKT_* variables.")),
    };

    if let Err(err) = result {
        error!("💀 error: {}", err);
        // -- 🧅 peel the onion of sadness, one layer at a time
        for cause in err.chain().skip(1) {
            error!("⚠️  cause: {}", cause);
        }
        std::process::exit(1);
    }
    Ok(())
}

/// 🚰 Connect, pull until the bucket runs dry, print, ack, close.
async fn run(app_config: AppConfig) -> Result<()> {
    let storage: Arc<dyn ObjectStoreClient> = match &app_config.store.local_root {
        Some(root) => {
            info!("📁 reading buckets from local directory '{root}'");
            Arc::new(ObjectStoreBackend::local(root))
        }
        None => Arc::new(ObjectStoreBackend::gcs()),
    };
    if app_config.input.uses_subscription() {
        // -- 📨 the library takes any NotificationClient; this binary ships without one
        anyhow::bail!(
            "💀 pubsub.subscription is configured, but bkt-cli has no Pub/Sub client built in. \
             Embed the bkt library with your own NotificationClient instead."
        );
    }

    let connector = Connector::new(app_config.input, storage, None)?;
    connector.connect().await?;

    let drained = drain(&connector).await;
    // 🧹 close no matter how draining went; report the draining error first
    let closed = connector.close().await;
    drained?;
    closed?;
    Ok(())
}

async fn drain(connector: &Connector) -> Result<()> {
    let cancel = CancellationToken::new();
    let stdout = std::io::stdout();
    let mut units = 0usize;

    loop {
        let (batch, ack) = match connector.pull(&cancel).await {
            Ok(pulled) => pulled,
            Err(ConnectorError::EndOfStream) => break,
            // -- 🎯 per-object trouble: that object is acked as failed, the rest carry on
            Err(
                err @ (ConnectorError::EmptyObject { .. }
                | ConnectorError::GenerationMismatch { .. }
                | ConnectorError::Storage { .. }
                | ConnectorError::Decode(_)
                | ConnectorError::InvalidNotification(_)),
            ) => {
                warn!("⚠️ skipping object: {:#}", anyhow::Error::new(err));
                continue;
            }
            Err(err) => return Err(err).context("💀 pulling from the connector failed"),
        };

        let written = {
            let mut out = stdout.lock();
            batch.parts.iter().try_for_each(|part| {
                let line = serde_json::json!({
                    "content": part.content_lossy(),
                    "metadata": part.metadata,
                });
                writeln!(out, "{line}")
            })
        };
        let failure = written.as_ref().err().map(|err| anyhow::anyhow!("writing to stdout failed: {err}"));
        ack.ack(failure.as_ref())
            .await
            .map_err(ConnectorError::Ack)
            .context("💀 acknowledging a unit failed")?;
        written.context("💀 stdout stopped taking our bytes")?;
        units += 1;
    }

    info!("🏁 drained {units} units. The bucket is empty. Emotionally, so are we.");
    Ok(())
}
