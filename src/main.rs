use harbor::{app, bootstrap};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `--config <path>`, or the HARBOR_CONFIG_PATH environment variable.
    let config_path = config_path_from_args().or_else(|| std::env::var("HARBOR_CONFIG_PATH").ok());

    let configuration = bootstrap::load_configuration(config_path.as_deref())?;
    bootstrap::logging::setup(&configuration);

    let mut running = app::start(configuration).await?;

    // Drain lifecycle events into the log until ctrl-c.
    loop {
        tokio::select! {
            event = running.events.recv() => {
                match event {
                    None => break,
                    Some(event) => info!(?event, "engine event"),
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(error) = result {
                    warn!(%error, "could not listen for the shutdown signal");
                }
                break;
            }
        }
    }

    info!("shutting down");
    running.shutdown().await;

    Ok(())
}

fn config_path_from_args() -> Option<String> {
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next();
        }
    }

    None
}
