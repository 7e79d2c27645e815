//! teleconsole binary entry point.

use clap::Parser;
use tracing::{debug, info};

use teleconsole_client::cli::{Action, Cli};
use teleconsole_client::{broadcast, join, ApiClient, Config, VERSION};
use teleconsole_core::geo::find_fastest_endpoint;
use teleconsole_core::{Error, Result};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = teleconsole_core::init_logging(cli.verbose) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let verbosity = cli.verbose;
    let config = match cli.to_config() {
        Ok(config) => config,
        Err(e) => fatal(&e, verbosity),
    };
    debug!(endpoint = %config.api_endpoint_url, "configuration loaded");

    let rt = tokio::runtime::Runtime::new().expect("failed to create tokio runtime");
    if let Err(e) = rt.block_on(run(cli, config)) {
        fatal(&e, verbosity);
    }
}

async fn run(cli: Cli, mut config: Config) -> Result<()> {
    match cli.action {
        Some(Action::Version) => {
            println!("Teleconsole {VERSION}");
            Ok(())
        }
        Some(Action::Join { session_id }) => {
            let mut api = ApiClient::new(&config, VERSION)?;
            join::join(&mut config, &mut api, &session_id).await
        }
        None => {
            // On the default endpoint, pick the region that answers first.
            if !config.is_endpoint_specified() {
                let endpoint = find_fastest_endpoint().await;
                config.set_endpoint_host(endpoint.hostname)?;
                info!(endpoint = endpoint.hostname, "selected fastest endpoint");
            }
            let mut api = ApiClient::new(&config, VERSION)?;
            broadcast::start_broadcast(&config, &mut api).await
        }
    }
}

/// Prints a single human-friendly line (plus a debug dump with `-v`) and
/// exits with status 1.
fn fatal(err: &Error, verbosity: u8) -> ! {
    if err.is_untrusted_cert() {
        eprintln!("\x1b[1mWARNING:\x1b[0m {err}");
    } else {
        eprintln!("{err}");
    }
    if verbosity > 0 {
        eprintln!("{err:?}");
    }
    std::process::exit(1);
}
