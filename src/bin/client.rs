//! query-counter-client: polls a query counter server

use query_counter::client::CountersClient;
use query_counter::config::ClientConfig;
use query_counter::logging;
use query_counter::runtime::shutdown_signal;
use tracing::{error, info};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = ClientConfig::load()?;
    logging::init(&config.log_level);

    info!(
        host = %config.host,
        service = %config.service,
        interval_secs = config.interval.as_secs(),
        log_level = %config.log_level,
        "Starting query counter client"
    );

    // A reply later than one interval is given up on; the next poll follows
    let client = match CountersClient::connect(&config.host, &config.service, config.interval).await
    {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Client aborting");
            return Err(e.into());
        }
    };

    info!(server = %client.target(), "Polling");
    client.run_until(config.interval, shutdown_signal()).await;

    info!("Client shutdown");
    Ok(())
}
