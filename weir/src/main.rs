use std::error::Error;

use tracing::{error, info};

mod setup_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    if let Err(e) = weir_core::run().await {
        error!("{e:?}");
        return Err(Box::new(e) as Box<dyn Error>);
    }
    info!("Exiting...");

    Ok(())
}
