use env_logger::Env;

use shiplink::config::ShipConfig;
use shiplink::ship::ShipProxy;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = ShipConfig::from_args();
    ShipProxy::new(config).run().await?;
    Ok(())
}
