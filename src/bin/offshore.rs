use env_logger::Env;

use shiplink::config::OffshoreConfig;
use shiplink::offshore::OffshoreServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = OffshoreConfig::from_args();
    OffshoreServer::new(config)?.run().await?;
    Ok(())
}
