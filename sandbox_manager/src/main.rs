use anyhow::Error;
use clap::Parser;
use log::error;
use sandbox_manager::{app::App, cli::Cli};

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<(), Error> {
    env_logger::init();
    let cli = Cli::parse();

    let result = match App::new(cli).await {
        Ok(app) => app.run().await,
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        error!("{}", err);
    }
    result
}
