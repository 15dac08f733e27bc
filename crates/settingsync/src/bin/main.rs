use clap::Parser;
use settingsync::{Config, node};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version, about = "Settings sync server", long_about = None)]
struct Args {
    /// Config file; SETTINGSYNC__SECTION__KEY variables override it
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    info!("Starting settingsync server");

    if let Err(e) = config.validate() {
        error!("Refusing to start: {}", e);
        std::process::exit(1);
    }

    node::run(&config).await
}
