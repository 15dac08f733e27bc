use base64::{Engine as _, engine::general_purpose::STANDARD};
use clap::{Parser, Subcommand};
use settingsync::{
    Authenticator, SettingsCipher,
    config::{
        ClientConfig, Config, RealtimeConfig, SecurityConfig, ServerConfig, StorageConfig,
    },
    node,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Local development helpers for settingsync", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a development server
    ///
    /// With --data-dir the key is kept in `settings.key` next to the database
    /// so a restart can still open it; otherwise a throwaway key is used.
    Serve {
        /// Database directory; a temporary one is used if omitted
        #[arg(short, long)]
        data_dir: Option<PathBuf>,

        /// Base64 encryption key, overriding the data dir key file
        #[arg(long)]
        key: Option<String>,

        #[arg(long, default_value = "127.0.0.1:6400")]
        api_addr: String,

        #[arg(long, default_value = "127.0.0.1:6401")]
        realtime_addr: String,

        /// Signing secret for owner tokens
        #[arg(long, default_value = "dev-secret")]
        secret: String,

        /// Print a token for this owner id at startup
        #[arg(long)]
        owner: Option<String>,
    },
    /// Mint an owner token
    Token {
        owner: String,

        #[arg(long)]
        secret: String,

        /// Lifetime in seconds
        #[arg(long, default_value = "86400")]
        ttl: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    match Args::parse().command {
        Command::Token { owner, secret, ttl } => {
            let auth = Authenticator::new(&secret)?;
            println!("{}", auth.issue(&owner, Duration::from_secs(ttl)));
            Ok(())
        }
        Command::Serve {
            data_dir,
            key,
            api_addr,
            realtime_addr,
            secret,
            owner,
        } => {
            // Keep alive to prevent cleanup
            let (db_dir, _temp_dir) = match &data_dir {
                Some(dir) => (dir.clone(), None),
                None => {
                    let temp = TempDir::new()?;
                    (temp.path().to_path_buf(), Some(temp))
                }
            };

            let encryption_key = match (key, &data_dir) {
                (Some(key), _) => key,
                (None, Some(dir)) => SettingsCipher::load_or_create_key_file(&dir.join("settings.key"))?,
                (None, None) => STANDARD.encode(SettingsCipher::generate_key()),
            };

            let config = Config {
                server: ServerConfig {
                    api_addr,
                    realtime_addr,
                    db_path: db_dir.join("settings.db"),
                },
                security: SecurityConfig {
                    encryption_key,
                    signing_secret: secret,
                    token_ttl_secs: 86_400,
                },
                realtime: RealtimeConfig::default(),
                storage: StorageConfig {
                    sqlite_cache_size: 10000,
                    sqlite_busy_timeout: 5000,
                },
                client: ClientConfig::default(),
            };

            if let Some(owner) = owner {
                let auth = config.security.authenticator()?;
                info!(
                    "Token for owner:{}: {}",
                    owner,
                    auth.issue(&owner, config.security.token_ttl())
                );
            }
            config.validate()?;
            info!("Database at {:?}", config.server.db_path);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    Ok(())
                }
                result = node::run(&config) => result,
            }
        }
    }
}
