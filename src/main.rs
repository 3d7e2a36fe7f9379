use ironchat::config::ServerConfig;
use ironchat::server::ChatServer;
use std::env;
use std::path::Path;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).map(|s| s.as_str()).unwrap_or("config.json");

    let config = match ServerConfig::load(Path::new(config_path)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Cannot load config {}: {}", config_path, e);
            std::process::exit(1);
        }
    };

    if let Err(e) = ChatServer::start(config).await {
        eprintln!("Server failed: {}", e);
        std::process::exit(1);
    }
}
