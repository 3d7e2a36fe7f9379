//! Admin tool for the chat server registries.
//!
//! Issues invite tokens into the configured tokens file, generates fresh
//! key material, and computes AUTH responses for smoke tests. Writes go
//! through the same registry code the server uses.

use ironchat::auth;
use ironchat::config::ServerConfig;
use ironchat::registry::TokenRegistry;
use std::env;
use std::path::Path;

#[tokio::main]
async fn main() {
	let args: Vec<String> = env::args().collect();

	match args.get(1).map(|s| s.as_str()) {
		Some("token") => {
			let config_path = args.get(2).map(|s| s.as_str()).unwrap_or("config.json");
			let config = match ServerConfig::load(Path::new(config_path)) {
				Ok(config) => config,
				Err(e) => {
					eprintln!("Cannot load config {}: {}", config_path, e);
					std::process::exit(1);
				}
			};
			let tokens = match TokenRegistry::load(Path::new(&config.tokens_file)).await {
				Ok(tokens) => tokens,
				Err(e) => {
					eprintln!("Cannot load token registry {}: {}", config.tokens_file, e);
					std::process::exit(1);
				}
			};
			match tokens.issue().await {
				Ok(token) => println!("{}", token),
				Err(e) => {
					eprintln!("Cannot issue token: {}", e);
					std::process::exit(1);
				}
			}
		}
		Some("key") => match auth::generate_key() {
			Ok(key) => println!("{}", key),
			Err(e) => {
				eprintln!("Cannot generate key: {}", e);
				std::process::exit(1);
			}
		},
		Some("sign") => {
			let (key, challenge) = match (args.get(2), args.get(3)) {
				(Some(key), Some(challenge)) => (key, challenge),
				_ => {
					eprintln!("Usage: tokengen sign <key_b64> <challenge_b64>");
					std::process::exit(1);
				}
			};
			match auth::sign_challenge(key, challenge) {
				Some(signature) => println!("{}", signature),
				None => {
					eprintln!("Key or challenge is not valid Base64");
					std::process::exit(1);
				}
			}
		}
		_ => {
			println!("tokengen - admin tool for the chat server registries");
			println!("Usage:");
			println!("  tokengen token [config.json]   issue an invite token");
			println!("  tokengen key                   generate fresh key material");
			println!("  tokengen sign <key> <nonce>    compute an AUTH response");
		}
	}
}
