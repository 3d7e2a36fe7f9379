use std::fmt;

#[derive(Debug)]
pub enum ChatError {
	Io(std::io::Error),
	Serialization(serde_json::Error),
	Tls(tokio_rustls::rustls::Error),
	Rng(rand::Error),
}

impl From<std::io::Error> for ChatError {
	fn from(err: std::io::Error) -> Self { ChatError::Io(err) }
}

impl From<serde_json::Error> for ChatError {
	fn from(err: serde_json::Error) -> Self { ChatError::Serialization(err) }
}

impl From<tokio_rustls::rustls::Error> for ChatError {
	fn from(err: tokio_rustls::rustls::Error) -> Self { ChatError::Tls(err) }
}

impl From<rand::Error> for ChatError {
	fn from(err: rand::Error) -> Self { ChatError::Rng(err) }
}

impl fmt::Display for ChatError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ChatError::Io(err) => write!(f, "io error: {}", err),
			ChatError::Serialization(err) => write!(f, "serialization error: {}", err),
			ChatError::Tls(err) => write!(f, "tls error: {}", err),
			ChatError::Rng(err) => write!(f, "rng error: {}", err),
		}
	}
}

impl std::error::Error for ChatError {}
