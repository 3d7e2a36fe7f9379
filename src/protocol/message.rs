//! Wire protocol for the chat server.
//!
//! UTF-8 lines terminated by CRLF. The command verb is case-insensitive;
//! arguments are space-separated; the final argument of MSG/PRIVMSG is the
//! tail of the line and may contain spaces. Room names are normalised to
//! lowercase at parse time. Unparseable input maps to `Command::Unknown`
//! rather than an error so the session loop can answer with a wire code.

/// Maximum accepted wire line, terminator included.
pub const MAX_LINE_BYTES: usize = 4096;
/// Maximum MSG/PRIVMSG body.
pub const MAX_BODY_BYTES: usize = 2048;
pub const MAX_USERNAME_LEN: usize = 32;
pub const MAX_ROOM_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Hello { username: String },
	Auth { signature: String },
	Register { username: String, pubkey: String, token: String },
	Join { room: String },
	Leave { room: String },
	Msg { room: String, body: String },
	Privmsg { target: String, body: String },
	Who { room: String },
	List,
	Users,
	Ping,
	Quit,
	Unknown,
}

/// 1-32 chars from `[A-Za-z0-9_]`.
pub fn valid_username(name: &str) -> bool {
	!name.is_empty()
		&& name.len() <= MAX_USERNAME_LEN
		&& name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Canonical form of a room name: lowercased, `#` or `&` prefix, at most
/// 64 chars, body restricted to `[a-z0-9_-]` and non-empty. Returns None
/// when the name does not validate.
pub fn canonical_room(name: &str) -> Option<String> {
	let room = name.to_lowercase();
	if room.len() > MAX_ROOM_LEN {
		return None;
	}
	let body = match room.strip_prefix(['#', '&']) {
		Some(body) => body,
		None => return None,
	};
	if body.is_empty() {
		return None;
	}
	let body_ok = body
		.chars()
		.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
	if !body_ok {
		return None;
	}
	Some(room)
}

/// Parse one line (CRLF already stripped) into a command.
pub fn parse(line: &str) -> Command {
	let (verb, rest) = match line.split_once(' ') {
		Some((verb, rest)) => (verb, rest),
		None => (line, ""),
	};

	match verb.to_ascii_uppercase().as_str() {
		"HELLO" => {
			if valid_username(rest) {
				Command::Hello { username: rest.to_string() }
			} else {
				Command::Unknown
			}
		}
		"AUTH" => {
			if rest.is_empty() {
				Command::Unknown
			} else {
				Command::Auth { signature: rest.to_string() }
			}
		}
		"REGISTER" => {
			let args: Vec<&str> = rest.split_whitespace().collect();
			if args.len() == 3 && valid_username(args[0]) {
				Command::Register {
					username: args[0].to_string(),
					pubkey: args[1].to_string(),
					token: args[2].to_string(),
				}
			} else {
				Command::Unknown
			}
		}
		"JOIN" => match canonical_room(rest) {
			Some(room) => Command::Join { room },
			None => Command::Unknown,
		},
		// LEAVE is only lowercased, never re-validated: a leave on a name
		// that never validates simply misses every room.
		"LEAVE" => {
			if rest.is_empty() {
				Command::Unknown
			} else {
				Command::Leave { room: rest.to_lowercase() }
			}
		}
		"MSG" => match rest.split_once(' ') {
			Some((room, body)) if !room.is_empty() && body.len() <= MAX_BODY_BYTES => {
				Command::Msg { room: room.to_lowercase(), body: body.to_string() }
			}
			_ => Command::Unknown,
		},
		"PRIVMSG" => match rest.split_once(' ') {
			Some((target, body)) if !target.is_empty() && body.len() <= MAX_BODY_BYTES => {
				Command::Privmsg { target: target.to_string(), body: body.to_string() }
			}
			_ => Command::Unknown,
		},
		"WHO" => {
			if rest.is_empty() {
				Command::Unknown
			} else {
				Command::Who { room: rest.to_lowercase() }
			}
		}
		"LIST" => Command::List,
		"USERS" => Command::Users,
		"PING" => Command::Ping,
		"QUIT" => Command::Quit,
		_ => Command::Unknown,
	}
}

impl Command {
	/// Canonical wire form of a parsed command, CRLF terminated.
	/// `Unknown` has no wire form and renders empty.
	pub fn format(&self) -> String {
		match self {
			Command::Hello { username } => format!("HELLO {}\r\n", username),
			Command::Auth { signature } => format!("AUTH {}\r\n", signature),
			Command::Register { username, pubkey, token } => {
				format!("REGISTER {} {} {}\r\n", username, pubkey, token)
			}
			Command::Join { room } => format!("JOIN {}\r\n", room),
			Command::Leave { room } => format!("LEAVE {}\r\n", room),
			Command::Msg { room, body } => format!("MSG {} {}\r\n", room, body),
			Command::Privmsg { target, body } => format!("PRIVMSG {} {}\r\n", target, body),
			Command::Who { room } => format!("WHO {}\r\n", room),
			Command::List => "LIST\r\n".to_string(),
			Command::Users => "USERS\r\n".to_string(),
			Command::Ping => "PING\r\n".to_string(),
			Command::Quit => "QUIT\r\n".to_string(),
			Command::Unknown => String::new(),
		}
	}
}

// ============================================================================
// RESPONSES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
	UnknownCommand,
	NotAuthenticated,
	AuthFailed,
	UserNotFound,
	UserExists,
	InvalidToken,
	RoomNotFound,
	AlreadyInRoom,
	NotInRoom,
	InvalidFormat,
	RateLimited,
}

impl ErrorCode {
	pub fn as_str(&self) -> &'static str {
		match self {
			ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
			ErrorCode::NotAuthenticated => "NOT_AUTHENTICATED",
			ErrorCode::AuthFailed => "AUTH_FAILED",
			ErrorCode::UserNotFound => "USER_NOT_FOUND",
			ErrorCode::UserExists => "USER_EXISTS",
			ErrorCode::InvalidToken => "INVALID_TOKEN",
			ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
			ErrorCode::AlreadyInRoom => "ALREADY_IN_ROOM",
			ErrorCode::NotInRoom => "NOT_IN_ROOM",
			ErrorCode::InvalidFormat => "INVALID_FORMAT",
			ErrorCode::RateLimited => "RATE_LIMITED",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
	Ok { info: Option<String> },
	Error { code: ErrorCode, detail: Option<String> },
	Challenge { nonce: String },
	Welcome { username: String },
	Room { room: String, sender: String, body: String },
	Priv { sender: String, body: String },
	Joined { room: String, username: String },
	Left { room: String, username: String },
	Online { username: String },
	Quit { username: String },
	Pong,
	RoomList { rooms: Vec<String> },
	UserList { users: Vec<String> },
	WhoList { room: String, users: Vec<String> },
}

impl Response {
	pub fn ok(info: impl Into<String>) -> Self {
		Response::Ok { info: Some(info.into()) }
	}

	pub fn error(code: ErrorCode, detail: impl Into<String>) -> Self {
		Response::Error { code, detail: Some(detail.into()) }
	}

	pub fn error_code(code: ErrorCode) -> Self {
		Response::Error { code, detail: None }
	}

	/// Wire form, CRLF terminated. Empty lists omit the body entirely.
	pub fn format(&self) -> String {
		match self {
			Response::Ok { info: Some(info) } => format!("OK {}\r\n", info),
			Response::Ok { info: None } => "OK\r\n".to_string(),
			Response::Error { code, detail: Some(detail) } => {
				format!("ERROR {} {}\r\n", code.as_str(), detail)
			}
			Response::Error { code, detail: None } => format!("ERROR {}\r\n", code.as_str()),
			Response::Challenge { nonce } => format!("CHALLENGE {}\r\n", nonce),
			Response::Welcome { username } => format!("WELCOME {}\r\n", username),
			Response::Room { room, sender, body } => {
				format!("ROOM {} {} {}\r\n", room, sender, body)
			}
			Response::Priv { sender, body } => format!("PRIV {} {}\r\n", sender, body),
			Response::Joined { room, username } => format!("JOINED {} {}\r\n", room, username),
			Response::Left { room, username } => format!("LEFT {} {}\r\n", room, username),
			Response::Online { username } => format!("ONLINE {}\r\n", username),
			Response::Quit { username } => format!("QUIT {}\r\n", username),
			Response::Pong => "PONG\r\n".to_string(),
			Response::RoomList { rooms } => format_list("ROOMLIST", rooms),
			Response::UserList { users } => format_list("USERLIST", users),
			Response::WhoList { room, users } => {
				format_list(&format!("WHOLIST {}", room), users)
			}
		}
	}
}

fn format_list(head: &str, items: &[String]) -> String {
	if items.is_empty() {
		format!("{}\r\n", head)
	} else {
		format!("{} {}\r\n", head, items.join(" "))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_hello() {
		assert_eq!(
			parse("HELLO alice"),
			Command::Hello { username: "alice".to_string() }
		);
		// verb is case-insensitive
		assert_eq!(
			parse("hello alice"),
			Command::Hello { username: "alice".to_string() }
		);
	}

	#[test]
	fn rejects_bad_usernames() {
		assert_eq!(parse("HELLO"), Command::Unknown);
		assert_eq!(parse("HELLO bad name"), Command::Unknown);
		assert_eq!(parse("HELLO spaß"), Command::Unknown);
		assert_eq!(parse(&format!("HELLO {}", "a".repeat(33))), Command::Unknown);
		assert_eq!(
			parse(&format!("HELLO {}", "a".repeat(32))),
			Command::Hello { username: "a".repeat(32) }
		);
	}

	#[test]
	fn parses_register_with_exactly_three_args() {
		assert_eq!(
			parse("REGISTER alice cHVi dG9r"),
			Command::Register {
				username: "alice".to_string(),
				pubkey: "cHVi".to_string(),
				token: "dG9r".to_string(),
			}
		);
		assert_eq!(parse("REGISTER alice cHVi"), Command::Unknown);
		assert_eq!(parse("REGISTER alice cHVi dG9r extra"), Command::Unknown);
		assert_eq!(parse("REGISTER bad!name cHVi dG9r"), Command::Unknown);
	}

	#[test]
	fn join_normalises_and_validates_rooms() {
		assert_eq!(
			parse("JOIN #Lobby"),
			Command::Join { room: "#lobby".to_string() }
		);
		assert_eq!(
			parse("JOIN &ops"),
			Command::Join { room: "&ops".to_string() }
		);
		assert_eq!(parse("JOIN lobby"), Command::Unknown);
		assert_eq!(parse("JOIN #"), Command::Unknown);
		assert_eq!(parse("JOIN #lob by"), Command::Unknown);
		assert_eq!(parse("JOIN #lob!"), Command::Unknown);
		assert_eq!(
			parse(&format!("JOIN #{}", "a".repeat(63))),
			Command::Join { room: format!("#{}", "a".repeat(63)) }
		);
		assert_eq!(parse(&format!("JOIN #{}", "a".repeat(64))), Command::Unknown);
	}

	#[test]
	fn leave_is_lowercased_but_not_revalidated() {
		assert_eq!(
			parse("LEAVE #Lobby"),
			Command::Leave { room: "#lobby".to_string() }
		);
		assert_eq!(
			parse("LEAVE not-a-room!"),
			Command::Leave { room: "not-a-room!".to_string() }
		);
		assert_eq!(parse("LEAVE"), Command::Unknown);
	}

	#[test]
	fn msg_keeps_spaces_in_body() {
		assert_eq!(
			parse("MSG #Lobby hello there world"),
			Command::Msg {
				room: "#lobby".to_string(),
				body: "hello there world".to_string(),
			}
		);
		assert_eq!(parse("MSG #lobby"), Command::Unknown);
	}

	#[test]
	fn body_boundary_is_2048_bytes() {
		let ok = format!("MSG #lobby {}", "x".repeat(MAX_BODY_BYTES));
		let over = format!("MSG #lobby {}", "x".repeat(MAX_BODY_BYTES + 1));
		assert!(matches!(parse(&ok), Command::Msg { .. }));
		assert_eq!(parse(&over), Command::Unknown);

		let priv_over = format!("PRIVMSG bob {}", "x".repeat(MAX_BODY_BYTES + 1));
		assert_eq!(parse(&priv_over), Command::Unknown);
	}

	#[test]
	fn bare_commands_parse() {
		assert_eq!(parse("LIST"), Command::List);
		assert_eq!(parse("users"), Command::Users);
		assert_eq!(parse("PING"), Command::Ping);
		assert_eq!(parse("QUIT"), Command::Quit);
		assert_eq!(parse("FROBNICATE"), Command::Unknown);
		assert_eq!(parse(""), Command::Unknown);
	}

	#[test]
	fn auth_takes_the_tail_as_signature() {
		assert_eq!(
			parse("AUTH c2ln"),
			Command::Auth { signature: "c2ln".to_string() }
		);
		assert_eq!(parse("AUTH"), Command::Unknown);
	}

	#[test]
	fn parse_format_round_trip_up_to_normalisation() {
		for line in [
			"HELLO alice",
			"AUTH c2lnbmF0dXJl",
			"REGISTER alice cHVia2V5 dG9rZW4=",
			"JOIN #lobby",
			"LEAVE #lobby",
			"MSG #lobby hello world",
			"PRIVMSG bob hi there",
			"WHO #lobby",
			"LIST",
			"USERS",
			"PING",
			"QUIT",
		] {
			assert_eq!(parse(line).format(), format!("{}\r\n", line));
		}
		// rooms are normalised to lowercase
		assert_eq!(parse("JOIN #Lobby").format(), "JOIN #lobby\r\n");
	}

	#[test]
	fn response_shapes() {
		assert_eq!(Response::ok("JOIN #lobby").format(), "OK JOIN #lobby\r\n");
		assert_eq!(
			Response::error(ErrorCode::UserNotFound, "bob").format(),
			"ERROR USER_NOT_FOUND bob\r\n"
		);
		assert_eq!(
			Response::error_code(ErrorCode::RateLimited).format(),
			"ERROR RATE_LIMITED\r\n"
		);
		assert_eq!(
			Response::Room {
				room: "#lobby".to_string(),
				sender: "alice".to_string(),
				body: "hello world".to_string(),
			}
			.format(),
			"ROOM #lobby alice hello world\r\n"
		);
		assert_eq!(Response::Pong.format(), "PONG\r\n");
	}

	#[test]
	fn empty_lists_omit_the_body() {
		assert_eq!(Response::RoomList { rooms: vec![] }.format(), "ROOMLIST\r\n");
		assert_eq!(
			Response::RoomList { rooms: vec!["#a".to_string(), "#b".to_string()] }.format(),
			"ROOMLIST #a #b\r\n"
		);
		assert_eq!(
			Response::WhoList { room: "#lobby".to_string(), users: vec![] }.format(),
			"WHOLIST #lobby\r\n"
		);
	}
}
