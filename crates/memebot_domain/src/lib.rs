#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported streaming platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
	Twitch,
	#[serde(rename = "youtube")]
	YouTube,
	Kick,
	#[serde(rename = "vkvideo")]
	VkVideo,
	Trovo,
}

impl Platform {
	pub const ALL: [Platform; 5] = [
		Platform::Twitch,
		Platform::YouTube,
		Platform::Kick,
		Platform::VkVideo,
		Platform::Trovo,
	];

	/// Stable string identifier (also the `provider` column value).
	pub const fn as_str(self) -> &'static str {
		match self {
			Platform::Twitch => "twitch",
			Platform::YouTube => "youtube",
			Platform::Kick => "kick",
			Platform::VkVideo => "vkvideo",
			Platform::Trovo => "trovo",
		}
	}

	/// Longest chat message the platform accepts, in characters.
	pub const fn max_message_chars(self) -> usize {
		match self {
			Platform::Twitch | Platform::Kick | Platform::VkVideo => 500,
			Platform::YouTube => 200,
			Platform::Trovo => 300,
		}
	}
}

impl fmt::Display for Platform {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("unknown platform: {0}")]
	UnknownPlatform(String),
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

impl FromStr for Platform {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		match s.to_ascii_lowercase().as_str() {
			"twitch" => Ok(Platform::Twitch),
			"youtube" | "you_tube" | "yt" => Ok(Platform::YouTube),
			"kick" => Ok(Platform::Kick),
			"vkvideo" | "vk_video" | "vkvideolive" | "vk" => Ok(Platform::VkVideo),
			"trovo" => Ok(Platform::Trovo),
			other => Err(ParseIdError::UnknownPlatform(other.to_string())),
		}
	}
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id. Surrounding whitespace is trimmed.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				let trimmed = id.trim();
				if trimmed.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if trimmed.len() == id.len() {
					return Ok(Self(id));
				}
				Ok(Self(trimmed.to_string()))
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Local channel (streamer) identifier.
	ChannelId
);

string_id!(
	/// Platform-native channel identifier (broadcaster id, channel url, ...).
	PlatformChannelId
);

string_id!(
	/// Local user identifier.
	UserId
);

/// Unique channel key: `(platform, channel_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
	pub platform: Platform,
	pub channel_id: ChannelId,
}

impl ChannelKey {
	pub fn new(platform: Platform, channel_id: ChannelId) -> Self {
		Self { platform, channel_id }
	}

	/// Parse a `platform:channel_id` string.
	pub fn parse(s: &str) -> Result<Self, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let (platform_s, channel_s) = s
			.split_once(':')
			.ok_or_else(|| ParseIdError::InvalidFormat("expected platform:channel_id".into()))?;

		let platform = Platform::from_str(platform_s)?;
		let channel_id = ChannelId::new(channel_s.to_string())?;
		Ok(Self::new(platform, channel_id))
	}
}

impl fmt::Display for ChannelKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.platform, self.channel_id)
	}
}

impl FromStr for ChannelKey {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		ChannelKey::parse(s)
	}
}

/// Outbox row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(pub uuid::Uuid);

impl OutboxId {
	/// Time-ordered, so rows queued in the same millisecond still sort by insertion.
	pub fn generate() -> Self {
		Self(uuid::Uuid::now_v7())
	}
}

impl fmt::Display for OutboxId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for OutboxId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Stream session identifier. Scopes per-stream counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for SessionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for SessionId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Normalize a channel slug: trims, drops a leading `@` and lower-cases.
pub fn normalize_slug(raw: &str) -> String {
	raw.trim_start_matches(|c: char| c == '@' || c.is_whitespace())
		.trim_end()
		.to_lowercase()
}
