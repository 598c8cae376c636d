use thiserror::Error;

use crate::processing::NormalizeError;

/// Longest slice of an HTTP error body carried into a message.
pub const MAX_ERROR_BODY_CHARS: usize = 800;

/// Library error type for wallpaper updates.
#[derive(Debug, Error)]
pub enum Error {
    /// Provider or daemon configuration is incomplete.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// No album has been chosen yet.
    #[error("No album selected.")]
    NoAlbumSelected,

    /// Not signed in, or the token could not be refreshed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Non-success HTTP status; `body` is already trimmed and capped.
    #[error("{}", describe_http(.status, .body))]
    Network { status: u16, body: String },

    /// Connection, TLS or timeout failure below HTTP.
    #[error("network error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider answered with JSON we could not map.
    #[error("unexpected response from photo service: {0}")]
    InvalidResponse(#[from] serde_json::Error),

    #[error(transparent)]
    Decode(#[from] NormalizeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// One or more outputs rejected the wallpaper.
    #[error("Couldn't set the wallpaper: {0}")]
    Display(String),

    #[error("Couldn't pick a different photo to avoid repeating the last wallpaper.")]
    NoFreshCandidate,

    /// Every candidate failed; one message per attempt in order.
    #[error("{}", describe_candidates(.0))]
    AllCandidatesFailed(Vec<String>),

    /// Superseded or shut down; never shown to the user.
    #[error("update cancelled")]
    Cancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Builds a [`Error::Network`] from a raw response body.
    pub fn http(status: u16, body: &str) -> Self {
        Error::Network {
            status,
            body: cap_body(body),
        }
    }

    /// Failures confined to one candidate; the run moves on to the next one.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Network { .. }
            | Error::Transport(_)
            | Error::InvalidResponse(_)
            | Error::Io(_)
            | Error::Display(_) => true,
            Error::Decode(err) => !err.is_cancelled(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            Error::Cancelled => true,
            Error::Decode(err) => err.is_cancelled(),
            _ => false,
        }
    }
}

fn cap_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_CHARS {
        return trimmed.to_string();
    }
    let mut capped: String = trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect();
    capped.push('…');
    capped
}

fn describe_http(status: &u16, body: &str) -> String {
    if body.is_empty() {
        format!("HTTP {status}.")
    } else {
        format!("HTTP {status}: {body}")
    }
}

fn describe_candidates(messages: &[String]) -> String {
    let detail = messages
        .iter()
        .enumerate()
        .map(|(idx, msg)| format!("#{}: {msg}", idx + 1))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "Couldn't decode/convert any of the last {} photos. {detail}",
        messages.len()
    )
}
