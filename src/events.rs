use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Timer,
}

/// Progress of the current update run.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdateStage {
    #[default]
    Idle,
    FetchingItems,
    Filtering,
    SelectingCandidate {
        attempt: usize,
        total: usize,
        name: String,
    },
    UsingCachedFile(String),
    Downloading {
        name: String,
        attempt: usize,
        total: usize,
    },
    Decoding(String),
    WritingFile(String),
    ApplyingToDisplays(usize),
    Done(String),
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStage::Idle => write!(f, "Idle"),
            UpdateStage::FetchingItems => write!(f, "Fetching photos…"),
            UpdateStage::Filtering => write!(f, "Filtering photos…"),
            UpdateStage::SelectingCandidate {
                attempt,
                total,
                name,
            } => write!(f, "Trying {name} ({attempt}/{total})"),
            UpdateStage::UsingCachedFile(name) => write!(f, "Using cached {name}"),
            UpdateStage::Downloading {
                name,
                attempt,
                total,
            } => write!(f, "Downloading {name} ({attempt}/{total})"),
            UpdateStage::Decoding(name) => write!(f, "Converting {name}"),
            UpdateStage::WritingFile(name) => write!(f, "Saving {name}"),
            UpdateStage::ApplyingToDisplays(count) => {
                write!(f, "Applying to {count} display(s)")
            }
            UpdateStage::Done(name) => write!(f, "Wallpaper set to {name}"),
        }
    }
}

/// Observable updater state for whatever front end is attached.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStatus {
    pub stage: UpdateStage,
    pub is_updating: bool,
    pub last_error: Option<String>,
    pub next_due: Option<DateTime<Utc>>,
    pub last_successful_update: Option<DateTime<Utc>>,
    pub album_picture_count: usize,
    pub no_pictures_found: bool,
}
