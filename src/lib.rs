pub mod config;
pub mod error;
pub mod events;
pub mod media;
pub mod processing;
pub mod schedule;
pub mod selection;
pub mod source;
pub mod store;
pub mod platform {
    pub mod display_surface;
}
pub mod tasks {
    pub mod run;
    pub mod settings_watch;
    pub mod updater;
}

pub use error::{Error, Result};
pub use settings_model;
