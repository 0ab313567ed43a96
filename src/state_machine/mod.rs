mod job;
mod state;

pub use job::{Job, extension_of, generate_name, normalize_extension};
pub use state::JobState;
