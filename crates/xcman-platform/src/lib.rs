mod commands;
mod fs;
mod paths;

pub use commands::HideWindow;
pub use fs::write_atomic;
pub use paths::{AppPaths, AppPathsError};
