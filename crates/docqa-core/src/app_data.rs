//! Where docqa stores its own data (currently just `config.toml`).
//!
//! Uploaded documents and the index are never written here; they live in memory only.

use std::path::PathBuf;

/// Returns the directory where docqa stores its config.
/// On Linux: `~/.local/share/docqa/`; on macOS: `~/Library/Application Support/app.docqa.docqa/`.
/// Creates the directory if it doesn't exist; returns `None` if we can't determine the path.
pub fn app_data_dir() -> Option<PathBuf> {
    let dir = directories::ProjectDirs::from("app", "docqa", "docqa")?
        .data_local_dir()
        .to_path_buf();
    std::fs::create_dir_all(&dir).ok()?;
    Some(dir)
}
