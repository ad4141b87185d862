//! Helper functions for tempfile usage in tests

use std::io::Write;

use anyhow::Context;

/// Create a named temp file with a helpful error message.
pub fn create_temp_file() -> anyhow::Result<tempfile::NamedTempFile> {
    tempfile::NamedTempFile::new().context("Failed to create temporary file for test")
}

/// Write `contents` to a fresh `.json` temp file
pub fn json_temp_file(contents: &str) -> anyhow::Result<tempfile::NamedTempFile> {
    let mut file = tempfile::NamedTempFile::with_suffix(".json")
        .context("Failed to create temporary JSON file")?;
    file.write_all(contents.as_bytes())
        .context("Failed to write temporary JSON file")?;
    file.flush().context("Failed to flush temporary JSON file")?;
    Ok(file)
}

/// Create a temp directory with a helpful error message.
pub fn create_temp_dir() -> anyhow::Result<tempfile::TempDir> {
    tempfile::tempdir().context("Failed to create temporary directory for test")
}
