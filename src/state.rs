//! Persistence for per-container read cursors.
//!
//! The state file is a flat JSON object of container id to canonical
//! timestamp, written whole on every checkpoint. Loads never fail: a
//! missing or corrupt file means starting over, which costs duplicated
//! lines rather than lost ones.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tracing::{error, warn};

pub type CursorMap = HashMap<String, String>;

pub fn load(path: &Path) -> CursorMap {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return CursorMap::new(),
        Err(error) => {
            warn!(
                message = "Unable to read state file, starting with empty state.",
                path = %path.display(),
                %error,
            );
            return CursorMap::new();
        }
    };

    match serde_json::from_slice(&raw) {
        Ok(map) => map,
        Err(error) => {
            error!(
                message = "State file is corrupt, starting with empty state.",
                path = %path.display(),
                %error,
            );
            CursorMap::new()
        }
    }
}

/// Write the map to a temp file beside the target and rename it into
/// place, so a crash mid-write leaves the previous checkpoint intact.
pub fn save(path: &Path, cursors: &CursorMap) -> io::Result<()> {
    let tmp_path = path.with_extension("tmp");

    let mut file = fs::File::create(&tmp_path)?;
    serde_json::to_writer(&mut file, cursors)?;
    file.flush()?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut cursors = CursorMap::new();
        cursors.insert("abc".into(), "2020-05-01T12:34:56.123456789Z".into());
        cursors.insert("def".into(), "1970-01-01T00:00:00.000000000Z".into());

        save(&path, &cursors).unwrap();
        assert_eq!(load(&path), cursors);
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("nope.json")).is_empty());
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{definitely not json").unwrap();
        assert!(load(&path).is_empty());
    }

    #[test]
    fn save_overwrites_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let mut first = CursorMap::new();
        first.insert("abc".into(), "2020-05-01T00:00:00.000000000Z".into());
        save(&path, &first).unwrap();

        let mut second = CursorMap::new();
        second.insert("abc".into(), "2020-05-02T00:00:00.000000000Z".into());
        save(&path, &second).unwrap();

        assert_eq!(load(&path), second);
    }

    #[test]
    fn no_temp_file_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        save(&path, &CursorMap::new()).unwrap();
        assert!(!path.with_extension("tmp").exists());
    }
}
