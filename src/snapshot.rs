//! JSON persistence of portfolios across restarts.

use crate::errors::SnapshotError;
use crate::state::{StateSnapshot, TerminalState};

use std::fs;
use std::path::Path;

/// Writes every portfolio of `state` to `path` as pretty JSON.
///
/// The file is written to a sibling temporary path first and then renamed,
/// so a crash never leaves a truncated snapshot behind.
pub fn save<P: AsRef<Path>>(state: &TerminalState, path: P) -> Result<(), SnapshotError> {
    let path = path.as_ref();
    let snapshot = state.snapshot();
    let json = serde_json::to_string_pretty(&snapshot)?;

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, json)?;
    fs::rename(&tmp, path)?;

    log::info!(
        "Saved {} portfolios to {:?}",
        snapshot.portfolios.len(),
        path
    );
    Ok(())
}

/// Reads a snapshot previously written by [`save`].
pub fn load<P: AsRef<Path>>(path: P) -> Result<StateSnapshot, SnapshotError> {
    let content = fs::read_to_string(path.as_ref())?;
    let snapshot: StateSnapshot = serde_json::from_str(&content)?;
    log::info!(
        "Loaded {} portfolios from {:?}",
        snapshot.portfolios.len(),
        path.as_ref()
    );
    Ok(snapshot)
}

/// Restores `state` from `path` if the file exists; returns whether it did.
pub fn restore_if_present<P: AsRef<Path>>(
    state: &TerminalState,
    path: P,
) -> Result<bool, SnapshotError> {
    if !path.as_ref().exists() {
        log::info!("No snapshot at {:?}, starting empty", path.as_ref());
        return Ok(false);
    }
    state.restore(load(path)?);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[test]
    fn test_save_and_restore() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");

        let state = TerminalState::new(10);
        state
            .adjust_portfolio("alice", "SOL", Decimal::new(125, 1))
            .unwrap();
        save(&state, &path).unwrap();

        let restored = TerminalState::new(10);
        assert!(restore_if_present(&restored, &path).unwrap());
        assert_eq!(
            restored.get_portfolio("alice").quantity("SOL"),
            Decimal::new(125, 1)
        );
    }

    #[test]
    fn test_missing_snapshot_is_not_an_error() {
        let dir = TempDir::new().unwrap();
        let state = TerminalState::new(10);
        assert!(!restore_if_present(&state, dir.path().join("absent.json")).unwrap());
    }

    #[test]
    fn test_corrupt_snapshot() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not json").unwrap();
        assert!(matches!(load(file.path()), Err(SnapshotError::Format(_))));
    }
}
