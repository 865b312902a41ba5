use anyhow::{Context, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::engine::EngineConfigPaths;

/// Marker line guarding every block this crate appends.
pub const MARKER: &str = "# lan-role-rs: LAN access";

/// Private LAN ranges allowed to connect.
pub const PRIVATE_RANGES: &[&str] = &["10.0.0.0/8", "172.16.0.0/12", "192.168.0.0/16"];

/// `pg_hba.conf` rules accepting password logins from private ranges.
pub fn access_block() -> String {
    let mut block = format!("\n{MARKER}\n");
    for range in PRIVATE_RANGES {
        block.push_str(&format!("host    all    all    {range:<16} md5\n"));
    }
    block
}

/// `postgresql.conf` directive to listen on every interface. A later
/// assignment overrides earlier ones, so appending is enough.
pub fn listen_block() -> String {
    format!("\n{MARKER}\nlisten_addresses = '*'\n")
}

/// Append `block` to `path` unless the marker is already there.
///
/// Returns `true` when the file was changed.
pub fn append_once(path: &Path, block: &str) -> Result<bool> {
    let current = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    if current.contains(MARKER) {
        return Ok(false);
    }
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open config file for append: {}", path.display()))?;
    let prefix = if current.is_empty() || current.ends_with('\n') {
        ""
    } else {
        "\n"
    };
    file.write_all(format!("{prefix}{block}").as_bytes())
        .with_context(|| format!("failed to append to config file: {}", path.display()))?;
    Ok(true)
}

/// Result of [`allow_lan_access`]. Each file is updated independently, so a
/// failure on one can coexist with a change to the other.
#[derive(Debug, Default)]
pub struct LanAccessUpdate {
    /// At least one file was appended to; the engine needs a reload.
    pub changed: bool,
    pub errors: Vec<anyhow::Error>,
}

/// Open both engine files to LAN connections.
pub fn allow_lan_access(paths: &EngineConfigPaths) -> LanAccessUpdate {
    let mut update = LanAccessUpdate::default();
    for (path, block) in [
        (&paths.access_file, access_block()),
        (&paths.settings_file, listen_block()),
    ] {
        match append_once(path, &block) {
            Ok(changed) => update.changed |= changed,
            Err(e) => update.errors.push(e),
        }
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_block_covers_private_ranges() {
        let block = access_block();
        assert!(block.contains(MARKER));
        for range in PRIVATE_RANGES {
            assert!(block.contains(range));
        }
    }

    #[test]
    fn append_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pg_hba.conf");
        fs::write(&path, "local all all peer").unwrap();

        assert!(append_once(&path, &access_block()).unwrap());
        let once = fs::read_to_string(&path).unwrap();
        assert!(!append_once(&path, &access_block()).unwrap());
        let twice = fs::read_to_string(&path).unwrap();

        assert_eq!(once, twice);
        assert!(once.starts_with("local all all peer\n"));
        assert_eq!(once.matches(MARKER).count(), 1);
    }

    #[test]
    fn access_file_is_updated_when_settings_file_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let paths = EngineConfigPaths {
            access_file: dir.path().join("pg_hba.conf"),
            settings_file: dir.path().join("absent.conf"),
        };
        fs::write(&paths.access_file, "local all all peer\n").unwrap();

        let update = allow_lan_access(&paths);

        assert!(update.changed);
        assert_eq!(update.errors.len(), 1);
        assert!(fs::read_to_string(&paths.access_file).unwrap().contains(MARKER));
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(append_once(&dir.path().join("absent.conf"), &listen_block()).is_err());
    }
}
