//! Machine identity and machine-wide paths.
//!
//! The machine id is a stable `<sanitized-hostname>-<4-hex>` string minted
//! once per machine and persisted in the XDG config directory. It is loaded
//! lazily and cached for the life of the process; the registry uses it to
//! scope central-path ownership.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::files::atomic_write;

/// XDG-style global config directory (`~/.config/minimem` on Linux).
pub fn global_config_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("minimem")
}

/// Machine-wide runtime state (`~/.minimem`): daemon pid file and log.
pub fn home_state_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".minimem")
}

/// Global configuration shared by every root on this machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GlobalConfig {
    pub machine_id: Option<String>,
    /// Absolute path of the central repository, when configured.
    pub central_repo: Option<PathBuf>,
}

impl GlobalConfig {
    pub fn path() -> PathBuf {
        global_config_dir().join("config.json")
    }

    pub fn load() -> Result<GlobalConfig> {
        Self::load_from(&Self::path())
    }

    pub fn load_from(path: &Path) -> Result<GlobalConfig> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(GlobalConfig::default())
            }
            Err(e) => return Err(Error::fs(path, e)),
        };
        serde_json::from_str(&raw)
            .map_err(|e| Error::Validation(format!("malformed {}: {e}", path.display())))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        atomic_write(path, serde_json::to_string_pretty(self)?.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Machine id
// ---------------------------------------------------------------------------

fn hostname() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            let name = name.to_string_lossy().to_string();
            if !name.is_empty() {
                return name;
            }
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "machine".to_string())
}

/// Lowercase the hostname and keep only `[a-z0-9-]`, collapsing runs of
/// other characters to single dashes.
fn sanitize_hostname(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    let trimmed = out.trim_matches('-').to_string();
    if trimmed.is_empty() {
        "machine".to_string()
    } else {
        trimmed
    }
}

fn mint_machine_id() -> String {
    let suffix = &Uuid::new_v4().simple().to_string()[..4];
    format!("{}-{}", sanitize_hostname(&hostname()), suffix)
}

/// Load (minting and persisting on first use) this machine's id from a
/// specific global config file.
pub fn machine_id_from(path: &Path) -> Result<String> {
    let mut config = GlobalConfig::load_from(path)?;
    if let Some(id) = config.machine_id {
        return Ok(id);
    }
    let id = mint_machine_id();
    config.machine_id = Some(id.clone());
    config.save_to(path)?;
    Ok(id)
}

/// The process-wide machine id, cached after first read.
pub fn machine_id() -> Result<String> {
    static CACHED: OnceLock<String> = OnceLock::new();
    if let Some(id) = CACHED.get() {
        return Ok(id.clone());
    }
    let id = machine_id_from(&GlobalConfig::path())?;
    Ok(CACHED.get_or_init(|| id).clone())
}

// ---------------------------------------------------------------------------
// Home compression for registry storage
// ---------------------------------------------------------------------------

/// Compress `$HOME` back to `~` for display and registry storage.
pub fn compress_home(path: &Path) -> String {
    let display = path.display().to_string();
    if let Some(home) = dirs::home_dir() {
        let home = home.display().to_string();
        if display == home {
            return "~".to_string();
        }
        if let Some(rest) = display.strip_prefix(&format!("{home}/")) {
            return format!("~/{rest}");
        }
    }
    display
}

/// Expand a leading `~` to the home directory for comparison and I/O.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
    }
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitizes_hostnames() {
        assert_eq!(sanitize_hostname("Alices-MacBook.local"), "alices-macbook-local");
        assert_eq!(sanitize_hostname("dev_box_42"), "dev-box-42");
        assert_eq!(sanitize_hostname("___"), "machine");
        assert_eq!(sanitize_hostname(""), "machine");
    }

    #[test]
    fn machine_id_is_minted_once_and_persisted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let first = machine_id_from(&path).unwrap();
        let second = machine_id_from(&path).unwrap();
        assert_eq!(first, second);

        let (stem, suffix) = first.rsplit_once('-').unwrap();
        assert!(!stem.is_empty());
        assert_eq!(suffix.len(), 4);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));

        let config = GlobalConfig::load_from(&path).unwrap();
        assert_eq!(config.machine_id.as_deref(), Some(first.as_str()));
    }

    #[test]
    fn home_compression_roundtrips() {
        if let Some(home) = dirs::home_dir() {
            let inside = home.join("code/proj");
            let compressed = compress_home(&inside);
            assert_eq!(compressed, "~/code/proj");
            assert_eq!(expand_home(&compressed), inside);
        }
        assert_eq!(compress_home(Path::new("/srv/shared")), "/srv/shared");
        assert_eq!(expand_home("/srv/shared"), PathBuf::from("/srv/shared"));
    }
}
