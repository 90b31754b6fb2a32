//! Config file loading and version fingerprinting.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{GeneralConfig, RemoteConfig, ReplicationConfig};

const FRAGMENT_DIR: &str = "replication.d";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("remote table without a name in {path}")]
    UnnamedRemote { path: PathBuf },

    #[error("duplicate remote {name:?} in {path}")]
    DuplicateRemote { name: String, path: PathBuf },
}

/// On-disk shape of the main file and of each fragment.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    general: GeneralConfig,
    #[serde(rename = "remote")]
    remotes: Vec<RemoteConfig>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FragmentFile {
    #[serde(rename = "remote")]
    remotes: Vec<RemoteConfig>,
}

/// Parse the main config file and every fragment into a snapshot.
pub fn load(main: &Path) -> Result<ReplicationConfig, ConfigError> {
    let contents = read(main)?;
    let parsed: ConfigFile = parse(main, &contents)?;

    let mut remotes = parsed.remotes;
    for path in fragment_paths(main) {
        let contents = read(&path)?;
        let fragment: FragmentFile = parse(&path, &contents)?;
        remotes.extend(fragment.remotes);
    }

    let mut seen = std::collections::BTreeSet::new();
    for remote in &remotes {
        if remote.name.is_empty() {
            return Err(ConfigError::UnnamedRemote {
                path: main.to_path_buf(),
            });
        }
        if !seen.insert(remote.name.clone()) {
            return Err(ConfigError::DuplicateRemote {
                name: remote.name.clone(),
                path: main.to_path_buf(),
            });
        }
    }

    Ok(ReplicationConfig {
        general: parsed.general,
        remotes,
        version: version(main),
    })
}

/// Fingerprint of the current on-disk config.
///
/// Hashes the path, mtime and contents of the main file and every
/// fragment, so it is stable across byte-equal reads and changes whenever
/// any contributing file changes. Unreadable files contribute their error,
/// which still yields a deterministic value.
pub fn version(main: &Path) -> String {
    let mut hasher = Sha256::new();
    digest_file(&mut hasher, main);
    for path in fragment_paths(main) {
        digest_file(&mut hasher, &path);
    }
    hex::encode(hasher.finalize())
}

fn digest_file(hasher: &mut Sha256, path: &Path) {
    hasher.update(path.to_string_lossy().as_bytes());
    hasher.update(b"\n");
    match fs::metadata(path).and_then(|m| m.modified()) {
        Ok(mtime) => {
            let nanos = mtime
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos())
                .unwrap_or(0);
            hasher.update(nanos.to_le_bytes());
        }
        Err(e) => hasher.update(e.to_string().as_bytes()),
    }
    match fs::read(path) {
        Ok(bytes) => hasher.update(&bytes),
        Err(e) => hasher.update(e.to_string().as_bytes()),
    }
}

/// Fragment files sorted by name, so remote ordering is deterministic.
fn fragment_paths(main: &Path) -> Vec<PathBuf> {
    let dir = match main.parent() {
        Some(parent) => parent.join(FRAGMENT_DIR),
        None => return Vec::new(),
    };
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();
    paths
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse<T: serde::de::DeserializeOwned>(path: &Path, contents: &str) -> Result<T, ConfigError> {
    toml::from_str(contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source: Box::new(source),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;

    fn write_file(path: &Path, contents: &str) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.sync_all().unwrap();
    }

    #[test]
    fn loads_main_and_fragments() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("replication.toml");
        write_file(
            &main,
            r#"
[general]
git_dir = "/srv/git"
auto_reload = true

[[remote]]
name = "backup"
url = ["file:///backup/${name}.git"]
"#,
        );
        fs::create_dir(dir.path().join("replication.d")).unwrap();
        write_file(
            &dir.path().join("replication.d").join("offsite.toml"),
            r#"
[[remote]]
name = "offsite"
url = ["ssh://mirror.example.com/${name}.git"]
replication_delay = 60
"#,
        );

        let config = load(&main).unwrap();
        assert!(config.general.auto_reload);
        assert_eq!(config.remotes.len(), 2);
        assert_eq!(config.remotes[0].name, "backup");
        assert_eq!(config.remotes[1].name, "offsite");
        assert_eq!(config.remotes[1].replication_delay, 60);
        assert_eq!(config.version, version(&main));
    }

    #[test]
    fn version_stable_until_contents_change() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("replication.toml");
        write_file(&main, "[general]\n");

        let v1 = version(&main);
        assert_eq!(v1, version(&main));

        write_file(&main, "[general]\nauto_reload = true\n");
        assert_ne!(v1, version(&main));
    }

    #[test]
    fn duplicate_remote_names_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("replication.toml");
        write_file(
            &main,
            r#"
[[remote]]
name = "dup"
[[remote]]
name = "dup"
"#,
        );
        assert!(matches!(
            load(&main),
            Err(ConfigError::DuplicateRemote { .. })
        ));
    }

    #[test]
    fn parse_failure_names_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("replication.toml");
        write_file(&main, "not valid toml [");
        let err = load(&main).unwrap_err();
        assert!(err.to_string().contains("replication.toml"));
    }
}
