use crate::config::types::Config;
use crate::config::validation::validate;
use crate::ConfigResult;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Loads, validates and anchors a configuration file
///
/// Relative `database-path`, `index-dir` and `output-dir` values are resolved
/// against the directory holding the file, so a run started from any working
/// directory touches the same ledger.
///
/// ```no_run
/// use std::path::Path;
/// use tidemark::config::load_config;
///
/// let config = load_config(Path::new("tidemark.toml")).unwrap();
/// println!("Sources: {}", config.sources.len());
/// ```
pub fn load_config(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path)?;
    parse_config(&content, path.parent())
}

/// Parses and validates configuration text
///
/// With `base_dir` set, relative storage paths are resolved against it.
pub fn parse_config(content: &str, base_dir: Option<&Path>) -> ConfigResult<Config> {
    let mut config: Config = toml::from_str(content)?;
    validate(&config)?;

    if let Some(base) = base_dir.filter(|dir| !dir.as_os_str().is_empty()) {
        anchor(&mut config.ledger.database_path, base);
        anchor(&mut config.dedup.index_dir, base);
        anchor(&mut config.run.output_dir, base);
    }
    Ok(config)
}

fn anchor(value: &mut String, base: &Path) {
    let path = PathBuf::from(value.as_str());
    if path.is_relative() {
        *value = base.join(path).to_string_lossy().into_owned();
    }
}

/// Hex SHA-256 of configuration text
///
/// Stored as a campaign's configuration snapshot, so a later reader can tell
/// whether the configuration changed while the campaign ran.
pub fn config_hash(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Hex SHA-256 of a configuration file
pub fn compute_config_hash(path: &Path) -> ConfigResult<String> {
    let content = std::fs::read_to_string(path)?;
    Ok(config_hash(&content))
}

/// Loads a configuration together with the hash of the exact text that was parsed
pub fn load_config_with_hash(path: &Path) -> ConfigResult<(Config, String)> {
    let content = std::fs::read_to_string(path)?;
    let config = parse_config(&content, path.parent())?;
    Ok((config, config_hash(&content)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigError;
    use tempfile::TempDir;

    const VALID: &str = r#"
[ledger]
database-path = "data/ledger.db"

[dedup]
index-dir = "/var/lib/tidemark/index"

[run]
concurrency = 8

[user-agent]
crawler-name = "TestCrawler"
crawler-version = "1.0"
contact-url = "https://example.com/about"
contact-email = "admin@example.com"

[[source]]
name = "bbc"
documents = ["https://bbc.co.uk/news/1"]
"#;

    fn write_config(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("tidemark.toml");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_load_anchors_relative_paths() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&write_config(&dir, VALID)).unwrap();

        assert_eq!(
            PathBuf::from(&config.ledger.database_path),
            dir.path().join("data/ledger.db")
        );
        assert_eq!(config.dedup.index_dir, "/var/lib/tidemark/index");
        assert_eq!(
            PathBuf::from(&config.run.output_dir),
            dir.path().join("./data/out")
        );
        assert_eq!(config.run.concurrency, 8);
        assert_eq!(config.sources[0].cadence_hours, 24);
    }

    #[test]
    fn test_parse_without_base_keeps_paths() {
        let config = parse_config(VALID, None).unwrap();
        assert_eq!(config.ledger.database_path, "data/ledger.db");
    }

    #[test]
    fn test_hash_matches_parsed_text() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, VALID);
        let (config, hash) = load_config_with_hash(&path).unwrap();

        assert_eq!(config.sources[0].name, "bbc");
        assert_eq!(hash, config_hash(VALID));
        assert_eq!(hash, compute_config_hash(&path).unwrap());
        assert_eq!(hash.len(), 64);
        assert_ne!(hash, config_hash("content 2"));
    }

    #[test]
    fn test_load_errors() {
        assert!(matches!(
            load_config(Path::new("/nonexistent/config.toml")),
            Err(ConfigError::Io(_))
        ));
        assert!(matches!(
            parse_config("this is not valid TOML {{{", None),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            parse_config(&VALID.replace("concurrency = 8", "concurrency = 0"), None),
            Err(ConfigError::Validation(_))
        ));
    }
}
