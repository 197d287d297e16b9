//! Locating and parsing config files
//!
//! Config files are Hjson: plain JSON parses unchanged, and hand-written
//! files may use `#`, `//` and `/* */` comments, unquoted keys, quoteless
//! strings and optional commas.

use std::path::{Path, PathBuf};

use super::{AppConfig, RawConfig};
use crate::error::{KeeperError, Result};

/// Files larger than this are not considered config files
pub const MAX_CONFIG_SIZE: u64 = 65535;

const CONFIG_NAME: &str = "echo-jabber-bot.json";

/// Locations searched for a config file, in order
pub fn candidate_locations() -> Vec<PathBuf> {
    let mut locations = Vec::new();

    if let Some(home) = dirs::home_dir() {
        locations.push(home.join(format!(".{}", CONFIG_NAME)));
        locations.push(home.join(CONFIG_NAME));
    }

    locations.push(PathBuf::from("/etc").join(CONFIG_NAME));

    match std::env::current_exe() {
        Ok(exe) => {
            if let Some(dir) = exe.parent() {
                locations.push(dir.join("data").join("config.json"));
            }
        }
        Err(e) => {
            tracing::error!("Unable to get current executable path: {}", e);
        }
    }

    locations
}

/// Load the config from `explicit`, or from the first usable candidate location
///
/// Candidates that are missing are skipped silently; oversized, unreadable or
/// unparsable ones are skipped with a warning. A file that parses but lacks
/// required settings is fatal.
pub fn load(explicit: Option<&Path>) -> Result<AppConfig> {
    if let Some(path) = explicit {
        let config = load_from_path(path)?;
        tracing::info!("Using {} as config file", path.display());
        return Ok(config);
    }

    for location in candidate_locations() {
        if !location.exists() {
            continue;
        }

        let raw = match read_raw(&location) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Skip config file {}: {}", location.display(), e);
                continue;
            }
        };

        let config = raw.resolve()?;
        tracing::info!("Using {} as config file", location.display());
        return Ok(config);
    }

    Err(KeeperError::Config(
        "Config was not loaded! Refusing to start.".to_string(),
    ))
}

/// Read, size-check and parse a single config file
pub fn load_from_path(path: &Path) -> Result<AppConfig> {
    read_raw(path)?.resolve()
}

/// Parse config file contents, applying defaults
pub fn parse_str(contents: &str) -> Result<AppConfig> {
    parse_raw(contents)?.resolve()
}

fn read_raw(path: &Path) -> Result<RawConfig> {
    let metadata = std::fs::metadata(path)?;
    if metadata.len() > MAX_CONFIG_SIZE {
        return Err(KeeperError::Config(format!(
            "Config file {} is too long for config",
            path.display()
        )));
    }

    let contents = std::fs::read_to_string(path)?;
    parse_raw(&contents)
}

fn parse_raw(contents: &str) -> Result<RawConfig> {
    Ok(deser_hjson::from_str(contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const SAMPLE: &str = r#"{
        // bot account
        "jabber": {
            "server": "example.org",
            "ssl": true,
            "starttls": true,
            "nick": "echo",
            "password": "s3cr3t // not a comment",
            "channels": [
                "room@conference.example.org",
                "chat@rooms.example",
            ],
            "server_ping_delay": 30,
        },
        "loglevel": "debug",
    }"#;

    #[test]
    fn test_parse_relaxed_json() {
        let config = parse_str(SAMPLE).unwrap();
        assert_eq!(config.jabber.server, "example.org");
        assert_eq!(config.jabber.rooms.len(), 2);
        assert_eq!(config.jabber.password.as_deref(), Some("s3cr3t // not a comment"));
        assert_eq!(config.jabber.server_ping_delay, Duration::from_secs(30));
        assert_eq!(config.jabber.reconnect_delay, Duration::from_secs(3));
        assert_eq!(config.loglevel, "debug");
    }

    #[test]
    fn test_parse_hand_written_hjson() {
        let config = parse_str(
            "{
                # bot account
                jabber: {
                    server: example.org
                    nick: echo
                    /* rooms to keep */
                    channels: [
                        room@conference.example.org
                    ]
                    server_ping_delay: 30
                }
                loglevel: debug
            }",
        )
        .unwrap();
        assert_eq!(config.jabber.server, "example.org");
        assert_eq!(config.jabber.nick, "echo");
        assert_eq!(
            config.jabber.rooms,
            vec!["room@conference.example.org".parse::<crate::PeerId>().unwrap()]
        );
        assert_eq!(config.jabber.server_ping_delay, Duration::from_secs(30));
        assert_eq!(config.loglevel, "debug");
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(parse_str("{ not json"), Err(KeeperError::Hjson(_))));
    }

    #[test]
    fn test_load_from_path_rejects_oversized_file() {
        let dir = std::env::temp_dir().join(format!("jabber-keeper-{}", crate::SessionId::generate()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("big.json");

        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(&vec![b' '; (MAX_CONFIG_SIZE + 1) as usize]).unwrap();
        drop(file);

        match load_from_path(&path) {
            Err(KeeperError::Config(msg)) => assert!(msg.contains("too long")),
            other => panic!("Expected Config error, got {:?}", other),
        }

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_load_explicit_path() {
        let dir = std::env::temp_dir().join(format!("jabber-keeper-{}", crate::SessionId::generate()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.json");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.jabber.nick, "echo");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_candidate_locations_order() {
        let locations = candidate_locations();
        let etc = locations
            .iter()
            .position(|p| p == Path::new("/etc/echo-jabber-bot.json"))
            .unwrap();
        let data = locations
            .iter()
            .position(|p| p.ends_with("data/config.json"))
            .unwrap();
        assert!(etc < data);
    }
}
