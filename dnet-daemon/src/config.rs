//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use dnet_core::{Combatant, Encounter, EncounterError, PeerRole};
use serde::Deserialize;

/// Daemon configuration. File: ~/.config/dungeonnet/config.toml or /etc/dungeonnet/config.toml.
/// Env overrides: DUNGEONNET_NAME, DUNGEONNET_DISCOVERY_PORT, DUNGEONNET_TRANSPORT_PORT,
/// DUNGEONNET_LOG_LEVEL.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Advertised name; the host name is appended. Defaults by role.
    #[serde(default)]
    pub name: Option<String>,
    /// Discovery UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// TCP port for incoming connections (default 0, any free port).
    #[serde(default)]
    pub transport_port: u16,
    /// Bound on connecting and on the handshake exchange (default 5).
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,
    /// Filter used when RUST_LOG is unset (default "info").
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Encounter the Primary starts with.
    #[serde(default)]
    pub encounter: Option<EncounterConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncounterConfig {
    pub title: String,
    #[serde(default)]
    pub round: u8,
    #[serde(default)]
    pub combatants: Vec<CombatantConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CombatantConfig {
    pub name: String,
    #[serde(default)]
    pub initiative: Option<i8>,
    #[serde(default = "default_alive")]
    pub alive: bool,
}

fn default_discovery_port() -> u16 {
    45680
}
fn default_handshake_timeout_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_alive() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            discovery_port: default_discovery_port(),
            transport_port: 0,
            handshake_timeout_secs: default_handshake_timeout_secs(),
            log_level: default_log_level(),
            encounter: None,
        }
    }
}

impl Config {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs.max(1))
    }

    /// Service name advertised for `role`: "<name> (<host>)".
    pub fn service_name(&self, role: PeerRole) -> String {
        let name = self.name.as_deref().unwrap_or(match role {
            PeerRole::Primary => "Dungeon Master",
            PeerRole::Secondary => "Initiative Order",
        });
        format!("{} ({})", name, host_name())
    }

    /// The configured encounter, or an empty one.
    pub fn build_encounter(&self) -> Result<Encounter, EncounterError> {
        match &self.encounter {
            Some(e) => Encounter::new(
                e.title.clone(),
                e.round,
                e.combatants
                    .iter()
                    .map(|c| Combatant {
                        name: c.name.clone(),
                        initiative: c.initiative,
                        is_current_turn: false,
                        is_alive: c.alive,
                    })
                    .collect(),
            ),
            None => Encounter::new("Encounter", 0, Vec::new()),
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("DUNGEONNET_NAME") {
            self.name = Some(s);
        }
        if let Some(p) = var("DUNGEONNET_DISCOVERY_PORT").and_then(|s| s.parse().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("DUNGEONNET_TRANSPORT_PORT").and_then(|s| s.parse().ok()) {
            self.transport_port = p;
        }
        if let Some(s) = var("DUNGEONNET_LOG_LEVEL") {
            self.log_level = s;
        }
    }
}

/// Load config: `explicit` path if given, else the first existing default file, else
/// defaults; then env vars.
pub fn load(explicit: Option<&Path>) -> anyhow::Result<Config> {
    let path = match explicit {
        Some(p) => Some(p.to_path_buf()),
        None => config_paths().into_iter().find(|p| p.exists()),
    };
    let mut c = match path {
        Some(p) => load_file(&p)?,
        None => Config::default(),
    };
    c.apply_env(|key| std::env::var(key).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/dungeonnet/config.toml"));
    }
    out.push(PathBuf::from("/etc/dungeonnet/config.toml"));
    out
}

fn load_file(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&s).with_context(|| format!("parsing config {}", path.display()))
}

fn host_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn empty_file_gives_defaults() {
        let c: Config = toml::from_str("").unwrap();
        assert_eq!(c, Config::default());
        assert_eq!(c.handshake_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn unknown_field_rejected() {
        assert!(toml::from_str::<Config>("proxy_port = 3128").is_err());
        assert!(toml::from_str::<Config>("[encounter]\ntitle = \"x\"\nmonsters = []").is_err());
    }

    #[test]
    fn encounter_table_builds_sorted_encounter() {
        let c: Config = toml::from_str(
            r#"
            name = "Basement"
            [encounter]
            title = "Goblin Ambush"
            round = 2
            combatants = [
                { name = "Sam" },
                { name = "Goblin", initiative = 12 },
                { name = "Wolf", initiative = 15, alive = false },
            ]
            "#,
        )
        .unwrap();
        let e = c.build_encounter().unwrap();
        assert_eq!(e.title(), "Goblin Ambush");
        assert_eq!(e.round(), 2);
        let names: Vec<_> = e.combatants().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["Wolf", "Goblin", "Sam"]);
        assert!(!e.combatants()[0].is_alive);
    }

    #[test]
    fn env_overrides_file() {
        let mut c = Config::default();
        let env: HashMap<&str, &str> = [
            ("DUNGEONNET_NAME", "Table Two"),
            ("DUNGEONNET_DISCOVERY_PORT", "5000"),
            ("DUNGEONNET_TRANSPORT_PORT", "not a port"),
        ]
        .into_iter()
        .collect();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.name.as_deref(), Some("Table Two"));
        assert_eq!(c.discovery_port, 5000);
        assert_eq!(c.transport_port, 0);
    }

    #[test]
    fn service_name_defaults_by_role() {
        let c = Config::default();
        assert!(c.service_name(PeerRole::Primary).starts_with("Dungeon Master ("));
        assert!(c.service_name(PeerRole::Secondary).starts_with("Initiative Order ("));
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        assert!(load(Some(Path::new("/nonexistent/dungeonnet.toml"))).is_err());
    }
}
