//! Preferences store (specification §4.11, key set in §6.2).
//!
//! The teacher persists backup layouts with `serde` + `serde_yaml`
//! (`domain/backup.rs::BackupData`); this module applies the same pairing
//! to the specification's flat preferences key set, loaded from
//! `$XDG_CONFIG_HOME/elektroid/preferences.yaml` via `dirs` and
//! overridable per-key through `ELEKTROID_<KEY>` environment variables.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Preferences {
    pub autoplay: bool,
    pub mix: bool,
    pub show_remote: bool,
    pub local_dir: String,
    pub remote_dir: String,
    pub show_grid: bool,
    pub grid_length: u32,
    pub play_while_loading: bool,
    pub audio_buffer_len: u32,
    pub audio_use_float: bool,
    pub stop_device_when_connecting: bool,
    pub elektron_load_sound_tags: bool,
    pub show_playback_cursor: bool,
    pub tag_vocabulary_1: String,
    pub tag_vocabulary_2: String,
    pub tag_vocabulary_3: String,
    pub tag_vocabulary_4: String,
    pub tag_vocabulary_5: String,
}

impl Default for Preferences {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_default().to_string_lossy().into_owned();
        Self {
            autoplay: true,
            mix: false,
            show_remote: true,
            local_dir: home.clone(),
            remote_dir: home,
            show_grid: false,
            grid_length: 16,
            play_while_loading: true,
            audio_buffer_len: 256,
            audio_use_float: cfg!(target_os = "macos"),
            stop_device_when_connecting: true,
            elektron_load_sound_tags: false,
            show_playback_cursor: false,
            tag_vocabulary_1: String::new(),
            tag_vocabulary_2: String::new(),
            tag_vocabulary_3: String::new(),
            tag_vocabulary_4: String::new(),
            tag_vocabulary_5: String::new(),
        }
    }
}

impl Preferences {
    /// Default path: `$XDG_CONFIG_HOME/elektroid/preferences.yaml`, falling
    /// back to `~/.config` through `dirs::config_dir`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("elektroid").join("preferences.yaml"))
    }

    pub fn load(path: &Path) -> Self {
        let mut prefs = match std::fs::read_to_string(path) {
            Ok(text) => match serde_yaml::from_str(&text) {
                Ok(prefs) => prefs,
                Err(err) => {
                    warn!(%err, ?path, "malformed preferences file, using defaults");
                    Self::default()
                }
            },
            Err(_) => Self::default(),
        };
        prefs.apply_env_overrides();
        prefs
    }

    pub fn save(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let yaml = serde_yaml::to_string(self).expect("Preferences always serialises");
        std::fs::write(path, yaml)?;
        debug!(?path, "saved preferences");
        Ok(())
    }

    /// Applies `ELEKTROID_<UPPER_SNAKE_KEY>` environment overrides for
    /// scripting/tests (specification §4.11).
    fn apply_env_overrides(&mut self) {
        macro_rules! override_bool {
            ($field:ident, $key:literal) => {
                if let Some(value) = env_bool($key) {
                    self.$field = value;
                }
            };
        }
        macro_rules! override_string {
            ($field:ident, $key:literal) => {
                if let Ok(value) = std::env::var(concat!("ELEKTROID_", $key)) {
                    self.$field = value;
                }
            };
        }
        macro_rules! override_u32 {
            ($field:ident, $key:literal) => {
                if let Ok(value) = std::env::var(concat!("ELEKTROID_", $key)) {
                    if let Ok(value) = value.parse() {
                        self.$field = value;
                    }
                }
            };
        }

        override_bool!(autoplay, "AUTOPLAY");
        override_bool!(mix, "MIX");
        override_bool!(show_remote, "SHOW_REMOTE");
        override_string!(local_dir, "LOCAL_DIR");
        override_string!(remote_dir, "REMOTE_DIR");
        override_bool!(show_grid, "SHOW_GRID");
        override_u32!(grid_length, "GRID_LENGTH");
        override_bool!(play_while_loading, "PLAY_WHILE_LOADING");
        override_u32!(audio_buffer_len, "AUDIO_BUFFER_LEN");
        override_bool!(audio_use_float, "AUDIO_USE_FLOAT");
        override_bool!(stop_device_when_connecting, "STOP_DEVICE_WHEN_CONNECTING");
        override_bool!(elektron_load_sound_tags, "ELEKTRON_LOAD_SOUND_TAGS");
        override_bool!(show_playback_cursor, "SHOW_PLAYBACK_CURSOR");

        self.grid_length = self.grid_length.clamp(2, 64);
        self.audio_buffer_len = self.audio_buffer_len.clamp(256, 4096);
    }
}

fn env_bool(key: &str) -> Option<bool> {
    let raw = std::env::var(format!("ELEKTROID_{key}")).ok()?;
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_match_documented_values() {
        let prefs = Preferences::default();
        assert!(prefs.autoplay);
        assert!(!prefs.mix);
        assert_eq!(prefs.grid_length, 16);
        assert_eq!(prefs.audio_buffer_len, 256);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.yaml");
        let prefs = Preferences::load(&path);
        assert_eq!(prefs, Preferences::default());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("preferences.yaml");
        let mut prefs = Preferences::default();
        prefs.grid_length = 32;
        prefs.save(&path).unwrap();
        let reloaded = Preferences::load(&path);
        assert_eq!(reloaded.grid_length, 32);
    }

    #[test]
    fn env_override_takes_precedence_and_clamps() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("ELEKTROID_GRID_LENGTH", "9999");
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences::load(&dir.path().join("preferences.yaml"));
        assert_eq!(prefs.grid_length, 64);
        std::env::remove_var("ELEKTROID_GRID_LENGTH");
    }
}
