// Runtime configuration for the relay

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use cache_core::CacheConfig;
use queue_core::{is_valid_language_code, QueueConfig, SynthesisParams, VoiceCatalog, VoiceExtractionMode};
use tracing::warn;
use tts_core::{OrchestratorConfig, PlaybackConfig};

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub cache_max_mb: u64,
    pub cache_index_debounce_ms: u64,
    pub default_voice: String,
    pub voice_extraction_mode: VoiceExtractionMode,
    pub require_voice_prefix: bool,
    pub global_volume: f32,
    pub voice_volumes: HashMap<String, f32>,
    pub max_batch_size: usize,
    pub max_batch_text_length: usize,
    pub playback_delay_ms: u64,
    pub waiting_for_cache_timeout_secs: u64,
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
    pub params: SynthesisParams,
    /// Comma-separated voice names, or a path to a voice map JSON file
    pub voices: Option<String>,
    /// Only redemptions of this reward are spoken when set
    pub reward_id: Option<String>,
    pub player_command: Option<String>,
    pub shutdown_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub cors_allowed_origins: Option<Vec<String>>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: 8085,
            cache_dir: PathBuf::from("cache/audio"),
            cache_max_mb: 500,
            cache_index_debounce_ms: 2000,
            default_voice: "default".to_string(),
            voice_extraction_mode: VoiceExtractionMode::Bracket,
            require_voice_prefix: false,
            global_volume: 1.0,
            voice_volumes: HashMap::new(),
            max_batch_size: 4,
            max_batch_text_length: 600,
            playback_delay_ms: 500,
            waiting_for_cache_timeout_secs: 120,
            backend_url: None,
            api_key: None,
            params: SynthesisParams::default(),
            voices: None,
            reward_id: None,
            player_command: None,
            shutdown_timeout_secs: 5,
            request_timeout_secs: 30,
            cors_allowed_origins: None,
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Missing or unparsable values keep
    /// their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let text = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut params = d.params.clone();
        params.model = text("TTS_MODEL").unwrap_or(params.model);
        params.quantization = text("TTS_QUANTIZATION").unwrap_or(params.quantization);
        params.do_sample = parse_or(text("TTS_DO_SAMPLE"), params.do_sample);
        params.speed = parse_or(text("TTS_SPEED"), params.speed);
        params.temperature = parse_or(text("TTS_TEMPERATURE"), params.temperature);
        params.max_tokens = parse_or(text("TTS_MAX_TOKENS"), params.max_tokens);
        params.repetition_penalty =
            parse_or(text("TTS_REPETITION_PENALTY"), params.repetition_penalty);
        if let Some(language) = text("TTS_LANGUAGE") {
            if is_valid_language_code(&language) {
                params.language = language;
            } else {
                warn!("Ignoring invalid TTS_LANGUAGE '{}'; expected ll or ll_CC", language);
            }
        }

        let voice_extraction_mode = match text("VOICE_EXTRACTION_MODE") {
            Some(mode) => mode.parse().unwrap_or_else(|e| {
                warn!("{e}; using bracket mode");
                d.voice_extraction_mode
            }),
            None => d.voice_extraction_mode,
        };

        let cors_allowed_origins = text("CORS_ALLOWED_ORIGINS").map(|origins| {
            origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        });

        Self {
            port: parse_or(text("PORT"), d.port),
            cache_dir: text("CACHE_DIR").map(PathBuf::from).unwrap_or(d.cache_dir),
            cache_max_mb: parse_or(text("CACHE_MAX_MB"), d.cache_max_mb),
            cache_index_debounce_ms: parse_or(text("CACHE_INDEX_DEBOUNCE_MS"), d.cache_index_debounce_ms),
            default_voice: text("DEFAULT_VOICE").unwrap_or(d.default_voice),
            voice_extraction_mode,
            require_voice_prefix: parse_or(text("REQUIRE_VOICE_PREFIX"), d.require_voice_prefix),
            global_volume: parse_or(text("GLOBAL_VOLUME"), d.global_volume).clamp(0.0, 1.0),
            voice_volumes: text("VOICE_VOLUMES")
                .map(|v| parse_voice_volumes(&v))
                .unwrap_or(d.voice_volumes),
            max_batch_size: parse_or(text("MAX_BATCH_SIZE"), d.max_batch_size).max(1),
            max_batch_text_length: parse_or(text("MAX_BATCH_TEXT_LENGTH"), d.max_batch_text_length),
            playback_delay_ms: parse_or(text("PLAYBACK_DELAY_MS"), d.playback_delay_ms),
            waiting_for_cache_timeout_secs: parse_or(
                text("WAITING_FOR_CACHE_TIMEOUT_SECS"),
                d.waiting_for_cache_timeout_secs,
            ),
            backend_url: text("TTS_BACKEND_URL").map(|u| u.trim_end_matches('/').to_string()),
            api_key: text("TTS_API_KEY"),
            params,
            voices: text("TTS_VOICES"),
            reward_id: text("REWARD_ID"),
            player_command: text("PLAYER_COMMAND"),
            shutdown_timeout_secs: parse_or(text("SHUTDOWN_TIMEOUT_SECS"), d.shutdown_timeout_secs),
            request_timeout_secs: parse_or(text("REQUEST_TIMEOUT_SECS"), d.request_timeout_secs),
            cors_allowed_origins,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new(&self.cache_dir)
            .with_max_size_mb(self.cache_max_mb)
            .with_index_debounce(Duration::from_millis(self.cache_index_debounce_ms))
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            default_voice: self.default_voice.clone(),
            extraction_mode: self.voice_extraction_mode,
            params: self.params.clone(),
            ..QueueConfig::default()
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_batch_size: self.max_batch_size,
            max_batch_text_length: self.max_batch_text_length,
            waiting_for_cache_timeout: Duration::from_secs(self.waiting_for_cache_timeout_secs),
            ..OrchestratorConfig::default()
        }
    }

    pub fn playback_config(&self) -> PlaybackConfig {
        PlaybackConfig {
            global_volume: self.global_volume,
            voice_volumes: self.voice_volumes.clone(),
            inter_message_delay: Duration::from_millis(self.playback_delay_ms),
            ..PlaybackConfig::default()
        }
    }

    /// Voice catalog from `TTS_VOICES`, if configured.
    pub fn voice_catalog(&self) -> anyhow::Result<Option<VoiceCatalog>> {
        let Some(voices) = self.voices.as_deref() else {
            return Ok(None);
        };
        if voices.ends_with(".json") || Path::new(voices).is_file() {
            return VoiceCatalog::from_mapfile(voices).map(Some);
        }
        Ok(Some(VoiceCatalog::new(
            voices.split(',').map(str::trim).filter(|v| !v.is_empty()),
        )))
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// Parse `name=0.8,other=0.5`; malformed pairs are skipped.
pub fn parse_voice_volumes(value: &str) -> HashMap<String, f32> {
    let mut volumes = HashMap::new();
    for pair in value.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let parsed = pair
            .split_once('=')
            .and_then(|(name, vol)| Some((name.trim(), vol.trim().parse::<f32>().ok()?)));
        match parsed {
            Some((name, vol)) if !name.is_empty() => {
                volumes.insert(name.to_lowercase(), vol.clamp(0.0, 1.0));
            }
            _ => warn!("Ignoring malformed voice volume '{}'", pair),
        }
    }
    volumes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = RelayConfig::from_lookup(|_| None);
        assert_eq!(config.port, 8085);
        assert_eq!(config.cache_max_mb, 500);
        assert_eq!(config.max_batch_size, 4);
        assert_eq!(config.playback_delay_ms, 500);
        assert_eq!(config.waiting_for_cache_timeout_secs, 120);
        assert_eq!(config.voice_extraction_mode, VoiceExtractionMode::Bracket);
        assert!(config.backend_url.is_none());
    }

    #[test]
    fn test_reads_values() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("PORT", "9000"),
            ("CACHE_MAX_MB", "64"),
            ("DEFAULT_VOICE", "narrator"),
            ("VOICE_EXTRACTION_MODE", "firstword"),
            ("REQUIRE_VOICE_PREFIX", "true"),
            ("TTS_BACKEND_URL", "http://localhost:9001/"),
            ("TTS_SPEED", "1.25"),
            ("TTS_LANGUAGE", "en_US"),
            ("CORS_ALLOWED_ORIGINS", "http://a.test, http://b.test"),
        ]));
        assert_eq!(config.port, 9000);
        assert_eq!(config.cache_max_mb, 64);
        assert_eq!(config.default_voice, "narrator");
        assert_eq!(config.voice_extraction_mode, VoiceExtractionMode::FirstWord);
        assert!(config.require_voice_prefix);
        assert_eq!(config.backend_url.as_deref(), Some("http://localhost:9001"));
        assert_eq!(config.params.speed, 1.25);
        assert_eq!(config.params.language, "en_US");
        assert_eq!(
            config.cors_allowed_origins,
            Some(vec!["http://a.test".to_string(), "http://b.test".to_string()])
        );
    }

    #[test]
    fn test_bad_values_fall_back() {
        let config = RelayConfig::from_lookup(lookup(&[
            ("PORT", "not-a-port"),
            ("VOICE_EXTRACTION_MODE", "sideways"),
            ("TTS_LANGUAGE", "english"),
            ("GLOBAL_VOLUME", "3"),
            ("MAX_BATCH_SIZE", "0"),
        ]));
        assert_eq!(config.port, 8085);
        assert_eq!(config.voice_extraction_mode, VoiceExtractionMode::Bracket);
        assert_eq!(config.params.language, "");
        assert_eq!(config.global_volume, 1.0);
        assert_eq!(config.max_batch_size, 1);
    }

    #[test]
    fn test_parse_voice_volumes() {
        let volumes = parse_voice_volumes("Alice=0.8, bob = 0.5, broken, =1, carol=x");
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes["alice"], 0.8);
        assert_eq!(volumes["bob"], 0.5);
    }

    #[test]
    fn test_voice_catalog_from_list_and_file() {
        let config = RelayConfig {
            voices: Some("alice, bob".to_string()),
            ..RelayConfig::default()
        };
        let catalog = config.voice_catalog().unwrap().unwrap();
        assert!(catalog.contains("Bob"));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("voices.json");
        std::fs::write(&path, r#"{"narrator": {"language": "en_US"}}"#).unwrap();
        let config = RelayConfig {
            voices: Some(path.display().to_string()),
            ..RelayConfig::default()
        };
        assert!(config.voice_catalog().unwrap().unwrap().contains("narrator"));

        assert!(RelayConfig::default().voice_catalog().unwrap().is_none());
    }

    #[test]
    fn test_component_configs() {
        let config = RelayConfig {
            max_batch_size: 2,
            playback_delay_ms: 0,
            global_volume: 0.5,
            ..RelayConfig::default()
        };
        assert_eq!(config.orchestrator_config().max_batch_size, 2);
        assert_eq!(config.playback_config().inter_message_delay, Duration::ZERO);
        assert_eq!(config.playback_config().volume_for("any"), 0.5);
        assert_eq!(config.cache_config().max_size_bytes, 500 * 1024 * 1024);
    }
}
