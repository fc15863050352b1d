use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// How an explicit voice tag is recognised at the start of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoiceExtractionMode {
    /// `[voice] text`
    #[default]
    Bracket,
    /// `voice text`, only when the first word names a known voice
    FirstWord,
}

impl FromStr for VoiceExtractionMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bracket" => Ok(Self::Bracket),
            "firstword" | "first_word" | "first-word" => Ok(Self::FirstWord),
            other => Err(anyhow::anyhow!(
                "invalid voice extraction mode '{other}' (expected 'bracket' or 'firstword')"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceInfo {
    pub name: String,
    pub display_name: Option<String>,
    pub language: Option<String>,
}

impl VoiceInfo {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            display_name: None,
            language: None,
        }
    }
}

/// Voices the synthesis backend knows, looked up case-insensitively.
#[derive(Debug, Clone, Default)]
pub struct VoiceCatalog {
    // lowercase name -> info with canonical casing
    voices: HashMap<String, VoiceInfo>,
}

impl VoiceCatalog {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::from_infos(names.into_iter().map(VoiceInfo::named))
    }

    pub fn from_infos<I>(infos: I) -> Self
    where
        I: IntoIterator<Item = VoiceInfo>,
    {
        let voices = infos
            .into_iter()
            .filter(|v| !v.name.trim().is_empty())
            .map(|v| (v.name.to_lowercase(), v))
            .collect();
        Self { voices }
    }

    /// Load from a voice map file.
    ///
    /// Accepts either a JSON array of names, or an object keyed by voice
    /// name whose values are `null`, a display-name string, or an object
    /// with optional `display_name` and `language`.
    pub fn from_mapfile<P: AsRef<Path>>(p: P) -> anyhow::Result<Self> {
        let text = fs::read_to_string(p.as_ref())
            .with_context(|| format!("Failed to load {}", p.as_ref().display()))?;
        Self::from_json_str(&text)
    }

    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let json: serde_json::Value =
            serde_json::from_str(text).with_context(|| "voice map is not valid JSON")?;

        match json {
            serde_json::Value::Array(items) => {
                let mut names = Vec::with_capacity(items.len());
                for item in items {
                    let name = item
                        .as_str()
                        .ok_or_else(|| anyhow::anyhow!("voice list entries must be strings"))?;
                    names.push(name.to_string());
                }
                Ok(Self::new(names))
            }
            serde_json::Value::Object(obj) => {
                let mut infos = Vec::with_capacity(obj.len());
                for (name, v) in obj {
                    let info = match v {
                        serde_json::Value::Null => VoiceInfo::named(name),
                        serde_json::Value::String(display) => VoiceInfo {
                            name,
                            display_name: Some(display),
                            language: None,
                        },
                        serde_json::Value::Object(o) => VoiceInfo {
                            display_name: o
                                .get("display_name")
                                .and_then(|x| x.as_str())
                                .map(|s| s.to_string()),
                            language: o
                                .get("language")
                                .and_then(|x| x.as_str())
                                .map(|s| s.to_string()),
                            name,
                        },
                        _ => {
                            return Err(anyhow::anyhow!(
                                "invalid entry for voice {} (expected null, string or object)",
                                name
                            ));
                        }
                    };
                    infos.push(info);
                }
                Ok(Self::from_infos(infos))
            }
            _ => Err(anyhow::anyhow!("voice map must be a JSON array or object")),
        }
    }

    /// Canonical name of a voice, if known.
    pub fn resolve(&self, name: &str) -> Option<&str> {
        self.voices
            .get(&name.trim().to_lowercase())
            .map(|v| v.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resolve(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&VoiceInfo> {
        self.voices.get(&name.trim().to_lowercase())
    }

    /// Sorted canonical names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.voices.values().map(|v| v.name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}

/// Split an explicit voice tag off the front of `text`.
///
/// Returns the tag (as written, not yet validated in bracket mode) and the
/// remaining text to speak.
pub fn extract_voice<'a>(
    text: &'a str,
    mode: VoiceExtractionMode,
    catalog: &VoiceCatalog,
) -> (Option<&'a str>, &'a str) {
    let trimmed = text.trim();
    match mode {
        VoiceExtractionMode::Bracket => {
            if let Some(inner) = trimmed.strip_prefix('[') {
                if let Some(end) = inner.find(']') {
                    let name = inner[..end].trim();
                    let rest = inner[end + 1..].trim();
                    if name.is_empty() {
                        return (None, rest);
                    }
                    return (Some(name), rest);
                }
            }
            (None, trimmed)
        }
        VoiceExtractionMode::FirstWord => {
            let (first, rest) = trimmed
                .split_once(char::is_whitespace)
                .unwrap_or((trimmed, ""));
            let candidate = first.trim_end_matches([':', ',']);
            if !candidate.is_empty() && catalog.contains(candidate) {
                (Some(candidate), rest.trim())
            } else {
                (None, trimmed)
            }
        }
    }
}
