//! Advertised voice catalog
//!
//! The catalog file lists, per provider, the voices and languages to
//! expose. Every (voice, language) pair becomes one advertised voice whose
//! name encodes both the language and the provider, so the registry can
//! route requests by name alone.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::Provider;
use crate::{Error, Result};

/// Catalog shipped with the binary
const BUILTIN_CATALOG: &str = include_str!("voices.json");

#[derive(Debug, Deserialize)]
struct ProviderEntry {
    #[serde(default)]
    voices: Vec<String>,
    #[serde(default)]
    languages: Vec<String>,
}

/// One advertised voice
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogVoice {
    /// Routable voice name, e.g. `en-US-Chirp3-HD-Charon`
    pub name: String,
    /// Short description, e.g. `google_Charon`
    pub description: String,
    /// Provider serving the voice
    pub provider: Provider,
    /// Catalog language tag, e.g. `en_US`
    pub language: String,
}

impl CatalogVoice {
    /// Attribution name and URL for the voice's provider
    #[must_use]
    pub const fn attribution(&self) -> (&'static str, &'static str) {
        match self.provider {
            Provider::Google => (
                "Google",
                "https://cloud.google.com/text-to-speech/docs/chirp3-hd",
            ),
            Provider::OpenAi => (
                "OpenAI",
                "https://platform.openai.com/docs/guides/text-to-speech",
            ),
        }
    }
}

/// Sorted list of advertised voices
#[derive(Debug, Clone, Default)]
pub struct VoiceCatalog {
    voices: Vec<CatalogVoice>,
}

impl VoiceCatalog {
    /// Parse a catalog from JSON
    ///
    /// # Errors
    ///
    /// Returns error if the JSON does not match the catalog schema
    pub fn from_json(json: &str) -> Result<Self> {
        let entries: BTreeMap<String, ProviderEntry> = serde_json::from_str(json)?;
        let mut voices = Vec::new();

        for (key, entry) in entries {
            let Some(provider) = Provider::from_key(&key) else {
                tracing::warn!(provider = %key, "skipping unknown provider in voice catalog");
                continue;
            };

            for voice in &entry.voices {
                for language in &entry.languages {
                    let lang = language.replacen('_', "-", 1);
                    let name = match provider {
                        Provider::Google => format!("{lang}-Chirp3-HD-{voice}"),
                        Provider::OpenAi => format!("{lang}-openai-{voice}"),
                    };
                    voices.push(CatalogVoice {
                        name,
                        description: format!("{key}_{voice}"),
                        provider,
                        language: language.clone(),
                    });
                }
            }
        }

        voices.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { voices })
    }

    /// Catalog embedded in the binary
    ///
    /// # Errors
    ///
    /// Returns error only if the embedded catalog is malformed
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_CATALOG)
    }

    /// Load a catalog file, or the built-in catalog when `path` is `None`
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Self::builtin();
        };

        let json = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read voice catalog {}: {e}", path.display()))
        })?;
        let catalog = Self::from_json(&json)?;
        tracing::info!(path = %path.display(), voices = catalog.len(), "loaded voice catalog");
        Ok(catalog)
    }

    /// Advertised voices, sorted by name
    #[must_use]
    pub fn voices(&self) -> &[CatalogVoice] {
        &self.voices
    }

    /// Keep only voices whose provider satisfies `keep`
    #[must_use]
    pub fn retain_providers(mut self, keep: impl Fn(Provider) -> bool) -> Self {
        self.voices.retain(|v| keep(v.provider));
        self
    }

    /// Number of advertised voices
    #[must_use]
    pub fn len(&self) -> usize {
        self.voices.len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }
}
