//! Provider registry: typed name → provider lookup with hot reload
//!
//! Read-mostly maps under one RwLock. `reload` diffs the desired set from
//! config against what is registered: new entries are instantiated, changed
//! ones replaced, missing ones dropped. Unchanged entries keep their `Arc`
//! identity so in-flight workers hold on to the same provider instance.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    ElevenLabsTtsProvider, LlmProvider, MistralOcrProvider, OcrProvider, OpenAiChatProvider, OpenAiTtsProvider,
    ProviderError, ProviderSettings, ProviderStyle, TtsProvider, VisionOcrProvider,
};

/// Desired provider set, one list per kind
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub llm: Vec<ProviderSettings>,
    pub ocr: Vec<ProviderSettings>,
    pub tts: Vec<ProviderSettings>,
}

struct Entry<P: ?Sized> {
    provider: Arc<P>,
    /// Serialized settings; a changed fingerprint forces re-instantiation
    fingerprint: String,
}

impl<P: ?Sized> Entry<P> {
    fn manual(provider: Arc<P>) -> Self {
        Self {
            provider,
            fingerprint: String::new(),
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    llm: HashMap<String, Entry<dyn LlmProvider>>,
    ocr: HashMap<String, Entry<dyn OcrProvider>>,
    tts: HashMap<String, Entry<dyn TtsProvider>>,
}

/// Typed lookup of LLM, OCR, and TTS providers by name
#[derive(Default)]
pub struct ProviderRegistry {
    inner: RwLock<RegistryInner>,
}

fn fingerprint(settings: &ProviderSettings) -> String {
    serde_json::to_string(settings).unwrap_or_default()
}

macro_rules! kind_accessors {
    ($field:ident, $register:ident, $unregister:ident, $get:ident, $list:ident, $has:ident, $trait:ident) => {
        pub fn $register(&self, name: impl Into<String>, provider: Arc<dyn $trait>) {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            inner.$field.insert(name.into(), Entry::manual(provider));
        }

        pub fn $unregister(&self, name: &str) -> bool {
            let mut inner = self.inner.write().expect("registry lock poisoned");
            inner.$field.remove(name).is_some()
        }

        pub fn $get(&self, name: &str) -> Result<Arc<dyn $trait>, ProviderError> {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner
                .$field
                .get(name)
                .map(|entry| entry.provider.clone())
                .ok_or_else(|| ProviderError::NotFound(name.to_string()))
        }

        pub fn $list(&self) -> Vec<String> {
            let inner = self.inner.read().expect("registry lock poisoned");
            let mut names: Vec<String> = inner.$field.keys().cloned().collect();
            names.sort();
            names
        }

        pub fn $has(&self, name: &str) -> bool {
            let inner = self.inner.read().expect("registry lock poisoned");
            inner.$field.contains_key(name)
        }
    };
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    kind_accessors!(llm, register_llm, unregister_llm, get_llm, list_llm, has_llm, LlmProvider);
    kind_accessors!(ocr, register_ocr, unregister_ocr, get_ocr, list_ocr, has_ocr, OcrProvider);
    kind_accessors!(tts, register_tts, unregister_tts, get_tts, list_tts, has_tts, TtsProvider);

    /// Build from config (initial load)
    pub fn from_config(config: &ProvidersConfig) -> Result<Self, ProviderError> {
        let registry = Self::new();
        registry.reload(config)?;
        Ok(registry)
    }

    /// Reconcile the registry against a config snapshot. Unchanged entries
    /// keep their instance identity; changed ones are rebuilt; entries
    /// absent from the config are dropped.
    pub fn reload(&self, config: &ProvidersConfig) -> Result<(), ProviderError> {
        // Instantiate outside the lock; swapping in is cheap
        let mut new_llm = Vec::new();
        let mut new_ocr = Vec::new();
        let mut new_tts = Vec::new();

        {
            let inner = self.inner.read().expect("registry lock poisoned");

            for settings in &config.llm {
                let print = fingerprint(settings);
                if inner.llm.get(&settings.name).is_none_or(|e| e.fingerprint != print) {
                    new_llm.push((settings.name.clone(), print, build_llm(settings)?));
                }
            }
            for settings in &config.ocr {
                let print = fingerprint(settings);
                if inner.ocr.get(&settings.name).is_none_or(|e| e.fingerprint != print) {
                    new_ocr.push((settings.name.clone(), print, build_ocr(settings)?));
                }
            }
            for settings in &config.tts {
                let print = fingerprint(settings);
                if inner.tts.get(&settings.name).is_none_or(|e| e.fingerprint != print) {
                    new_tts.push((settings.name.clone(), print, build_tts(settings)?));
                }
            }
        }

        let desired_llm: Vec<&str> = config.llm.iter().map(|s| s.name.as_str()).collect();
        let desired_ocr: Vec<&str> = config.ocr.iter().map(|s| s.name.as_str()).collect();
        let desired_tts: Vec<&str> = config.tts.iter().map(|s| s.name.as_str()).collect();

        let mut inner = self.inner.write().expect("registry lock poisoned");

        inner.llm.retain(|name, _| {
            let keep = desired_llm.contains(&name.as_str());
            if !keep {
                debug!(provider = %name, "Dropping LLM provider no longer in config");
            }
            keep
        });
        inner.ocr.retain(|name, _| desired_ocr.contains(&name.as_str()));
        inner.tts.retain(|name, _| desired_tts.contains(&name.as_str()));

        for (name, print, provider) in new_llm {
            inner.llm.insert(name, Entry { provider, fingerprint: print });
        }
        for (name, print, provider) in new_ocr {
            inner.ocr.insert(name, Entry { provider, fingerprint: print });
        }
        for (name, print, provider) in new_tts {
            inner.tts.insert(name, Entry { provider, fingerprint: print });
        }

        info!(
            llm = inner.llm.len(),
            ocr = inner.ocr.len(),
            tts = inner.tts.len(),
            "Provider registry reloaded"
        );
        Ok(())
    }
}

fn build_llm(settings: &ProviderSettings) -> Result<Arc<dyn LlmProvider>, ProviderError> {
    match settings.style {
        ProviderStyle::Openai => Ok(Arc::new(OpenAiChatProvider::from_settings(settings)?)),
        other => {
            warn!(provider = %settings.name, style = ?other, "Style is not an LLM style");
            Err(ProviderError::InvalidResponse(format!(
                "{}: style {other:?} cannot serve as an LLM provider",
                settings.name
            )))
        }
    }
}

fn build_ocr(settings: &ProviderSettings) -> Result<Arc<dyn OcrProvider>, ProviderError> {
    match settings.style {
        ProviderStyle::MistralOcr => Ok(Arc::new(MistralOcrProvider::from_settings(settings)?)),
        ProviderStyle::VisionOcr => Ok(Arc::new(VisionOcrProvider::from_settings(settings)?)),
        other => Err(ProviderError::InvalidResponse(format!(
            "{}: style {other:?} cannot serve as an OCR provider",
            settings.name
        ))),
    }
}

fn build_tts(settings: &ProviderSettings) -> Result<Arc<dyn TtsProvider>, ProviderError> {
    match settings.style {
        ProviderStyle::Elevenlabs => Ok(Arc::new(ElevenLabsTtsProvider::from_settings(settings)?)),
        ProviderStyle::OpenaiTts => Ok(Arc::new(OpenAiTtsProvider::from_settings(settings)?)),
        other => Err(ProviderError::InvalidResponse(format!(
            "{}: style {other:?} cannot serve as a TTS provider",
            settings.name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockLlm;

    fn llm_settings(name: &str, rps: f64) -> ProviderSettings {
        ProviderSettings {
            name: name.to_string(),
            style: ProviderStyle::Openai,
            base_url: "http://localhost:1234/v1".to_string(),
            api_key_env: Some("SHELF_TEST_REGISTRY_KEY".to_string()),
            model: Some("gpt-4o".to_string()),
            voice: None,
            rps,
            max_concurrency: 2,
            max_retries: 1,
            retry_delay_ms: 1,
            timeout_ms: None,
            schema_transport: None,
            input_price_per_mtok: None,
            output_price_per_mtok: None,
            price_per_page: None,
        }
    }

    fn set_test_key() {
        // set_var is unsafe in edition 2024; tests are single-process
        unsafe { std::env::set_var("SHELF_TEST_REGISTRY_KEY", "test-key") };
    }

    #[test]
    fn test_register_get_unregister() {
        let registry = ProviderRegistry::new();
        registry.register_llm("mock", Arc::new(MockLlm::with_text_replies("mock", vec![])));

        assert!(registry.has_llm("mock"));
        assert!(registry.get_llm("mock").is_ok());
        assert_eq!(registry.list_llm(), vec!["mock".to_string()]);

        assert!(registry.unregister_llm("mock"));
        assert!(matches!(registry.get_llm("mock"), Err(ProviderError::NotFound(_))));
        assert!(!registry.unregister_llm("mock"));
    }

    #[test]
    fn test_reload_adds_and_removes() {
        set_test_key();
        let registry = ProviderRegistry::new();

        let config = ProvidersConfig {
            llm: vec![llm_settings("primary", 2.0), llm_settings("secondary", 1.0)],
            ..Default::default()
        };
        registry.reload(&config).unwrap();
        assert_eq!(registry.list_llm(), vec!["primary".to_string(), "secondary".to_string()]);

        let config = ProvidersConfig {
            llm: vec![llm_settings("primary", 2.0)],
            ..Default::default()
        };
        registry.reload(&config).unwrap();
        assert_eq!(registry.list_llm(), vec!["primary".to_string()]);
    }

    #[test]
    fn test_reload_preserves_unchanged_identity() {
        set_test_key();
        let registry = ProviderRegistry::new();
        let config = ProvidersConfig {
            llm: vec![llm_settings("primary", 2.0)],
            ..Default::default()
        };

        registry.reload(&config).unwrap();
        let before = registry.get_llm("primary").unwrap();

        registry.reload(&config).unwrap();
        let after = registry.get_llm("primary").unwrap();

        assert!(Arc::ptr_eq(&before, &after), "unchanged provider must keep identity");
    }

    #[test]
    fn test_reload_replaces_changed_provider() {
        set_test_key();
        let registry = ProviderRegistry::new();

        registry
            .reload(&ProvidersConfig {
                llm: vec![llm_settings("primary", 2.0)],
                ..Default::default()
            })
            .unwrap();
        let before = registry.get_llm("primary").unwrap();

        // Rate limit change forces a rebuild
        registry
            .reload(&ProvidersConfig {
                llm: vec![llm_settings("primary", 9.0)],
                ..Default::default()
            })
            .unwrap();
        let after = registry.get_llm("primary").unwrap();

        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(after.requests_per_second(), 9.0);
    }

    #[test]
    fn test_wrong_style_for_kind_rejected() {
        set_test_key();
        let mut settings = llm_settings("oops", 1.0);
        settings.style = ProviderStyle::Elevenlabs;

        let result = ProviderRegistry::from_config(&ProvidersConfig {
            llm: vec![settings],
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
