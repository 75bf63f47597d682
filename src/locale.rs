use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

/// Localization file layout: `{ key: { culture: text } }` plus a default
/// culture used when the requested one has no entry.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocaleFile {
    pub default_culture: String,
    #[serde(default)]
    pub localized_content: HashMap<String, HashMap<String, String>>,
}

/// Resolves message keys to localized text.
#[derive(Debug, Clone, Default)]
pub struct Locales {
    file: LocaleFile,
}

impl Locales {
    pub fn new(file: LocaleFile) -> Self {
        Self { file }
    }

    /// Provider that echoes every key back.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read localization file: {}", path.display()))?;
        let file: LocaleFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse localization file: {}", path.display()))?;
        info!(
            keys = file.localized_content.len(),
            default_culture = %file.default_culture,
            "loaded localization file"
        );
        Ok(Self { file })
    }

    pub fn default_culture(&self) -> &str {
        &self.file.default_culture
    }

    pub fn get_default(&self, key: &str, args: &[&str]) -> String {
        self.get(&self.file.default_culture, key, args)
    }

    /// Looks `key` up for `culture`, falling back to the default culture
    /// and then to the key itself. Each `{}` in the text takes the next
    /// argument.
    pub fn get(&self, culture: &str, key: &str, args: &[&str]) -> String {
        let Some(variants) = self.file.localized_content.get(key) else {
            debug!(key, "no localization for key");
            return key.to_string();
        };
        let content = match variants.get(culture) {
            Some(content) => content,
            None => match variants.get(&self.file.default_culture) {
                Some(content) => {
                    debug!(key, culture, "no localization for culture, using default");
                    content
                }
                None => return key.to_string(),
            },
        };
        fill_placeholders(content, args)
    }
}

fn fill_placeholders(template: &str, args: &[&str]) -> String {
    if args.is_empty() {
        return template.to_string();
    }
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut rest = template;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match args.next() {
            Some(arg) => out.push_str(arg),
            None => out.push_str("{}"),
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locales() -> Locales {
        let file: LocaleFile = serde_json::from_str(
            r#"{
                "defaultCulture": "en",
                "localizedContent": {
                    "greeting": { "en": "Hello, {}!", "ru": "Привет, {}!" },
                    "only_en": { "en": "English only" },
                    "orphan": { "de": "Nur Deutsch" }
                }
            }"#,
        )
        .unwrap();
        Locales::new(file)
    }

    #[test]
    fn test_culture_lookup_with_args() {
        let l = locales();
        assert_eq!(l.get("ru", "greeting", &["Аня"]), "Привет, Аня!");
        assert_eq!(l.get_default("greeting", &["Ann"]), "Hello, Ann!");
    }

    #[test]
    fn test_falls_back_to_default_culture() {
        assert_eq!(locales().get("fr", "only_en", &[]), "English only");
    }

    #[test]
    fn test_falls_back_to_key() {
        let l = locales();
        assert_eq!(l.get("en", "missing", &[]), "missing");
        assert_eq!(l.get("en", "orphan", &[]), "orphan");
        assert_eq!(Locales::empty().get("en", "anything", &[]), "anything");
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(fill_placeholders("{} of {}", &["1", "3"]), "1 of 3");
        assert_eq!(fill_placeholders("{} and {}", &["a"]), "a and {}");
        assert_eq!(fill_placeholders("none", &["x"]), "none");
    }
}
