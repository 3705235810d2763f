use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::store::DataStore;

pub const STRINGS_FILE: &str = "text/strings.dat";

/// Localized strings from `text/strings.dat`: one `key value` pair per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringResource {
    strings: BTreeMap<String, String>,
}

impl StringResource {
    pub fn parse(text: &str) -> Self {
        let mut strings = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            let line = line.trim_start();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = match line.find(char::is_whitespace) {
                Some(split) => (&line[..split], line[split..].trim_start()),
                None => (line, ""),
            };
            strings.insert(key.to_string(), value.to_string());
        }
        Self { strings }
    }

    /// Loads the strings of the current language, falling back to the
    /// language-neutral file. A quest without strings gets an empty resource.
    pub fn load(store: &DataStore) -> Result<Self> {
        let name = if store.language().is_some() {
            store.resolve_name(STRINGS_FILE, true)?
        } else {
            STRINGS_FILE.to_string()
        };
        let name = if store.exists(&name) {
            name
        } else {
            STRINGS_FILE.to_string()
        };
        match store.read_optional(&name)? {
            Some(bytes) => {
                let text = String::from_utf8(bytes)
                    .with_context(|| format!("{name} is not valid UTF-8"))?;
                let resource = Self::parse(&text);
                log::debug!("loaded {} strings from {name}", resource.len());
                Ok(resource)
            }
            None => {
                log::info!("no {name} in {}, text keys will not resolve", store.describe());
                Ok(Self::default())
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.strings.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
