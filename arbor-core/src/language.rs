//! Language definitions and the registry that node graphs resolve
//! classifiers against.
//!
//! A registry is built explicitly and handed to whoever needs it, so two
//! graphs in the same process can work against different language sets.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Address of a classifier or feature inside a versioned language.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetaPointer {
    pub language: String,
    pub version: String,
    pub key: String,
}

impl MetaPointer {
    pub fn new(
        language: impl Into<String>,
        version: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            language: language.into(),
            version: version.into(),
            key: key.into(),
        }
    }

    /// The language this pointer lives in.
    pub fn used_language(&self) -> UsedLanguage {
        UsedLanguage {
            key: self.language.clone(),
            version: self.version.clone(),
        }
    }
}

impl std::fmt::Display for MetaPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}#{}", self.language, self.version, self.key)
    }
}

/// A `(key, version)` pair naming a language a chunk depends on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UsedLanguage {
    pub key: String,
    pub version: String,
}

/// A concept that nodes can be instances of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub key: String,
    pub name: String,
    /// Instances of a partition concept may be roots of subscription/transport.
    #[serde(default)]
    pub partition: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Language {
    pub key: String,
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub concepts: Vec<Concept>,
}

impl Language {
    pub fn new(key: impl Into<String>, version: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
            name: name.into(),
            concepts: Vec::new(),
        }
    }

    /// Builder-style concept declaration.
    pub fn with_concept(mut self, key: impl Into<String>, name: impl Into<String>, partition: bool) -> Self {
        self.concepts.push(Concept {
            key: key.into(),
            name: name.into(),
            partition,
        });
        self
    }

    /// Meta-pointer to an element (concept or feature) of this language.
    pub fn meta_pointer(&self, key: impl Into<String>) -> MetaPointer {
        MetaPointer::new(self.key.clone(), self.version.clone(), key)
    }

    pub fn concept(&self, key: &str) -> Option<&Concept> {
        self.concepts.iter().find(|c| c.key == key)
    }
}

/// Set of languages known to one graph or replica.
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    languages: HashMap<UsedLanguage, Language>,
}

impl LanguageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a language, replacing any previous definition of the same
    /// key and version.
    pub fn register(&mut self, language: Language) {
        log::debug!("Registering language {}@{}", language.key, language.version);
        let id = UsedLanguage {
            key: language.key.clone(),
            version: language.version.clone(),
        };
        self.languages.insert(id, language);
    }

    pub fn with_language(mut self, language: Language) -> Self {
        self.register(language);
        self
    }

    pub fn language(&self, used: &UsedLanguage) -> Option<&Language> {
        self.languages.get(used)
    }

    pub fn knows_language(&self, used: &UsedLanguage) -> bool {
        self.languages.contains_key(used)
    }

    /// Resolve a classifier pointer to its concept.
    pub fn concept(&self, classifier: &MetaPointer) -> Option<&Concept> {
        self.language(&classifier.used_language())
            .and_then(|l| l.concept(&classifier.key))
    }

    pub fn is_partition(&self, classifier: &MetaPointer) -> bool {
        self.concept(classifier).is_some_and(|c| c.partition)
    }

    pub fn len(&self) -> usize {
        self.languages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.languages.is_empty()
    }
}
