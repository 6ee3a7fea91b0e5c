use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

pub use card::{CardRecord, Category};

const BUILTIN_CASE_FILE: &str = include_str!("../data/case-file.yaml");

mod card {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Category {
        Witness,
        Evidence,
        Location,
        Forensics,
    }

    impl Category {
        pub const ALL: [Category; 4] = [
            Category::Witness,
            Category::Evidence,
            Category::Location,
            Category::Forensics,
        ];

        pub fn as_str(&self) -> &'static str {
            match self {
                Category::Witness => "witness",
                Category::Evidence => "evidence",
                Category::Location => "location",
                Category::Forensics => "forensics",
            }
        }
    }

    impl fmt::Display for Category {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// One piece of case content, keyed by the exact text encoded in its QR code.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub struct CardRecord {
        pub id: String,
        pub category: Category,
        /// Free-form type line shown next to the title (e.g. "Saksi").
        pub label: String,
        pub title: String,
        pub subtitle: String,
        /// Card text; paragraphs are separated by newlines.
        #[serde(default)]
        pub body: String,
        /// Image reference, resolved by the front end against its asset root.
        pub image: String,
    }

    impl CardRecord {
        pub fn paragraphs(&self) -> impl Iterator<Item = &str> {
            self.body
                .split('\n')
                .map(str::trim)
                .filter(|line| !line.is_empty())
        }
    }
}

/// Catalog entry as written in YAML; the map key supplies the id.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct CardEntry {
    category: Category,
    #[serde(default)]
    label: Option<String>,
    title: String,
    #[serde(default)]
    subtitle: String,
    #[serde(default)]
    body: String,
    image: String,
}

/// Static scan-code table. Never mutated after construction.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    cards: BTreeMap<String, CardRecord>,
}

impl Catalog {
    /// The case file compiled into the binary.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CASE_FILE).context("built-in case file is invalid")
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read catalog {}", path.display()))?;
        Self::from_yaml_str(&s).with_context(|| format!("invalid catalog {}", path.display()))
    }

    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let entries: BTreeMap<String, CardEntry> = serde_yaml::from_str(input)?;
        let mut cards = BTreeMap::new();
        for (id, entry) in entries {
            ensure!(!id.is_empty(), "catalog codes must not be empty");
            ensure!(
                !entry.title.trim().is_empty(),
                "card {id} must have a non-empty title"
            );
            let label = entry
                .label
                .filter(|label| !label.trim().is_empty())
                .unwrap_or_else(|| entry.category.to_string());
            let record = CardRecord {
                id: id.clone(),
                category: entry.category,
                label,
                title: entry.title,
                subtitle: entry.subtitle,
                body: entry.body,
                image: entry.image,
            };
            cards.insert(id, record);
        }
        Ok(Self { cards })
    }

    pub fn from_records(records: impl IntoIterator<Item = CardRecord>) -> Self {
        Self {
            cards: records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }

    /// Exact, case-sensitive match. Absence is an ordinary outcome.
    pub fn lookup(&self, code: &str) -> Option<&CardRecord> {
        self.cards.get(code)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Cards ordered by code.
    pub fn iter(&self) -> impl Iterator<Item = &CardRecord> {
        self.cards.values()
    }
}
