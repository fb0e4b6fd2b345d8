use std::collections::HashSet;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::{Item, Topic, CHOICE_COUNT};
use crate::ports::ItemRepository;

const BUILTIN_BANK: &str = include_str!("../data/items.json");

#[derive(Debug, Clone, Default)]
pub struct ItemBank {
    items: Vec<Item>,
}

impl ItemBank {
    pub fn builtin() -> Result<Self> {
        Self::from_json(BUILTIN_BANK)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Bank(format!("cannot read {}: {}", path.display(), e)))?;
        let bank = Self::from_json(&raw)?;
        debug!(path = %path.display(), items = bank.len(), "loaded item bank");
        Ok(bank)
    }

    // Uses the file when given, the embedded bank otherwise.
    pub fn open(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::load(p),
            None => Self::builtin(),
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let items: Vec<Item> =
            serde_json::from_str(raw).map_err(|e| Error::Bank(format!("invalid JSON: {}", e)))?;
        Self::from_items(items)
    }

    pub fn from_items(items: Vec<Item>) -> Result<Self> {
        let mut seen = HashSet::new();
        for item in &items {
            if item.id.trim().is_empty() {
                return Err(Error::Bank("item with empty id".to_string()));
            }
            if !seen.insert(item.id.as_str()) {
                return Err(Error::Bank(format!("duplicate item id '{}'", item.id)));
            }
            if item.title.trim().is_empty() || item.answer_sql.trim().is_empty() {
                return Err(Error::Bank(format!(
                    "item '{}' needs a title and an answer",
                    item.id
                )));
            }
            // Explanation answers are graded against this text only.
            if item.explanation.trim().is_empty() {
                return Err(Error::Bank(format!("item '{}' needs an explanation", item.id)));
            }
            if item.choices.len() > CHOICE_COUNT {
                return Err(Error::Bank(format!(
                    "item '{}' has {} choices, at most {} allowed",
                    item.id,
                    item.choices.len(),
                    CHOICE_COUNT
                )));
            }
        }

        let bank = Self { items };
        for topic in Topic::ALL {
            if bank.count_for(topic) == 0 {
                warn!(topic = topic.as_str(), "item bank has no items for topic");
            }
        }
        Ok(bank)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn count_for(&self, topic: Topic) -> usize {
        self.items.iter().filter(|i| i.topic == topic).count()
    }

    #[cfg(test)]
    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.iter().find(|i| i.id == id)
    }
}

impl ItemRepository for ItemBank {
    fn items_for(&self, topic: Topic) -> Vec<Item> {
        self.items
            .iter()
            .filter(|i| i.topic == topic)
            .cloned()
            .collect()
    }

    fn all_items(&self) -> Vec<Item> {
        self.items.clone()
    }
}
