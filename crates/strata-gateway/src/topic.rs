//! Topic grammar.
//!
//! ```text
//! entity:{type}        every change of one entity type
//! entity:{type}:{id}   changes of a single entity
//! channel:{name}       a named event channel
//! {name}               shorthand for channel:{name}
//! ```

use std::fmt;
use std::str::FromStr;
use strata_core::CoreError;

const MAX_TOPIC_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Topic {
    EntityType(String),
    Entity { entity_type: String, id: String },
    Channel(String),
}

impl Topic {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        if raw.is_empty() || raw.len() > MAX_TOPIC_LEN {
            return Err(CoreError::invalid_topic(format!(
                "topic must be 1..={MAX_TOPIC_LEN} bytes"
            )));
        }
        if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CoreError::invalid_topic(format!("'{raw}' contains whitespace")));
        }

        let segment = |value: &str, what: &str| -> Result<String, CoreError> {
            if value.is_empty() {
                Err(CoreError::invalid_topic(format!("'{raw}' has an empty {what}")))
            } else {
                Ok(value.to_string())
            }
        };

        if let Some(rest) = raw.strip_prefix("entity:") {
            return match rest.split_once(':') {
                Some((entity_type, id)) => Ok(Topic::Entity {
                    entity_type: segment(entity_type, "entity type")?,
                    id: segment(id, "entity id")?,
                }),
                None => Ok(Topic::EntityType(segment(rest, "entity type")?)),
            };
        }
        if let Some(name) = raw.strip_prefix("channel:") {
            return Ok(Topic::Channel(segment(name, "channel name")?));
        }
        if raw == "entity" || raw == "channel" {
            return Err(CoreError::invalid_topic(format!("'{raw}' is a reserved prefix")));
        }
        Ok(Topic::Channel(raw.to_string()))
    }

    /// Subscription keys that receive a publication on this topic: the
    /// topic itself and, for a single entity, its entity type.
    pub fn routing_keys(&self) -> Vec<String> {
        match self {
            Topic::Entity { entity_type, .. } => {
                vec![self.to_string(), Topic::EntityType(entity_type.clone()).to_string()]
            }
            _ => vec![self.to_string()],
        }
    }

    /// Whether a subscription to `self` receives publications on `published`.
    pub fn matches(&self, published: &Topic) -> bool {
        match (self, published) {
            (Topic::EntityType(wanted), Topic::Entity { entity_type, .. }) => wanted == entity_type,
            _ => self == published,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::EntityType(entity_type) => write!(f, "entity:{entity_type}"),
            Topic::Entity { entity_type, id } => write!(f, "entity:{entity_type}:{id}"),
            Topic::Channel(name) => write!(f, "channel:{name}"),
        }
    }
}

impl FromStr for Topic {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Topic::parse(s)
    }
}
