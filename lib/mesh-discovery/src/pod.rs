//! Pod gossip message and its text wire codec
//!
//! Wire grammar: `<identifier>*<available>[$<key>=<value>[&<key>=<value>...]]`
//!
//! Keys and values must not contain any of the four delimiters; such pods
//! are not guaranteed to decode back to the original. `Pod::validate`
//! rejects them.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::PodError;

const IDENTIFIER_DELIMITER: &str = "*";
const ATTRIBUTES_DELIMITER: &str = "$";
const PAIR_DELIMITER: &str = "&";
const KEY_VALUE_DELIMITER: &str = "=";
const DELIMITERS: [char; 4] = ['*', '$', '&', '='];

/// Attributes advertised by a mesh participant
pub type Attributes = BTreeMap<String, String>;

/// A gossip message describing one participant's identity and availability
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    identifier: String,
    available: bool,
    attributes: Attributes,
}

impl Pod {
    pub fn new(identifier: impl Into<String>, available: bool, attributes: Attributes) -> Self {
        Self {
            identifier: identifier.into(),
            available,
            attributes,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn available(&self) -> bool {
        self.available
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn set_available(&mut self, available: bool) {
        self.available = available;
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn remove_attribute(&mut self, key: &str) -> Option<String> {
        self.attributes.remove(key)
    }

    pub fn into_attributes(self) -> Attributes {
        self.attributes
    }

    /// Check that the pod decodes back to itself
    ///
    /// The identifier must be non-empty, and neither it nor any attribute key
    /// or value may contain a delimiter.
    pub fn validate(&self) -> Result<(), PodError> {
        if self.identifier.is_empty() {
            return Err(PodError::MissingIdentifier);
        }
        let tokens = std::iter::once(&self.identifier)
            .chain(self.attributes.iter().flat_map(|(k, v)| [k, v]));
        for token in tokens {
            if token.contains(&DELIMITERS[..]) {
                return Err(PodError::ReservedCharacter(token.clone()));
            }
        }
        Ok(())
    }

    /// Encode the pod into its wire form
    pub fn stringify(&self) -> String {
        let mut wire = format!(
            "{}{}{}",
            self.identifier, IDENTIFIER_DELIMITER, self.available
        );

        if !self.attributes.is_empty() {
            let pairs: Vec<String> = self
                .attributes
                .iter()
                .map(|(k, v)| format!("{}{}{}", k, KEY_VALUE_DELIMITER, v))
                .collect();
            wire.push_str(ATTRIBUTES_DELIMITER);
            wire.push_str(&pairs.join(PAIR_DELIMITER));
        }

        wire
    }

    /// Decode a pod from its wire form
    pub fn objectify(wire: &str) -> Result<Self, PodError> {
        let (identifier, rest) = match wire.split_once(IDENTIFIER_DELIMITER) {
            Some(parts) => parts,
            None if wire.is_empty() => return Err(PodError::MissingIdentifier),
            None => return Err(PodError::MissingAvailability),
        };
        if identifier.is_empty() {
            return Err(PodError::MissingIdentifier);
        }

        let (available, block) = match rest.split_once(ATTRIBUTES_DELIMITER) {
            Some((available, block)) => (available, Some(block)),
            None => (rest, None),
        };

        let available = match available {
            "true" => true,
            "false" => false,
            "" => return Err(PodError::MissingAvailability),
            other => return Err(PodError::InvalidAvailability(other.to_string())),
        };

        let attributes = block.map(parse_attributes).unwrap_or_default();

        Ok(Self {
            identifier: identifier.to_string(),
            available,
            attributes,
        })
    }

    /// Decode a pod from a raw datagram payload
    pub fn from_bytes(payload: &[u8]) -> Result<Self, PodError> {
        let wire = std::str::from_utf8(payload).map_err(|_| PodError::InvalidEncoding)?;
        Self::objectify(wire)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.stringify().into_bytes()
    }
}

fn parse_attributes(block: &str) -> Attributes {
    block
        .split(PAIR_DELIMITER)
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once(KEY_VALUE_DELIMITER) {
            Some((k, v)) => (k.to_string(), v.to_string()),
            None => (pair.to_string(), String::new()),
        })
        .collect()
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

impl FromStr for Pod {
    type Err = PodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::objectify(s)
    }
}
