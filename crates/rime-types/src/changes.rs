use std::fmt;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

/// A position in the upstream changes feed.
///
/// Feeds report sequences as strings or integers depending on the backing
/// store; both are kept verbatim as text so the cursor file round-trips
/// without loss.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Seq(String);

impl Seq {
    pub fn new(seq: impl Into<String>) -> Self {
        Self(seq.into())
    }

    /// The feed origin, used before any batch has been committed.
    pub fn initial() -> Self {
        Self("0".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Seq {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::String(seq) => Ok(Self(seq)),
            Value::Number(seq) => Ok(Self(seq.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "expected a string or numeric sequence, got {other}"
            ))),
        }
    }
}

/// A single entry in a changes-feed page.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangeEvent {
    #[serde(default)]
    pub seq: Option<Seq>,
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub changes: Vec<Value>,
}

/// One page of the upstream changes feed.
#[derive(Debug, Clone, Deserialize)]
pub struct ChangesPage {
    #[serde(default)]
    pub results: Vec<ChangeEvent>,
    pub last_seq: Seq,
}

#[cfg(test)]
mod tests {
    use super::ChangesPage;

    #[test]
    fn pages_parse_with_string_or_numeric_sequences() {
        let page: ChangesPage = serde_json::from_str(
            r#"{
                "results": [
                    { "seq": 42, "id": "express", "changes": [{ "rev": "1-abc" }] },
                    { "seq": "43-xyz", "id": "lodash", "deleted": true }
                ],
                "last_seq": 43
            }"#,
        )
        .unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.results[0].seq.as_ref().unwrap().as_str(), "42");
        assert!(!page.results[0].deleted);
        assert_eq!(page.results[1].id, "lodash");
        assert!(page.results[1].deleted);
        assert_eq!(page.last_seq.as_str(), "43");
    }

    #[test]
    fn empty_pages_parse() {
        let page: ChangesPage = serde_json::from_str(r#"{ "last_seq": "0" }"#).unwrap();
        assert!(page.results.is_empty());
    }
}
