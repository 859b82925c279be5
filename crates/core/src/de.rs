//! Serde helpers shared by the global config and rule schemas.

use serde::{Deserialize, Deserializer};

/// Deserialize a field that may be a single string or a list of strings.
pub fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

/// Like [`string_or_list`] but tolerates the field being absent or null.
pub fn opt_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(s)) => vec![s],
        Some(OneOrMany::Many(v)) => v,
    })
}

pub fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Doc {
        #[serde(default, deserialize_with = "super::opt_string_or_list")]
        emails: Vec<String>,
    }

    #[test]
    fn accepts_single_string() {
        let doc: Doc = serde_yaml::from_str("emails: ops@example.com").unwrap();
        assert_eq!(doc.emails, vec!["ops@example.com"]);
    }

    #[test]
    fn accepts_list() {
        let doc: Doc = serde_yaml::from_str("emails: [a@x.com, b@x.com]").unwrap();
        assert_eq!(doc.emails, vec!["a@x.com", "b@x.com"]);
    }

    #[test]
    fn defaults_to_empty() {
        let doc: Doc = serde_yaml::from_str("{}").unwrap();
        assert!(doc.emails.is_empty());
    }
}
