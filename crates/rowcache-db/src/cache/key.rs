//! Cache key derivation.
//!
//! Keys have the form
//! `{prefix}:db:{table}:({field=value,...}):{version}[:suffix:{suffix}]`,
//! with the field pairs sorted by name and every space written as
//! `&nbsp;`. Keys longer than [`MAX_KEY_LENGTH`] bytes replace the pair
//! list with its SHA-256 hex digest.

use std::fmt;

use rowcache_core::CacheSettings;
use sha2::{Digest, Sha256};

use crate::schema::OrderSignature;
use crate::value::Value;

/// Longest key a backend accepts.
pub const MAX_KEY_LENGTH: usize = 250;

/// What a key stores.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeySuffix {
    /// One row payload, or the missing marker.
    Row,
    /// An ordered id-list, optionally under an order-by signature.
    Ids(Option<OrderSignature>),
    /// A row count.
    Count,
}

impl KeySuffix {
    /// The order-by signature of an id-list key.
    pub const fn order(&self) -> Option<&OrderSignature> {
        match self {
            Self::Ids(order) => order.as_ref(),
            Self::Row | Self::Count => None,
        }
    }
}

impl fmt::Display for KeySuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Row => Ok(()),
            Self::Ids(None) => write!(f, ":suffix:ids"),
            Self::Ids(Some(order)) => write!(f, ":suffix:ids:{order}"),
            Self::Count => write!(f, ":suffix:count"),
        }
    }
}

/// Builds keys under one prefix and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBuilder {
    prefix: String,
    version: String,
}

impl KeyBuilder {
    /// A builder for `prefix` and `version`.
    pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            version: version.into(),
        }
    }

    /// A builder from cache settings.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        Self::new(settings.prefix.clone(), settings.version.clone())
    }

    /// The key for `pairs` on `table`. Pair order does not matter.
    pub fn key<'a, I>(&self, table: &str, pairs: I, suffix: &KeySuffix) -> String
    where
        I: IntoIterator<Item = (&'a str, &'a Value)>,
    {
        let mut pairs: Vec<(&str, &Value)> = pairs.into_iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        let signature = pairs
            .iter()
            .map(|(field, value)| format!("{field}={}", value.cache_repr()))
            .collect::<Vec<_>>()
            .join(",");

        let key = self.assemble(table, &signature, suffix);
        if key.len() <= MAX_KEY_LENGTH {
            return key;
        }
        let digest = Sha256::digest(signature.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.assemble(table, &hex, suffix)
    }

    fn assemble(&self, table: &str, signature: &str, suffix: &KeySuffix) -> String {
        format!(
            "{}:db:{table}:({signature}):{}{suffix}",
            self.prefix, self.version
        )
        .replace(' ', "&nbsp;")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> KeyBuilder {
        KeyBuilder::new("rc", "1")
    }

    #[test]
    fn test_key_format() {
        let id = Value::Int(5);
        assert_eq!(
            builder().key("users", [("id", &id)], &KeySuffix::Row),
            "rc:db:users:(id=5):1"
        );
        let order = OrderSignature::parse(&["-age", "name"]).unwrap();
        assert_eq!(
            builder().key("users", [("group_id", &id)], &KeySuffix::Ids(Some(order))),
            "rc:db:users:(group_id=5):1:suffix:ids:-age,name"
        );
        assert_eq!(
            builder().key("users", [("group_id", &id)], &KeySuffix::Count),
            "rc:db:users:(group_id=5):1:suffix:count"
        );
    }

    #[test]
    fn test_spaces_are_replaced() {
        let name = Value::from("a b");
        assert_eq!(
            builder().key("users", [("name", &name)], &KeySuffix::Row),
            "rc:db:users:(name='a&nbsp;b'):1"
        );
    }

    #[test]
    fn test_types_do_not_collide() {
        let int = Value::Int(1);
        let text = Value::from("1");
        assert_ne!(
            builder().key("t", [("a", &int)], &KeySuffix::Row),
            builder().key("t", [("a", &text)], &KeySuffix::Row)
        );
    }

    #[test]
    fn test_quoted_values_do_not_collide() {
        let forged = Value::from("x',b='y");
        let (x, y) = (Value::from("x"), Value::from("y"));
        assert_ne!(
            builder().key("t", [("a", &forged)], &KeySuffix::Row),
            builder().key("t", [("a", &x), ("b", &y)], &KeySuffix::Row)
        );

        let spaced = Value::from("a b");
        let entity = Value::from("a&nbsp;b");
        assert_ne!(
            builder().key("t", [("a", &spaced)], &KeySuffix::Row),
            builder().key("t", [("a", &entity)], &KeySuffix::Row)
        );
    }

    #[test]
    fn test_long_keys_are_digested() {
        let long = Value::from("x".repeat(400));
        let key = builder().key("users", [("bio", &long)], &KeySuffix::Count);
        assert!(key.len() <= MAX_KEY_LENGTH);
        assert!(key.starts_with("rc:db:users:("));
        assert!(key.ends_with("):1:suffix:count"));
        let again = builder().key("users", [("bio", &long)], &KeySuffix::Count);
        assert_eq!(key, again);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn key_ignores_pair_order(
                pairs in proptest::collection::btree_map("[a-z]{1,6}", any::<i64>(), 1..6),
                rotation in 0usize..6,
            ) {
                let values: Vec<(String, Value)> =
                    pairs.into_iter().map(|(k, v)| (k, Value::Int(v))).collect();
                let mut rotated = values.clone();
                rotated.rotate_left(rotation % values.len());
                rotated.reverse();

                let a = builder().key("t", values.iter().map(|(k, v)| (k.as_str(), v)), &KeySuffix::Row);
                let b = builder().key("t", rotated.iter().map(|(k, v)| (k.as_str(), v)), &KeySuffix::Row);
                prop_assert_eq!(a, b);
            }
        }
    }
}
