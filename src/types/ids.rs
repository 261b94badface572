//! Strongly-typed identifiers.
//!
//! Generated identifiers (events, instances, actions, allocations, checks) are
//! UUID v4 newtypes. Operator-chosen names such as resource ids, workflow
//! template ids and source names stay plain `String`s.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to define a strongly-typed ID newtype wrapper.
///
/// Generates: struct, `new()` (UUID v4), `from_string()`, `as_str()`,
/// Default, Display, Serialize, Deserialize.
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn from_string(s: String) -> Result<Self, &'static str> {
                if s.is_empty() {
                    return Err(concat!(stringify!($name), " cannot be empty"));
                }
                Ok(Self(s))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(EventId);
define_id!(FusedEventId);
define_id!(InstanceId);
define_id!(ActionId);
define_id!(AllocationId);
define_id!(CheckId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ids_are_unique() {
        assert_ne!(InstanceId::new(), InstanceId::new());
    }

    #[test]
    fn test_from_string_rejects_empty() {
        assert!(ActionId::from_string(String::new()).is_err());
        let id = ActionId::from_string("a-1".to_string()).unwrap();
        assert_eq!(id.as_str(), "a-1");
        assert_eq!(id.to_string(), "a-1");
    }

    #[test]
    fn test_serializes_transparently() {
        let id = EventId::from_string("evt-7".to_string()).unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"evt-7\"");
    }
}
