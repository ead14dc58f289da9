//! Identifier generation for entities that arrive without one.

use uuid::Uuid;

/// Generate a new globally unique identifier.
pub fn generate() -> String {
    Uuid::new_v4().to_string()
}

/// Return `id` unchanged if present, otherwise a freshly generated one.
pub fn ensure(id: Option<String>) -> String {
    match id {
        Some(id) => id,
        None => generate(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_generate_is_unique() {
        let ids: HashSet<String> = (0..1000).map(|_| generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_ensure_fills_missing() {
        let id = ensure(None);
        assert!(Uuid::parse_str(&id).is_ok());
    }

    proptest! {
        #[test]
        fn test_ensure_keeps_existing(id in "[a-zA-Z0-9-]{1,40}") {
            prop_assert_eq!(ensure(Some(id.clone())), id);
        }
    }
}
