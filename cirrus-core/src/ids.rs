//! Composite identifiers
//!
//! Some resources have no single cloud identifier and are addressed
//! by a tuple of parts. Parts are joined with a pipe, which the
//! services involved never emit in the individual parts.

use crate::error::{EngineError, EngineResult};

const SEPARATOR: &str = "|";

pub fn join(parts: &[&str]) -> String {
    parts.join(SEPARATOR)
}

/// Split a composite id into exactly `expected` parts
pub fn split(id: &str, expected: usize) -> EngineResult<Vec<String>> {
    let parts: Vec<String> = id.split(SEPARATOR).map(str::to_string).collect();
    if parts.len() != expected || parts.iter().any(String::is_empty) {
        return Err(EngineError::internal(format!(
            "unexpected id format '{}', expected {} part(s) separated by '{}'",
            id, expected, SEPARATOR
        )));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let id = join(&["vpc-1", "igw-2"]);
        assert_eq!(id, "vpc-1|igw-2");
        assert_eq!(split(&id, 2).unwrap(), vec!["vpc-1", "igw-2"]);
    }

    #[test]
    fn wrong_arity_fails() {
        assert!(split("vpc-1", 2).is_err());
        assert!(split("a|b|c", 2).is_err());
    }

    #[test]
    fn empty_parts_fail() {
        assert!(split("vpc-1|", 2).is_err());
        assert!(split("", 1).is_err());
    }
}
