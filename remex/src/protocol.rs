use crate::value::{Kwargs, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier prefix reserved for administrative calls.
pub const ADMIN_PREFIX: &str = "_adm_";

/// Process-unique id an agent allocates for each accepted call.
///
/// Sent to the client as the handshake frame; also the key under which the
/// agent tracks the call's child process for suspend/resume.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct InvocationId(pub u64);

impl InvocationId {
    /// Allocates a fresh id from a v4 UUID.
    pub fn fresh() -> Self {
        InvocationId(uuid::Uuid::new_v4().as_u128() as u64)
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// Suspend/resume address running calls by id, so the id must fit inside a
// `Value`. The cast through `i64` is bit-preserving in both directions.
impl From<InvocationId> for Value {
    fn from(id: InvocationId) -> Self {
        Value::Int(id.0 as i64)
    }
}

impl From<i64> for InvocationId {
    fn from(raw: i64) -> Self {
        InvocationId(raw as u64)
    }
}

/// A request frame: the function identifier and its keyword arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub identifier: String,
    pub kwargs: Kwargs,
}

impl Request {
    pub fn new(identifier: impl Into<String>, kwargs: Kwargs) -> Self {
        Self {
            identifier: identifier.into(),
            kwargs,
        }
    }

    pub fn is_admin(&self) -> bool {
        is_admin_identifier(&self.identifier)
    }
}

/// A caught remote failure, distinguishable by type tag from any user value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaughtFailure {
    /// textual form of the remote exception
    pub exception: String,
    /// formatted remote traceback
    pub traceback: String,
}

/// A response frame: a normal return value or a caught failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Return(Value),
    Failure(CaughtFailure),
}

pub fn is_admin_identifier(identifier: &str) -> bool {
    identifier.starts_with(ADMIN_PREFIX)
}

/// Splits `"<module>:<qualified_name>"` into its two halves.
///
/// Identifiers without a colon (the admin set) have no module part.
pub fn split_identifier(identifier: &str) -> (Option<&str>, &str) {
    match identifier.split_once(':') {
        Some((module, name)) => (Some(module), name),
        None => (None, identifier),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_id_value_roundtrip() {
        let id = InvocationId(u64::MAX - 17);
        let value = Value::from(id);
        let raw = match value {
            Value::Int(raw) => raw,
            _ => panic!("id should encode as an int"),
        };
        assert_eq!(InvocationId::from(raw), id);
    }

    #[test]
    fn identifier_split() {
        assert_eq!(split_identifier("tasks:sqr"), (Some("tasks"), "sqr"));
        assert_eq!(
            split_identifier("geometry:Point.norm"),
            (Some("geometry"), "Point.norm")
        );
        assert_eq!(split_identifier("_adm_hello"), (None, "_adm_hello"));
    }

    #[test]
    fn admin_prefix() {
        assert!(is_admin_identifier("_adm_cpu_count"));
        assert!(!is_admin_identifier("tasks:sqr"));
    }

    #[test]
    fn reply_tag_distinguishes_failures() {
        let ok = Reply::Return(Value::Str("_adm_".to_string()));
        let failed = Reply::Failure(CaughtFailure {
            exception: "boom".to_string(),
            traceback: "trace".to_string(),
        });
        let ok_bytes = bincode::serialize(&ok).unwrap();
        let failed_bytes = bincode::serialize(&failed).unwrap();
        assert!(matches!(
            bincode::deserialize::<Reply>(&ok_bytes).unwrap(),
            Reply::Return(_)
        ));
        assert!(matches!(
            bincode::deserialize::<Reply>(&failed_bytes).unwrap(),
            Reply::Failure(_)
        ));
    }
}
