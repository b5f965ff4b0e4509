//! Stack deletion hand-off.

use maestro_id::StackName;
use serde::{Deserialize, Serialize};

use crate::EventError;

/// Request for the cleanup worker to delete a stack, best-effort.
///
/// Wire shape: `{"stack": "<stack name>"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeleteRequest {
    /// The stack to delete.
    pub stack: StackName,
}

impl DeleteRequest {
    pub fn new(stack: StackName) -> Self {
        Self { stack }
    }

    /// Encode as the JSON payload sent to the worker.
    pub fn to_payload(&self) -> Result<Vec<u8>, EventError> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a payload received by the worker.
    pub fn from_payload(bytes: &[u8]) -> Result<Self, EventError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_shape() {
        let req = DeleteRequest::new("boston-fleet-version1".parse().unwrap());
        let payload = req.to_payload().unwrap();
        assert_eq!(
            String::from_utf8(payload).unwrap(),
            r#"{"stack":"boston-fleet-version1"}"#
        );
    }

    #[test]
    fn test_rejects_missing_stack() {
        let err = DeleteRequest::from_payload(br#"{"asg_stack":"x"}"#).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    #[test]
    fn test_rejects_invalid_stack_name() {
        let err = DeleteRequest::from_payload(br#"{"stack":"not a stack"}"#).unwrap_err();
        assert!(matches!(err, EventError::InvalidPayload(_)));
    }

    proptest::proptest! {
        #[test]
        fn prop_garbage_never_panics(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..64)) {
            let _ = DeleteRequest::from_payload(&bytes);
        }
    }
}
