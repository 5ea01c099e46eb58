use crate::registry::ClassId;
use thiserror::Error;

/// Errors surfaced to the host by the bridge.
///
/// Script-visible failures (bad arguments at a script boundary, exceptions
/// thrown by host callbacks) never appear here; they travel through the
/// engine's own exception channel and reach the host only as recorded
/// exception text after a failed evaluation.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("class id {class_id} is not registered")]
    UnknownClassId { class_id: ClassId },

    #[error("function handle {index} does not refer to a live slot")]
    StaleFunctionHandle { index: u32 },

    #[error("script exception: {0}")]
    Script(String),

    #[error(transparent)]
    Engine(#[from] rquickjs::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_name_the_offender() {
        let err = BridgeError::UnknownClassId { class_id: 42 };
        assert!(err.to_string().contains("42"));

        let err = BridgeError::StaleFunctionHandle { index: 7 };
        assert!(err.to_string().contains("7"));
    }
}
