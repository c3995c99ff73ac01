use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ValidationError {
    #[error("{field}: {reason}")]
    Field { field: String, reason: String },

    #[error("unknown interface type {0:?}")]
    UnknownType(String),

    #[error("value must be a JSON object")]
    NotAnObject,
}

impl ValidationError {
    pub fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Field {
            field: field.into(),
            reason: reason.into(),
        }
    }
}
