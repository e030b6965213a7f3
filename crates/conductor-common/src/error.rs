use thiserror::Error;

/// Errors produced when parsing or validating an action identifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdError {
    #[error("Action identifier '{0}' must have the form module/name")]
    MissingSeparator(String),

    #[error("Action identifier has an empty {part}")]
    Empty { part: &'static str },

    #[error("Action {part} '{value}' must not contain '/'")]
    NestedSeparator { part: &'static str, value: String },

    #[error("Action {part} '{value}' uses reserved topic characters (leading ':' or '*')")]
    Reserved { part: &'static str, value: String },
}
