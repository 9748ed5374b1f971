use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum QueryError {
    InvalidSelector(String),
    InvalidModifier(String),
    InvalidProjection(String),
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryError::InvalidSelector(msg) => write!(f, "invalid selector: {msg}"),
            QueryError::InvalidModifier(msg) => write!(f, "invalid modifier: {msg}"),
            QueryError::InvalidProjection(msg) => write!(f, "invalid projection: {msg}"),
        }
    }
}

impl std::error::Error for QueryError {}
