use thiserror::Error;

use crate::coord::CoordError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("coordination error: {0}")]
    Coord(#[from] CoordError),

    #[error("malformed data at {path}: {detail}")]
    BadData { path: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, AgentError>;
