use crate::tensor::{TensorError, Vec3i};
use thiserror::Error;

/// Error type for building and driving a network.
#[derive(Error, Debug)]
pub enum ZnnError {
    #[error(transparent)]
    Tensor(#[from] TensorError),
    /// The graph description is inconsistent (sizes that do not agree, duplicate names, ...).
    #[error("Invalid topology: {0}")]
    Topology(String),
    #[error("Unknown node group '{0}'")]
    UnknownNodes(String),
    #[error("Unknown edge group '{0}'")]
    UnknownEdges(String),
    /// A traversal was given the wrong number of volumes for a node group.
    #[error("Node group '{name}' expects {expected} volumes, got {got}")]
    ChannelCount {
        name: String,
        expected: usize,
        got: usize,
    },
    /// A traversal was given a volume of the wrong size for a node group.
    #[error("Node group '{name}' expects volumes of size {expected:?}, got {got:?}")]
    VolumeSize {
        name: String,
        expected: Vec3i,
        got: Vec3i,
    },
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Failed to build thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ZnnError>;
