use thiserror::Error;

#[derive(Error, Debug)]
pub enum AecError {
    #[error("Invalid config: {0}")]
    Config(String),
    #[error("Filter order must be at least 1")]
    InvalidFilterOrder,
    #[error("{0} signal is empty")]
    EmptySignal(&'static str),
    #[error("{0} signal contains non-finite samples")]
    NonFiniteSamples(&'static str),
    #[error("Sample rate mismatch: mic {mic} Hz, reference {reference} Hz")]
    SampleRateMismatch { mic: u32, reference: u32 },
    #[error("Frame column has {actual} bins, expected {expected}")]
    ColumnLength { expected: usize, actual: usize },
    #[error("Missing tensor '{0}'")]
    MissingTensor(String),
    #[error("Tensor '{name}' has shape {actual:?}, expected {expected:?}")]
    TensorShape {
        name: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("Tensor '{name}' holds {actual} values but its shape needs {expected}")]
    TensorData {
        name: String,
        expected: usize,
        actual: usize,
    },
    #[error("Weight blob '{0}' not found")]
    WeightsNotFound(String),
    #[error("Weight blob decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AecError>;
