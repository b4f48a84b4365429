#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("engine io error: {0}")]
    Io(#[from] sled::Error),
    #[error("engine encoding error: {0}")]
    Encoding(String),
}
