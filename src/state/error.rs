use thiserror::Error;

#[derive(Debug, Error)]
pub enum InitializationError {
    #[error("Failed to initialize knowledge store: {0}")]
    Knowledge(#[source] anyhow::Error),

    #[error("Failed to initialize session store: {0}")]
    Sessions(#[source] anyhow::Error),
}
