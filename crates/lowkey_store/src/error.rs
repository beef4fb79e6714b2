use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not complete the operation (I/O failure,
    /// closed database, ...). The key's previous value is unchanged.
    #[error("store backend failure: {0}")]
    Backend(String),
}
