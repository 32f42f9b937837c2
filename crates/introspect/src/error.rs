use thiserror::Error;

/// Error kinds surfaced by the introspection core.
///
/// `NotFound`, `PermissionDenied`, `NotSupported`, and `Failed` (a generic
/// kernel-reported failure that carries the errno string) cover the raw
/// syscall layer's outcomes. `Io` covers the `std::fs`/`std::io` paths
/// (auxv/maps/task reads) that don't go through it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("kernel call failed ({errno}): {context}")]
    Failed { errno: i32, context: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Builds a `Failed` from a raw negative kernel return value (`-errno`).
    pub fn from_kernel_ret(ret: i64, context: impl Into<String>) -> Self {
        let errno = (-ret) as i32;
        Error::Failed {
            errno,
            context: context.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
