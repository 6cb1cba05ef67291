use thiserror::Error;

/// Misuse of the cache API, as opposed to a failure reported by a loader.
///
/// Loader failures are the loader's own error type and are cached alongside
/// successful values. Of these variants only the abandoned-load ones are
/// cached, and only until the key is evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    #[error("load function must not be absent")]
    MissingLoader,
    #[error("load function panicked")]
    LoaderPanicked,
    #[error("load was cancelled before it finished")]
    LoadCancelled,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
