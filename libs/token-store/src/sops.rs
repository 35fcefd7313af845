use crate::StoreError;

/// The sops backend is specified but not yet implemented. Construction
/// fails fast so a misconfigured deployment never starts with a silent
/// no-op store.
pub fn unavailable() -> StoreError {
    StoreError::Unavailable(
        "sops secrets backend is not implemented; use \"pass\" or \"unsafe\"".to_string(),
    )
}
