use thiserror::Error;

use crate::types::Action;

/// Errors surfaced by the store at dispatch or access time.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The reducer received a non-init action while the state was still
    /// unset. Raised at the dispatch call site.
    #[error(
        "the only accepted action type when state is unset is `InitAction`, \
         action `{action}` is not allowed"
    )]
    Initialization {
        /// Debug rendering of the offending action.
        action: String,
    },

    /// The store state was read before the first successful reduction.
    #[error("store has not been initialized yet")]
    Uninitialized,

    /// The store already went through its shutdown procedure.
    #[error("store has been finished, dispatching is no longer possible")]
    Finished,
}

impl StoreError {
    /// Build an [`StoreError::Initialization`] from the offending action.
    pub fn initialization(action: &dyn Action) -> Self {
        StoreError::Initialization {
            action: format!("{action:?}"),
        }
    }
}

/// Errors produced while serializing state into a snapshot tree.
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The value has no snapshot representation.
    #[error("unable to serialize value of type `{type_name}`")]
    Unsupported {
        /// Type name of the value that could not be serialized.
        type_name: &'static str,
    },

    /// Non-finite floats have no JSON atom representation.
    #[error("non-finite number `{value}` cannot be represented in a snapshot")]
    NonFiniteNumber {
        /// The offending value.
        value: f64,
    },
}
