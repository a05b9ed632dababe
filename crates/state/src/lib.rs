//! Isolate State - incremental dependency state for isolated file sets
//!
//! The refresh cycle:
//! 1. Load the saved state next to the manifest (or start empty)
//! 2. Read the dependency description and normalize its paths against the root
//! 3. Diff the new file set into the saved state
//! 4. Hash what changed, in parallel
//! 5. Write the manifest(s), then the saved state

pub mod complete_state;
pub mod description;
pub mod paths;
pub mod saved_state;

pub use complete_state::{
    isolatedfile_to_state, load_complete_state, ArchivalSet, CompleteState, LoadRequest, Variables,
};
pub use description::{eval_variables, DescriptionSource, JsonDescription, LoadedDescription};
pub use paths::PathNormalizer;
pub use saved_state::{FileSetDiff, SavedState, STATE_VERSION};
