//! File system access: enumeration, classification and attributes.

pub mod category;
pub mod metadata;
pub mod walker;

pub use category::{Category, CategoryLayout, Classification};
pub use metadata::EntryAttributes;
pub use walker::{classify, enumerate, WalkOptions};
