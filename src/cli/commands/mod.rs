//! CLI command implementations

pub mod build;
pub mod builder;
pub mod completion;
pub mod image;
pub mod rebase;
pub mod suggest;

pub use build::execute as build;
pub use builder::{create as create_builder, inspect as inspect_builder};
pub use builder::set_default as set_default_builder;
pub use completion::execute as completion;
pub use image::inspect as inspect_image;
pub use rebase::execute as rebase;
pub use suggest::{builders as suggest_builders, stacks as suggest_stacks};
