//! Options-string tokens and the editor that owns a subset of them.

pub mod editor;
pub mod property;

pub use editor::OptionsEditor;
pub use property::{PropertyKey, SystemProperty};
