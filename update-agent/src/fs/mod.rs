//! Local file system checks against the manifest.

pub mod validator;

pub use validator::{sha1_file, Validator};
