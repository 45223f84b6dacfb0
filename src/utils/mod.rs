pub mod abort;
pub mod clipboard;
