//! imgflow CLI - pull and save container images.

pub mod commands;
