//! HTTP request handlers.

pub mod multipart;
