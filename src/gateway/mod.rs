//! Remote object-store gateways.
//!
//! The [`backend::UploadGateway`] trait defines the multipart
//! primitives; [`aws::AwsUploadGateway`] talks to S3-compatible stores
//! and [`memory::MemoryUploadGateway`] emulates one in process.

pub mod aws;
pub mod backend;
pub mod memory;
