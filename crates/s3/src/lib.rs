//! sx-s3: aws-sdk-s3 adapter for the sx transfer engine
//!
//! Implements [`sx_core::StorageBackend`] on top of the official SDK.

pub mod client;

pub use client::S3Backend;
