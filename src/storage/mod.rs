//! Object store clients.
//!
//! The [`backend::ObjectStoreClient`] trait is the narrow set of S3 calls
//! the file storage needs.  [`aws::AwsS3Client`] talks to AWS S3 or a
//! compatible endpoint; [`memory::MemoryClient`] keeps everything in
//! process and records each call, which the tests rely on.

pub mod aws;
pub mod backend;
pub mod memory;
