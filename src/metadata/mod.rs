//! Metadata persistence.
//!
//! Bucket, object, upload and part records are JSON sidecars written with
//! an atomic stage-then-rename; see [`records`].

pub mod records;
