//! Resumable, concurrent, chunked uploads of large dataset files to object storage.
//!
//! The backend of the dataset marketplace owns the multipart upload protocol: it initiates an
//! upload, pre-signs a URL for every part, and assembles the parts into the final object.  This
//! crate drives that protocol from the client side:
//!
//! * [`Uploader::begin`] splits a file into fixed-size parts and transfers them to their
//!   pre-signed URLs, a bounded number at a time.  The returned [`UploadJob`] can pause, resume
//!   and cancel the upload and reports progress as bytes move.
//! * Every part object storage acknowledges is recorded in a persisted [`UploadSession`], so an
//!   upload interrupted by a crash, a lost connection or a cancellation picks up where it left off
//!   the next time it's started.
//! * [`rollback_dataset`] deletes a dataset's metadata record and stored object when one of the
//!   two was created but the other wasn't.
//! * [`DownloadTaskPoller`] waits for the backend to prepare a paid dataset for download.
//!
//! The backend and object storage are reached through the traits in [`api`]; [`http`] implements
//! them over HTTP.
pub mod api;
mod config;
pub mod download;
pub mod error;
pub mod http;
pub mod reconcile;
mod scheduler;
pub mod session;
pub mod source;
mod transfer;
mod upload;

pub use config::Config;
pub use download::{DownloadProgressCallback, DownloadTaskPoller};
pub use error::{Result, UploadError};
pub use http::HttpClient;
pub use reconcile::rollback_dataset;
pub use session::{FileSessionStore, MemorySessionStore, SessionStore, UploadSession};
pub use source::{BytesSource, FileSource, UploadSource};
pub use upload::*;
