//! MIME header model and streaming multipart parser.

pub mod body;
pub mod boundary;
pub mod content_type;
pub mod encoding;
pub mod header;
pub mod headers;
pub mod stash;
pub mod stream;

pub type Result<T> = crate::error::MimeResult<T>;

pub use body::{MimeBody, PartInfo};
pub use content_type::{CharsetPolicy, ContentTypeHeader};
pub use encoding::TransferEncoding;
pub use header::MimeHeader;
pub use headers::MimeHeaders;
pub use stash::{FileStash, HybridStash, MemoryStash, StashManager};
