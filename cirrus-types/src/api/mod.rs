//! Wire types of the gateway RPCs the download engine calls. Each module is
//! one request: a `Request` body and the `Response` it decodes to. Responses
//! carry `result = 0` on success; non-zero codes map through
//! [`crate::error::ResponseError`].

pub mod checksums;
pub mod file_link;
pub mod file_meta;
pub mod revision;
