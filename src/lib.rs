//! `mimetrust`: streaming MIME multipart parsing and certificate trust
//! validation.
//!
//! [`mime`] parses multipart bodies lazily: parts are discovered in order as
//! they are requested, and the bytes of parts already passed are kept in a
//! pluggable stash (memory, temp files, or memory spilling to disk).
//!
//! [`pkix`] validates certificates against a set of trusted certificates,
//! building a path to a trust anchor and checking each step for revocation
//! via cached CRLs and OCSP responses, as configured per issuer.

pub mod config;
pub mod error;
pub mod mime;
pub mod pkix;
