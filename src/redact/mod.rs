//! Redaction of sensitive data.
//!
//! Secrets and personal data are removed on the producer side before an
//! event ever leaves the process. The same engine runs again in the gateway
//! and over provider output before anything is persisted.

mod rules;
mod scrubber;

pub use scrubber::Redactor;
