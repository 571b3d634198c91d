//! # Error Channel
//!
//! Per-session outcome and message shared by every operation.
//!
//! An operation starts by calling [`ErrorChannel::clear`], which leaves the
//! channel *failed with no message*. The operation must then prove success
//! with [`ErrorChannel::succeed`] or record why it failed. Anything that
//! returns without doing either surfaces as a generic
//! `unknown error (errno = N, ...)` built from the last OS error.

use crate::decode::record::truncate_at_boundary;
use crate::domain::{DecodeError, SessionError};

/// Capacity of the error message buffer, including the terminator
pub const ERROR_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorChannel {
    failed: bool,
    message: String,
    decode: Option<DecodeError>,
}

impl ErrorChannel {
    /// Reset to the failure sentinel with no message
    pub fn clear(&mut self) {
        self.failed = true;
        self.message.clear();
        self.decode = None;
    }

    pub fn succeed(&mut self) {
        self.failed = false;
    }

    /// Record a failure; the message is bounded to the channel's capacity
    pub fn fail(&mut self, message: impl Into<String>) {
        let mut message = message.into();
        let trimmed = message.trim_end().len();
        message.truncate(trimmed);
        truncate_at_boundary(&mut message, ERROR_MESSAGE_LEN - 1);
        self.failed = true;
        self.message = message;
    }

    /// Record a decode failure, keeping the structured error
    pub fn fail_decode(&mut self, error: DecodeError) {
        self.fail(error.to_string());
        self.decode = Some(error);
    }

    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Synthesize a message if the channel failed without one
    pub fn canonicalize(&mut self) {
        if self.failed && self.message.is_empty() {
            let os = std::io::Error::last_os_error();
            let errno = os.raw_os_error().unwrap_or(0);
            let text = os.to_string();
            let reason = text.strip_suffix(&format!(" (os error {errno})")).unwrap_or(&text);
            self.fail(format!("unknown error (errno = {errno}, {reason})"));
        }
    }

    /// Canonicalize and convert the outcome into a result
    ///
    /// # Errors
    /// Returns the recorded failure, as a decode error when one was recorded
    pub fn outcome(&mut self) -> Result<(), SessionError> {
        self.canonicalize();
        if !self.failed {
            return Ok(());
        }
        Err(match &self.decode {
            Some(decode) => SessionError::Decode(decode.clone()),
            None => SessionError::Operation(self.message.clone()),
        })
    }
}
