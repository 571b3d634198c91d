//! Busy/Consuming flag discipline

use crate::domain::SessionError;

/// What, if anything, currently holds a session's engine
///
/// `busy` is held by a control operation from dispatch until its completion
/// is delivered. `consuming` is held by a data walk for the duration of one
/// synchronous call. The two are never set together.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionFlags {
    busy: bool,
    consuming: bool,
}

impl SessionFlags {
    /// Flags of a session whose connection is still being opened
    #[must_use]
    pub(crate) fn opening() -> Self {
        Self { busy: true, consuming: false }
    }

    #[must_use]
    pub fn is_idle(self) -> bool {
        !self.busy && !self.consuming
    }

    #[must_use]
    pub fn is_busy(self) -> bool {
        self.busy
    }

    #[must_use]
    pub fn is_consuming(self) -> bool {
        self.consuming
    }

    /// Fail with [`SessionError::Busy`] unless idle
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] if either flag is set
    pub fn ensure_idle(self) -> Result<(), SessionError> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(SessionError::Busy)
        }
    }

    /// Flags after a control operation is dispatched
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] if either flag is already set
    pub fn begin_busy(self) -> Result<Self, SessionError> {
        self.ensure_idle()?;
        Ok(Self { busy: true, ..self }.checked())
    }

    /// Flags after a data walk starts
    ///
    /// # Errors
    /// Returns [`SessionError::Busy`] if either flag is already set
    pub fn begin_consuming(self) -> Result<Self, SessionError> {
        self.ensure_idle()?;
        Ok(Self { consuming: true, ..self }.checked())
    }

    #[must_use]
    pub fn end_busy(self) -> Self {
        debug_assert!(self.busy, "completion delivered without a control operation");
        Self { busy: false, ..self }.checked()
    }

    #[must_use]
    pub fn end_consuming(self) -> Self {
        debug_assert!(self.consuming, "data walk ended without starting");
        Self { consuming: false, ..self }.checked()
    }

    fn checked(self) -> Self {
        debug_assert!(!(self.busy && self.consuming), "session both busy and consuming");
        self
    }
}
