//! Ledger database options.

/// Options for opening a ledger database.
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// Whether to create the snapshot directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to write a snapshot after every commit.
    pub persist_on_commit: bool,

    /// Largest captured value the normal capture path can read, in bytes.
    ///
    /// Reads that hit a longer value fail with a truncation error unless
    /// big-LOB mode is requested. `None` means unlimited.
    pub lob_capture_limit: Option<usize>,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            persist_on_commit: true,
            lob_capture_limit: None,
        }
    }
}

impl DatabaseOptions {
    /// Creates options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the directory if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether every commit writes a snapshot.
    #[must_use]
    pub const fn persist_on_commit(mut self, value: bool) -> Self {
        self.persist_on_commit = value;
        self
    }

    /// Sets the capture limit for the normal read path.
    #[must_use]
    pub const fn lob_capture_limit(mut self, limit: Option<usize>) -> Self {
        self.lob_capture_limit = limit;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_options() {
        let options = DatabaseOptions::default();
        assert!(options.create_if_missing);
        assert!(options.persist_on_commit);
        assert!(options.lob_capture_limit.is_none());
    }

    #[test]
    fn builder_pattern() {
        let options = DatabaseOptions::new()
            .create_if_missing(false)
            .lob_capture_limit(Some(4000));
        assert!(!options.create_if_missing);
        assert_eq!(options.lob_capture_limit, Some(4000));
    }
}
