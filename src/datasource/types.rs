//! Public types for the datasource facade.

/// Datasource lifecycle state.
///
/// Foreground operations work in every state; the state only tracks the
/// background jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatasourceState {
    /// Created, background jobs not started
    Created,
    /// Background jobs running
    Running,
    /// Jobs stopped, pending file removals flushed
    ShutDown,
}

impl std::fmt::Display for DatasourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShutDown => write!(f, "ShutDown"),
        }
    }
}

/// How `store` treats timestamps and unknown ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StoreMode {
    /// Stamp from the clock; a set id must already exist.
    Stamp,
    /// Keep the caller's `updated_at`; a set but unknown id is inserted as is.
    Replicate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(DatasourceState::Created.to_string(), "Created");
        assert_eq!(DatasourceState::Running.to_string(), "Running");
        assert_eq!(DatasourceState::ShutDown.to_string(), "ShutDown");
    }
}
