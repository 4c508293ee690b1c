// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for etl-lifecycle.

use thiserror::Error;

use crate::model::{VersionKey, VersionStatus};

/// Lifecycle engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Record store operation failed.
    #[error("Store error: {0}")]
    Store(#[from] crate::store::StoreError),

    /// Execution registry or monitoring call failed.
    #[error("Registry error: {0}")]
    Registry(#[from] crate::registry::RegistryError),

    /// A status change not present in the lifecycle state machine was requested.
    #[error("Illegal status transition {from} -> {to}")]
    IllegalTransition {
        /// Current status.
        from: VersionStatus,
        /// Requested status.
        to: VersionStatus,
    },

    /// Project version was not found.
    #[error("Project version not found: {0}")]
    VersionNotFound(VersionKey),

    /// General check was not found on the version.
    #[error("General check {check_id} not found on version {key}")]
    CheckNotFound {
        /// Version the check was expected on.
        key: VersionKey,
        /// Missing check id.
        check_id: i64,
    },
}

/// Result type using the lifecycle Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VersionLabel;
    use crate::store::StoreError;

    #[test]
    fn test_store_error_converts_with_context() {
        let err: Error = StoreError::VersionNotFound(3).into();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(err.to_string(), "Store error: Version 3 not found");
    }

    #[test]
    fn test_check_not_found_names_version() {
        let key = VersionKey::new(10, VersionLabel::FIRST);
        let err = Error::CheckNotFound { key, check_id: 7 };
        assert!(err.to_string().contains("General check 7"));
    }
}
