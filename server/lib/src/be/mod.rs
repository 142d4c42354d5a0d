//! The backend is the storage collaborator of the write pipelines. The core only
//! ever talks to it through [`Backend`]: existence checks and entry reads while
//! validating, then exactly one mutating call once every check has passed.
//!
//! A backend serves one or more base DNs (naming contexts). The server context
//! routes a DN to the backend with the longest matching base DN.

use serde::Deserialize;

use crate::prelude::*;

pub mod memory;

pub use self::memory::MemoryBackend;

/// Whether a backend (or the whole server) accepts writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritabilityMode {
    #[default]
    Enabled,
    Disabled,
    /// Only internal and synchronization operations may write.
    InternalOnly,
}

impl WritabilityMode {
    /// Check a write against this mode.
    pub fn permits(self, internal_or_sync: bool) -> bool {
        match self {
            WritabilityMode::Enabled => true,
            WritabilityMode::Disabled => false,
            WritabilityMode::InternalOnly => internal_or_sync,
        }
    }
}

pub trait Backend: Send + Sync {
    fn backend_id(&self) -> &str;

    /// The naming contexts held by this backend.
    fn base_dns(&self) -> &[Dn];

    fn writability_mode(&self) -> WritabilityMode;

    /// Private backends hold server data (configuration, monitoring) and are not
    /// subject to writability checks.
    fn is_private(&self) -> bool {
        false
    }

    fn supports_control(&self, oid: &str) -> bool;

    fn entry_exists(&self, dn: &Dn) -> Result<bool, DirectoryError>;

    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError>;

    /// Entries at or below `base` that match `filter`, used to map
    /// authorization identities to entries.
    fn search(&self, base: &Dn, filter: &Filter) -> Result<Vec<Entry>, DirectoryError>;

    fn add_entry(&self, entry: &Entry, op: OperationRef<'_>) -> Result<(), DirectoryError>;

    /// Store `entry` (which carries the new DN) in place of the entry at
    /// `current_dn`, moving any subordinate entries with it.
    fn rename_entry(
        &self,
        current_dn: &Dn,
        entry: &Entry,
        op: OperationRef<'_>,
    ) -> Result<(), DirectoryError>;

    /// An internal update. `entry` already has `mods` applied; the list is what
    /// a change log or replication would record.
    fn apply_modifications(&self, entry: &Entry, mods: &[Modification]) -> Result<(), DirectoryError>;

    fn handles(&self, dn: &Dn) -> bool {
        self.base_dns().iter().any(|b| dn.is_within(b))
    }

    fn is_base_dn(&self, dn: &Dn) -> bool {
        self.base_dns().iter().any(|b| b == dn)
    }
}
