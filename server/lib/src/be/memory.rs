//! A backend that keeps its entries in a hash map. It enforces the tree rules a
//! real backend would (an entry needs its parent, names are unique) so the write
//! pipelines can be exercised end to end.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::prelude::*;

/// How many times each mutating call reached the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackendStats {
    pub adds: u64,
    pub renames: u64,
    pub modifies: u64,
}

pub struct MemoryBackend {
    id: String,
    base_dns: Vec<Dn>,
    writability: WritabilityMode,
    private: bool,
    supported_controls: BTreeSet<String>,
    entries: RwLock<HashMap<Dn, Entry>>,
    adds: AtomicU64,
    renames: AtomicU64,
    modifies: AtomicU64,
}

impl MemoryBackend {
    pub fn new(id: &str, base_dns: Vec<Dn>) -> Self {
        MemoryBackend {
            id: id.to_string(),
            base_dns,
            writability: WritabilityMode::Enabled,
            private: false,
            supported_controls: BTreeSet::new(),
            entries: RwLock::new(HashMap::new()),
            adds: AtomicU64::new(0),
            renames: AtomicU64::new(0),
            modifies: AtomicU64::new(0),
        }
    }

    pub fn with_writability(mut self, mode: WritabilityMode) -> Self {
        self.writability = mode;
        self
    }

    pub fn with_private(mut self, private: bool) -> Self {
        self.private = private;
        self
    }

    pub fn with_supported_controls<S: Into<String>>(
        mut self,
        oids: impl IntoIterator<Item = S>,
    ) -> Self {
        self.supported_controls = oids.into_iter().map(Into::into).collect();
        self
    }

    /// Store an entry without any checks, for loading initial content.
    pub fn load(&self, entry: Entry) {
        self.entries.write().insert(entry.dn().clone(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn stats(&self) -> BackendStats {
        BackendStats {
            adds: self.adds.load(Ordering::Relaxed),
            renames: self.renames.load(Ordering::Relaxed),
            modifies: self.modifies.load(Ordering::Relaxed),
        }
    }
}

impl Backend for MemoryBackend {
    fn backend_id(&self) -> &str {
        &self.id
    }

    fn base_dns(&self) -> &[Dn] {
        &self.base_dns
    }

    fn writability_mode(&self) -> WritabilityMode {
        self.writability
    }

    fn is_private(&self) -> bool {
        self.private
    }

    fn supports_control(&self, oid: &str) -> bool {
        self.supported_controls.contains(oid)
    }

    fn entry_exists(&self, dn: &Dn) -> Result<bool, DirectoryError> {
        Ok(self.entries.read().contains_key(dn))
    }

    fn get_entry(&self, dn: &Dn) -> Result<Option<Entry>, DirectoryError> {
        Ok(self.entries.read().get(dn).cloned())
    }

    fn search(&self, base: &Dn, filter: &Filter) -> Result<Vec<Entry>, DirectoryError> {
        let entries = self.entries.read();
        let mut found: Vec<Entry> = entries
            .values()
            .filter(|e| e.dn().is_within(base) && filter.matches(e))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.dn().cmp(b.dn()));
        Ok(found)
    }

    fn add_entry(&self, entry: &Entry, op: OperationRef<'_>) -> Result<(), DirectoryError> {
        let dn = entry.dn();
        let mut entries = self.entries.write();
        if entries.contains_key(dn) {
            return Err(DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("entry {dn} already exists in backend {}", self.id),
            ));
        }
        if !self.is_base_dn(dn) {
            let has_parent = dn.parent().map(|p| entries.contains_key(&p)).unwrap_or(false);
            if !has_parent {
                return Err(DirectoryError::no_such_object(format!(
                    "parent of {dn} does not exist in backend {}",
                    self.id
                )));
            }
        }
        entries.insert(dn.clone(), entry.clone());
        self.adds.fetch_add(1, Ordering::Relaxed);
        admin_debug!(backend = %self.id, op = %op.base().op_id, %dn, "entry added");
        Ok(())
    }

    fn rename_entry(
        &self,
        current_dn: &Dn,
        entry: &Entry,
        op: OperationRef<'_>,
    ) -> Result<(), DirectoryError> {
        let new_dn = entry.dn();
        let mut entries = self.entries.write();
        if !entries.contains_key(current_dn) {
            return Err(DirectoryError::no_such_object(format!(
                "entry {current_dn} does not exist in backend {}",
                self.id
            )));
        }
        if new_dn != current_dn && entries.contains_key(new_dn) {
            return Err(DirectoryError::new(
                ResultCode::EntryAlreadyExists,
                format!("entry {new_dn} already exists in backend {}", self.id),
            ));
        }

        let subordinates: Vec<Dn> = entries
            .keys()
            .filter(|k| *k != current_dn && k.is_within(current_dn))
            .cloned()
            .collect();

        entries.remove(current_dn);
        for old in subordinates {
            if let (Some(mut sub), Some(moved)) =
                (entries.remove(&old), old.rebase(current_dn, new_dn))
            {
                sub.set_dn(moved.clone());
                entries.insert(moved, sub);
            }
        }
        entries.insert(new_dn.clone(), entry.clone());
        self.renames.fetch_add(1, Ordering::Relaxed);
        admin_debug!(backend = %self.id, op = %op.base().op_id, from = %current_dn, to = %new_dn, "entry renamed");
        Ok(())
    }

    fn apply_modifications(&self, entry: &Entry, mods: &[Modification]) -> Result<(), DirectoryError> {
        let mut entries = self.entries.write();
        let Some(slot) = entries.get_mut(entry.dn()) else {
            return Err(DirectoryError::no_such_object(format!(
                "entry {} does not exist in backend {}",
                entry.dn(),
                self.id
            )));
        };
        *slot = entry.clone();
        self.modifies.fetch_add(1, Ordering::Relaxed);
        admin_debug!(backend = %self.id, dn = %entry.dn(), mods = mods.len(), "internal modification applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::add::AddOperation;
    use crate::testkit::*;

    #[test]
    fn test_memory_backend_tree_rules() {
        sketching::test_init();
        let be = MemoryBackend::new("userRoot", vec![dn("dc=example")]);
        let op = AddOperation::internal(entry_init!("dc=example"));
        let r = OperationRef::Add(&op);

        let base = entry_init!("dc=example", ("dc", "example"));
        assert!(be.add_entry(&base, r).is_ok());
        assert_eq!(
            be.add_entry(&base, r).map_err(|e| e.code),
            Err(ResultCode::EntryAlreadyExists)
        );

        let orphan = entry_init!("cn=Bob,ou=People,dc=example", ("cn", "Bob"));
        assert_eq!(
            be.add_entry(&orphan, r).map_err(|e| e.code),
            Err(ResultCode::NoSuchObject)
        );
        assert_eq!(be.stats().adds, 1);
        assert!(be.handles(&dn("cn=x,dc=example")));
        assert!(!be.handles(&dn("dc=other")));
    }

    #[test]
    fn test_memory_backend_subtree_rename() {
        sketching::test_init();
        let be = MemoryBackend::new("userRoot", vec![dn("dc=example")]);
        be.load(entry_init!("dc=example", ("dc", "example")));
        be.load(entry_init!("ou=People,dc=example", ("ou", "People")));
        be.load(entry_init!("cn=Bob,ou=People,dc=example", ("cn", "Bob")));

        let op = AddOperation::internal(entry_init!("dc=example"));
        let people = dn("ou=People,dc=example");
        let staff = entry_init!("ou=Staff,dc=example", ("ou", "Staff"));
        assert!(be.rename_entry(&people, &staff, OperationRef::Add(&op)).is_ok());

        assert_eq!(be.entry_exists(&people).ok(), Some(false));
        let bob = be
            .get_entry(&dn("cn=Bob,ou=Staff,dc=example"))
            .ok()
            .flatten()
            .map(|e| e.dn().to_string());
        assert_eq!(bob.as_deref(), Some("cn=Bob,ou=Staff,dc=example"));
        assert_eq!(be.len(), 3);

        let found = be
            .search(&dn("dc=example"), &crate::filter::f_eq("cn", "bob"))
            .map(|v| v.len());
        assert_eq!(found.ok(), Some(1));
    }
}
