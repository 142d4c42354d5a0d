//! Collaborators told about completed writes, and the identity mapper used to
//! resolve `u:` authorization identities.
//!
//! Listener failures never change the result of an operation. A persistent
//! search that fails is deregistered.

use crate::prelude::*;
use crate::server::add::AddOperation;
use crate::server::modifydn::ModifyDnOperation;

/// Told about every successful add and rename, before the response is sent.
pub trait ChangeNotificationListener: Send + Sync {
    fn handle_add(&self, op: &AddOperation, entry: &Entry) -> Result<(), DirectoryError>;

    fn handle_modify_dn(
        &self,
        op: &ModifyDnOperation,
        old_entry: &Entry,
        new_entry: &Entry,
    ) -> Result<(), DirectoryError>;
}

/// A client search that stays open and is sent matching changes, after the
/// response of the write that caused them.
pub trait PersistentSearch: Send + Sync {
    fn id(&self) -> &str;

    fn process_add(&self, op: &AddOperation, entry: &Entry) -> Result<(), DirectoryError>;

    fn process_modify_dn(
        &self,
        op: &ModifyDnOperation,
        old_entry: &Entry,
        new_entry: &Entry,
    ) -> Result<(), DirectoryError>;
}

/// Maps the name in a `u:` authorization identity to an entry.
pub trait IdentityMapper: Send + Sync {
    fn map_identity(
        &self,
        ctx: &ServerContext,
        name: &str,
    ) -> Result<Option<Entry>, DirectoryError>;
}

/// Finds the single entry whose value of one of `attributes` equals the name.
/// More than one match is an error since the identity would be ambiguous.
#[derive(Debug, Clone)]
pub struct ExactMatchIdentityMapper {
    attributes: Vec<String>,
    bases: Vec<Dn>,
}

impl ExactMatchIdentityMapper {
    /// With no bases every naming context is searched.
    pub fn new(attributes: Vec<String>, bases: Vec<Dn>) -> Self {
        ExactMatchIdentityMapper { attributes, bases }
    }
}

impl Default for ExactMatchIdentityMapper {
    fn default() -> Self {
        ExactMatchIdentityMapper::new(vec![ATTR_UID.to_string()], Vec::new())
    }
}

impl IdentityMapper for ExactMatchIdentityMapper {
    fn map_identity(
        &self,
        ctx: &ServerContext,
        name: &str,
    ) -> Result<Option<Entry>, DirectoryError> {
        let filter = Filter::Or(
            self.attributes
                .iter()
                .map(|a| Filter::Eq(a.clone(), name.to_string()))
                .collect(),
        );

        let mut found: Vec<Entry> = Vec::new();
        for be in ctx.backends() {
            let bases: Vec<Dn> = if self.bases.is_empty() {
                be.base_dns().to_vec()
            } else {
                self.bases.iter().filter(|b| be.handles(b)).cloned().collect()
            };
            for base in bases {
                found.extend(be.search(&base, &filter)?);
            }
        }
        found.dedup_by(|a, b| a.dn() == b.dn());

        match found.len() {
            0 => Ok(None),
            1 => Ok(found.pop()),
            n => Err(DirectoryError::new(
                ResultCode::AuthorizationDenied,
                format!("the identity {name:?} maps to {n} entries"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::*;

    #[test]
    fn test_exact_match_identity_mapper() {
        sketching::test_init();
        let env = setup_test_env();
        let mapper = ExactMatchIdentityMapper::default();

        let found = mapper.map_identity(&env.ctx, "bob").ok().flatten();
        assert_eq!(found.map(|e| e.dn().clone()), Some(dn(BOB_DN)));
        assert_eq!(mapper.map_identity(&env.ctx, "nobody").ok(), Some(None));

        let twice = entry_init!(
            "uid=bob,ou=Groups,dc=example,dc=com",
            (ATTR_OBJECTCLASS, "extensibleObject"),
            ("uid", "bob")
        );
        env.backend.load(twice);
        assert_eq!(
            mapper.map_identity(&env.ctx, "bob").map_err(|e| e.code),
            Err(ResultCode::AuthorizationDenied)
        );
    }
}
