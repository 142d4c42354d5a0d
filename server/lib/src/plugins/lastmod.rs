//! Maintains the last modification attributes. Adds are stamped with
//! `createTimestamp` and `creatorsName`, renames carry `modifyTimestamp` and
//! `modifiersName` replacements appended to their modification list.

use crate::modify::m_replace;
use crate::plugins::{Plugin, PluginResult};
use crate::prelude::*;
use crate::server::add::AddOperation;
use crate::server::modifydn::ModifyDnOperation;

pub const ATTR_CREATORS_NAME: &str = "creatorsName";
pub const ATTR_MODIFY_TIMESTAMP: &str = "modifyTimestamp";
pub const ATTR_MODIFIERS_NAME: &str = "modifiersName";

#[derive(Debug, Default)]
pub struct LastModPlugin;

fn actor(op: &Operation) -> String {
    op.effective_identity()
        .dn
        .as_ref()
        .map(|dn| dn.to_string())
        .unwrap_or_default()
}

impl Plugin for LastModPlugin {
    fn id(&self) -> &'static str {
        "plugin_lastmod"
    }

    fn pre_operation_add(&self, op: &mut AddOperation) -> PluginResult {
        let now = GeneralizedTime::format(op.base.current_time());
        let creator = actor(&op.base);
        if let Some(e) = op.entry_mut() {
            // Replicated entries keep the values of the originating server.
            if !e.has_attribute(ATTR_CREATE_TIMESTAMP) {
                e.add_values(ATTR_CREATE_TIMESTAMP, true, [now]);
            }
            if !e.has_attribute(ATTR_CREATORS_NAME) {
                e.add_values(ATTR_CREATORS_NAME, true, [creator]);
            }
        }
        PluginResult::Continue
    }

    fn pre_operation_modify_dn(&self, op: &mut ModifyDnOperation) -> PluginResult {
        let now = GeneralizedTime::format(op.base.current_time());
        let modifier = actor(&op.base);
        op.add_modification(m_replace(ATTR_MODIFY_TIMESTAMP, [now]));
        op.add_modification(m_replace(ATTR_MODIFIERS_NAME, [modifier]));
        PluginResult::Continue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::PluginPipeline;
    use crate::testkit::*;

    #[test]
    fn test_lastmod_stamps_add() {
        sketching::test_init();
        let env = test_env_with(|b| b.plugins(PluginPipeline::new().with(Arc::new(LastModPlugin))));
        let mut op = AddOperation::new(admin_operation(), carol_entry());
        let r = op.run(&env.ctx);
        assert_result!(r, ResultCode::Success);

        let stored = env.backend.get_entry(&dn(CAROL_DN)).ok().flatten();
        let stored = stored.as_ref();
        assert_eq!(
            stored.and_then(|e| e.first_value(ATTR_CREATORS_NAME)),
            Some(ADMIN_DN)
        );
        assert!(stored
            .and_then(|e| e.first_value(ATTR_CREATE_TIMESTAMP))
            .map(|v| GeneralizedTime::parse(v).is_ok())
            .unwrap_or(false));
        assert_eq!(
            stored.map(|e| e.is_operational(ATTR_CREATE_TIMESTAMP)),
            Some(true)
        );
    }

    #[test]
    fn test_lastmod_appends_rename_modifications() {
        sketching::test_init();
        let env = test_env_with(|b| b.plugins(PluginPipeline::new().with(Arc::new(LastModPlugin))));
        let mut op = ModifyDnOperation::new(admin_operation(), dn(BOB_DN), rdn("cn=Robert"), true, None);
        let r = op.run(&env.ctx);
        assert_result!(r, ResultCode::Success);

        // The RDN changes come first, then what the plugin appended.
        let kinds: Vec<String> = op.modifications().iter().map(|m| m.to_string()).collect();
        assert_eq!(kinds.len(), 4);
        assert!(kinds[2].starts_with("replace: modifyTimestamp"));
        assert!(kinds[3].starts_with("replace: modifiersName"));

        let stored = env
            .backend
            .get_entry(&dn("cn=Robert,ou=People,dc=example,dc=com"))
            .ok()
            .flatten();
        assert_eq!(
            stored.as_ref().and_then(|e| e.first_value(ATTR_MODIFIERS_NAME)),
            Some(ADMIN_DN)
        );
    }
}
