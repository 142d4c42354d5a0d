//! Attribute level modifications. The rename pipeline records the changes it
//! makes to the renamed entry as a list of these, and the password policy
//! engine collects them in deferred mode to persist its state in one internal
//! update.

use std::fmt;

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ModificationType {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl fmt::Display for ModificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ModificationType::Add => "add",
            ModificationType::Delete => "delete",
            ModificationType::Replace => "replace",
            ModificationType::Increment => "increment",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub mod_type: ModificationType,
    pub attribute: Attribute,
}

impl Modification {
    pub fn new(mod_type: ModificationType, attribute: Attribute) -> Self {
        Modification {
            mod_type,
            attribute,
        }
    }
}

impl fmt::Display for Modification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {:?}",
            self.mod_type,
            self.attribute.description(),
            self.attribute.values()
        )
    }
}

pub fn m_add<V: Into<String>>(attr: &str, values: impl IntoIterator<Item = V>) -> Modification {
    Modification::new(ModificationType::Add, Attribute::new(attr, values))
}

/// Delete the listed values, or the whole attribute when `values` is empty.
pub fn m_delete<V: Into<String>>(attr: &str, values: impl IntoIterator<Item = V>) -> Modification {
    Modification::new(ModificationType::Delete, Attribute::new(attr, values))
}

pub fn m_replace<V: Into<String>>(attr: &str, values: impl IntoIterator<Item = V>) -> Modification {
    Modification::new(ModificationType::Replace, Attribute::new(attr, values))
}

pub fn m_increment(attr: &str, by: i64) -> Modification {
    Modification::new(
        ModificationType::Increment,
        Attribute::new(attr, [by.to_string()]),
    )
}
