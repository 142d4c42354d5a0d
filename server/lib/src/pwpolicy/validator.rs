//! Password validators decide whether a new clear text password is acceptable.
//! A rejection carries the reason that is returned to the client as the
//! diagnostic of a `CONSTRAINT_VIOLATION`.

use std::collections::BTreeMap;

use crate::prelude::*;

pub trait PasswordValidator: Send + Sync {
    fn id(&self) -> &str;

    fn validate(&self, password: &str, user_entry: &Entry) -> Result<(), String>;
}

/// Bounds the number of characters. A maximum of zero means no upper bound.
#[derive(Debug, Clone)]
pub struct LengthValidator {
    id: String,
    min: usize,
    max: usize,
}

impl LengthValidator {
    pub fn new(id: &str, min: usize, max: usize) -> Self {
        LengthValidator {
            id: id.to_string(),
            min,
            max,
        }
    }
}

impl PasswordValidator for LengthValidator {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self, password: &str, _user_entry: &Entry) -> Result<(), String> {
        let len = password.chars().count();
        if len < self.min {
            return Err(format!(
                "the password is shorter than the minimum of {} characters",
                self.min
            ));
        }
        if self.max > 0 && len > self.max {
            return Err(format!(
                "the password is longer than the maximum of {} characters",
                self.max
            ));
        }
        Ok(())
    }
}

/// Requires a minimum number of characters from each configured set.
#[derive(Debug, Clone)]
pub struct CharacterSetValidator {
    id: String,
    sets: Vec<(String, usize)>,
    allow_unclassified: bool,
}

impl CharacterSetValidator {
    pub fn new(id: &str, sets: Vec<(String, usize)>, allow_unclassified: bool) -> Self {
        CharacterSetValidator {
            id: id.to_string(),
            sets,
            allow_unclassified,
        }
    }

    /// Lowercase, uppercase, digits and punctuation, one of each.
    pub fn standard(id: &str) -> Self {
        CharacterSetValidator::new(
            id,
            vec![
                ("abcdefghijklmnopqrstuvwxyz".to_string(), 1),
                ("ABCDEFGHIJKLMNOPQRSTUVWXYZ".to_string(), 1),
                ("0123456789".to_string(), 1),
                ("!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~".to_string(), 1),
            ],
            true,
        )
    }
}

impl PasswordValidator for CharacterSetValidator {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self, password: &str, _user_entry: &Entry) -> Result<(), String> {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for c in password.chars() {
            match self.sets.iter().position(|(set, _)| set.contains(c)) {
                Some(i) => *counts.entry(i).or_default() += 1,
                None if self.allow_unclassified => {}
                None => {
                    return Err(format!(
                        "the password contains the character {c:?} which is not allowed"
                    ))
                }
            }
        }
        for (i, (set, min)) in self.sets.iter().enumerate() {
            if counts.get(&i).copied().unwrap_or(0) < *min {
                return Err(format!(
                    "the password must contain at least {min} characters from {set:?}"
                ));
            }
        }
        Ok(())
    }
}

/// Rejects guessable passwords using the zxcvbn estimator. Values of the
/// related attributes of the user (their names, uid, mail) are fed to the
/// estimator so a password built from them scores low.
#[derive(Debug, Clone)]
pub struct StrengthValidator {
    id: String,
    min_score: u8,
    related_attributes: Vec<String>,
}

impl StrengthValidator {
    pub fn new(id: &str, min_score: u8, related_attributes: Vec<String>) -> Self {
        StrengthValidator {
            id: id.to_string(),
            min_score: min_score.min(4),
            related_attributes,
        }
    }
}

impl PasswordValidator for StrengthValidator {
    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self, password: &str, user_entry: &Entry) -> Result<(), String> {
        let related_inputs: Vec<&str> = self
            .related_attributes
            .iter()
            .flat_map(|a| user_entry.get_values(a))
            .collect();

        let entropy = zxcvbn::zxcvbn(password, &related_inputs).map_err(|e| {
            admin_error!("zxcvbn check failure (password empty?) {:?}", e);
            "the password is empty".to_string()
        })?;

        if entropy.score() < self.min_score {
            let suggestions: Vec<String> = entropy
                .feedback()
                .as_ref()
                .map(|f| f.suggestions().iter().map(|s| format!("{s:?}")).collect())
                .unwrap_or_default();
            security_info!(score = entropy.score(), ?suggestions, "password quality feedback");
            return Err(format!(
                "the password is too easy to guess (score {} of a required {})",
                entropy.score(),
                self.min_score
            ));
        }
        Ok(())
    }
}
