//! Password generators produce a new clear text password, for example when an
//! administrator resets a password without supplying one.

use rand::distributions::Distribution;
use rand::{thread_rng, Rng};

use crate::prelude::*;

pub trait PasswordGenerator: Send + Sync {
    fn id(&self) -> &str;

    fn generate_password(&self, user_entry: &Entry) -> Result<String, DirectoryError>;
}

/// Letters and digits that are hard to confuse with each other.
#[derive(Debug)]
pub struct DistinctAlpha;

impl Distribution<char> for DistinctAlpha {
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> char {
        const RANGE: u32 = 55;
        const GEN_ASCII_STR_CHARSET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ\
                abcdefghjkpqrstuvwxyz\
                0123456789";
        loop {
            let var = rng.next_u32() >> (32 - 6);
            if var < RANGE {
                return GEN_ASCII_STR_CHARSET[var as usize] as char;
            }
        }
    }
}

/// Generates `groups` groups of `group_len` characters joined by `-`.
#[derive(Debug, Clone)]
pub struct RandomPasswordGenerator {
    id: String,
    groups: usize,
    group_len: usize,
}

impl RandomPasswordGenerator {
    pub fn new(id: &str, groups: usize, group_len: usize) -> Self {
        RandomPasswordGenerator {
            id: id.to_string(),
            groups: groups.max(1),
            group_len: group_len.max(1),
        }
    }
}

impl PasswordGenerator for RandomPasswordGenerator {
    fn id(&self) -> &str {
        &self.id
    }

    fn generate_password(&self, _user_entry: &Entry) -> Result<String, DirectoryError> {
        let mut trng = thread_rng();
        let groups: Vec<String> = (0..self.groups)
            .map(|_| {
                (&mut trng)
                    .sample_iter(&DistinctAlpha)
                    .take(self.group_len)
                    .collect::<String>()
            })
            .collect();
        Ok(groups.join("-"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_generator_shape() {
        sketching::test_init();
        let e = entry_init!("cn=Bob,dc=example", ("cn", "Bob"));
        let g = RandomPasswordGenerator::new("random", 4, 5);
        let a = g.generate_password(&e).expect("generate");
        let b = g.generate_password(&e).expect("generate");
        assert_eq!(a.len(), 4 * 5 + 3);
        assert_eq!(a.split('-').count(), 4);
        assert!(a.chars().all(|c| c == '-' || c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }
}
