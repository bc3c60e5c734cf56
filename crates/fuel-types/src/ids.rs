//! Short-id generation for tasks, epics, reviews and runs.
//!
//! Ids are a one-character prefix, a dash, and six lowercase base32
//! characters (`f-k3n2pa`). They are unique within a project, not globally.

use rand::Rng;

/// RFC 4648 base32 alphabet, lowercased. No padding.
const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";

const SUFFIX_LEN: usize = 6;

pub const TASK_PREFIX: &str = "f-";
pub const EPIC_PREFIX: &str = "e-";
pub const REVIEW_PREFIX: &str = "r-";
pub const RUN_PREFIX: &str = "x-";

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

pub fn new_task_id() -> String {
    format!("{}{}", TASK_PREFIX, random_suffix())
}

pub fn new_epic_id() -> String {
    format!("{}{}", EPIC_PREFIX, random_suffix())
}

pub fn new_review_id() -> String {
    format!("{}{}", REVIEW_PREFIX, random_suffix())
}

pub fn new_run_id() -> String {
    format!("{}{}", RUN_PREFIX, random_suffix())
}

/// Whether `id` is a well-formed short id for the given prefix.
pub fn is_valid(id: &str, prefix: &str) -> bool {
    id.strip_prefix(prefix)
        .map(|rest| rest.len() == SUFFIX_LEN && rest.bytes().all(|b| ALPHABET.contains(&b)))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_well_formed() {
        for _ in 0..32 {
            assert!(is_valid(&new_task_id(), TASK_PREFIX));
            assert!(is_valid(&new_epic_id(), EPIC_PREFIX));
            assert!(is_valid(&new_review_id(), REVIEW_PREFIX));
        }
    }

    #[test]
    fn rejects_wrong_prefix_and_bad_chars() {
        assert!(!is_valid("e-abc234", TASK_PREFIX));
        assert!(!is_valid("f-ABC234", TASK_PREFIX));
        assert!(!is_valid("f-abc23", TASK_PREFIX));
        assert!(!is_valid("f-abc2345", TASK_PREFIX));
        assert!(!is_valid("f-ab0123", TASK_PREFIX)); // 0 and 1 are not in the alphabet
    }
}
