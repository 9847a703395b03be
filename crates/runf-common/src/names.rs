//! Human-readable container names.
//!
//! The runtime only needs *some* unique identifier per launch; the
//! [`NameProvider`] trait keeps the generator swappable.

use crate::types::ContainerId;

/// Supplies a unique, human-readable identifier for each launch.
pub trait NameProvider {
    /// Returns the next container identifier.
    fn next_name(&self) -> ContainerId;
}

const ADJECTIVES: &[&str] = &[
    "admiring", "brave", "clever", "dazzling", "eager", "festive", "focused", "gifted",
    "happy", "jolly", "keen", "lucid", "modest", "nifty", "optimistic", "peaceful",
    "quirky", "relaxed", "serene", "tender", "upbeat", "vibrant", "wizardly", "zealous",
];

const SURNAMES: &[&str] = &[
    "archimedes", "babbage", "curie", "dijkstra", "euclid", "feynman", "goldwasser",
    "hopper", "kepler", "lamport", "lovelace", "mccarthy", "noether", "pike", "ritchie",
    "shannon", "thompson", "turing", "wilson", "wozniak",
];

/// Picks `adjective_surname` names from fixed word lists.
///
/// Entropy comes from a v4 UUID; a short hex suffix keeps collisions
/// unlikely once the word combinations run out.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomNames {
    /// Append a four-hex-digit suffix to every name.
    pub with_suffix: bool,
}

impl NameProvider for RandomNames {
    fn next_name(&self) -> ContainerId {
        let bytes = *uuid::Uuid::new_v4().as_bytes();
        let adjective = ADJECTIVES[usize::from(bytes[0]) % ADJECTIVES.len()];
        let surname = SURNAMES[usize::from(bytes[1]) % SURNAMES.len()];
        if self.with_suffix {
            ContainerId::new(format!("{adjective}_{surname}_{:02x}{:02x}", bytes[2], bytes[3]))
        } else {
            ContainerId::new(format!("{adjective}_{surname}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_valid_container_ids() {
        let names = RandomNames { with_suffix: true };
        for _ in 0..32 {
            let id = names.next_name();
            assert!(id.validate().is_ok(), "{id}");
        }
    }

    #[test]
    fn names_have_adjective_and_surname() {
        let id = RandomNames::default().next_name();
        let (adjective, surname) = id.as_str().split_once('_').unwrap();
        assert!(ADJECTIVES.contains(&adjective));
        assert!(SURNAMES.contains(&surname));
    }
}
