//! Human-readable site identifiers

use crate::registry::Registry;
use fossorial_common::{Error, Result};
use once_cell::sync::Lazy;
use rand::seq::SliceRandom;

const MAX_ATTEMPTS: usize = 64;

static ADJECTIVES: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "amber", "ancient", "autumn", "bold", "brave", "brisk", "calm", "clever",
        "cold", "crimson", "curious", "dapper", "deep", "dusty", "eager", "early",
        "fancy", "fierce", "frosty", "gentle", "golden", "grand", "hidden", "hollow",
        "humble", "icy", "jolly", "keen", "lively", "lone", "lucky", "mellow",
        "misty", "noble", "odd", "patient", "plucky", "proud", "quick", "quiet",
        "rapid", "rustic", "sandy", "shy", "silent", "silver", "sly", "steady",
        "stout", "sunny", "swift", "tidy", "tiny", "vast", "wandering", "wild",
        "wise", "witty", "young", "zesty",
    ]
});

static NOUNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "aardvark", "armadillo", "badger", "beaver", "chipmunk", "coyote", "dingo",
        "echidna", "ferret", "fox", "gecko", "gopher", "groundhog", "hamster",
        "hare", "hedgehog", "jackal", "jerboa", "kiwi", "lemming", "marmot",
        "meerkat", "mink", "mole", "mongoose", "muskrat", "numbat", "ocelot",
        "otter", "pangolin", "platypus", "porcupine", "possum",
        "puffin", "quokka", "rabbit", "raccoon", "salamander", "shrew", "skunk",
        "squirrel", "stoat", "tarsier", "tortoise", "vole", "wallaby", "weasel",
        "wolverine", "wombat",
    ]
});

/// Random `adjective-noun` pair
pub fn random_nice_id() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("quiet");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("badger");
    format!("{}-{}", adjective, noun)
}

/// Nice id not yet used by any site in the org
pub fn unique_site_nice_id(registry: &Registry, org_id: &str) -> Result<String> {
    for _ in 0..MAX_ATTEMPTS {
        let candidate = random_nice_id();
        if !registry.nice_id_taken(org_id, &candidate)? {
            return Ok(candidate);
        }
    }
    Err(Error::Internal(format!(
        "could not find a free site name in org {} after {} attempts",
        org_id, MAX_ATTEMPTS
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fossorial_common::Database;

    #[test]
    fn test_nice_id_shape() {
        for _ in 0..100 {
            let id = random_nice_id();
            let (adjective, noun) = id.split_once('-').unwrap();
            assert!(ADJECTIVES.contains(&adjective));
            assert!(NOUNS.contains(&noun));
        }
    }

    #[test]
    fn test_unique_in_org() {
        let registry = Registry::new(Database::open_memory().unwrap());
        registry.create_org("acme", "Acme").unwrap();
        let id = unique_site_nice_id(&registry, "acme").unwrap();
        assert!(!registry.nice_id_taken("acme", &id).unwrap());
    }
}
