//! Canonical gender and species labels. Free-form classifier output is mapped
//! onto the closest known label by Jaro-Winkler similarity.

use strsim::jaro_winkler;

/// Minimum similarity for a fuzzy match.
const MATCH_THRESHOLD: f64 = 0.88;

pub const FALLBACK: &str = "other";

const GENDERS: &[(&str, &[&str])] = &[
    ("female", &["woman", "girl", "feminine", "lady"]),
    ("male", &["man", "boy", "masculine", "guy"]),
    ("nonbinary", &["non-binary", "androgynous", "enby", "agender"]),
];

const SPECIES: &[(&str, &[&str])] = &[
    ("human", &["person", "humanoid"]),
    ("elf", &["elven", "high elf", "dark elf", "half-elf"]),
    ("demon", &["devil", "succubus", "incubus", "oni"]),
    ("angel", &["seraph", "celestial"]),
    ("vampire", &["vampiric"]),
    ("werewolf", &["lycan", "lycanthrope"]),
    ("kemonomimi", &["catgirl", "cat girl", "foxgirl", "fox girl", "nekomimi", "kitsune", "animal ears"]),
    ("dragon", &["dragonkin", "dragon girl", "draconic"]),
    ("android", &["robot", "cyborg", "gynoid", "mecha"]),
    ("fairy", &["fae", "faerie", "pixie"]),
    ("orc", &["half-orc"]),
    ("mermaid", &["merfolk", "siren", "merman"]),
    ("undead", &["zombie", "ghost", "lich", "skeleton"]),
    ("anthro", &["furry", "anthropomorphic"]),
];

pub fn normalize_gender(raw: &str) -> String {
    normalize(raw, GENDERS)
}

pub fn normalize_species(raw: &str) -> String {
    normalize(raw, SPECIES)
}

fn normalize(raw: &str, table: &[(&'static str, &[&'static str])]) -> String {
    let needle = raw.trim().to_lowercase();
    if needle.is_empty() {
        return FALLBACK.to_string();
    }

    let mut best: Option<(&str, f64)> = None;
    for (canonical, aliases) in table {
        for candidate in std::iter::once(canonical).chain(aliases.iter()) {
            if needle == *candidate {
                return canonical.to_string();
            }
            let score = jaro_winkler(&needle, candidate);
            if best.map_or(true, |(_, s)| score > s) {
                best = Some((*canonical, score));
            }
        }
    }

    match best {
        Some((canonical, score)) if score >= MATCH_THRESHOLD => canonical.to_string(),
        _ => FALLBACK.to_string(),
    }
}
