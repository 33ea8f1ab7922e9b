use std::collections::HashMap;

use tracing::debug;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

#[derive(Debug, Clone, Default)]
pub struct CityNormalizer {
    // Folded spelling to the folded first entry of its variant group.
    lookup: HashMap<String, String>,
}

impl CityNormalizer {
    pub fn new(variant_groups: &[Vec<String>]) -> Self {
        let mut lookup = HashMap::new();
        for group in variant_groups {
            let folded: Vec<String> = group
                .iter()
                .map(|name| fold(name))
                .filter(|name| !name.is_empty())
                .collect();
            let Some(representative) = folded.first().cloned() else {
                continue;
            };
            for name in &folded {
                if let Some(existing) = lookup.get(name) {
                    if existing != &representative {
                        debug!(
                            target: "city_normalizer",
                            city = %name,
                            kept = %existing,
                            "city listed in several variant groups; first group wins"
                        );
                    }
                    continue;
                }
                lookup.insert(name.clone(), representative.clone());
            }
        }
        Self { lookup }
    }

    // Canonical key for a raw city. Unknown cities are their own class.
    pub fn normalize(&self, raw: &str) -> String {
        let folded = fold(raw);
        match self.lookup.get(&folded) {
            Some(representative) => representative.clone(),
            None => folded,
        }
    }

    pub fn same_city(&self, left: &str, right: &str) -> bool {
        let left = self.normalize(left);
        !left.is_empty() && left == self.normalize(right)
    }
}

// Upper-case, strip diacritics, collapse punctuation and whitespace.
pub fn fold(raw: &str) -> String {
    let mut folded = String::with_capacity(raw.len());
    let mut pending_space = false;
    for ch in raw.trim().nfd().filter(|c| !is_combining_mark(*c)) {
        if ch.is_alphanumeric() {
            if pending_space && !folded.is_empty() {
                folded.push(' ');
            }
            pending_space = false;
            folded.extend(ch.to_uppercase());
        } else {
            pending_space = true;
        }
    }
    folded
}
