use std::collections::HashMap;

use regex::{Regex, RegexBuilder};
use tracing::warn;

use super::def::NameInJail;

/// Country-scoped name blocklists: a name is "in jail" for a country when
/// any of that country's patterns matches it. Compiled once at startup,
/// immutable afterwards.
#[derive(Default)]
pub struct NamesInJail {
    by_country: HashMap<String, Vec<Regex>>,
}

impl NamesInJail {
    pub fn compile(entries: &[NameInJail]) -> Self {
        let mut by_country: HashMap<String, Vec<Regex>> = HashMap::new();
        for entry in entries {
            let regex = match RegexBuilder::new(&entry.name_regex)
                .case_insensitive(true)
                .build()
            {
                Ok(regex) => regex,
                Err(e) => {
                    warn!("skipping names_in_jail regex {}: {}", entry.name_regex, e);
                    continue;
                }
            };
            for country in entry.country_codes.split(',') {
                let country = country.trim();
                if country.is_empty() {
                    continue;
                }
                by_country
                    .entry(country.to_string())
                    .or_default()
                    .push(regex.clone());
            }
        }
        Self { by_country }
    }

    pub fn is_name_in_jail_of_country(&self, name: &str, country_code: &str) -> bool {
        match self.by_country.get(country_code) {
            Some(patterns) => patterns.iter().any(|p| p.is_match(name)),
            None => false,
        }
    }
}
