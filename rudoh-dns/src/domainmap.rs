//! Per-domain routing table
//!
//! Maps DNS names to arbitrary string values (in practice, upstream server
//! addresses) and answers most-specific-suffix lookups, so a query for
//! `host.corp.example.` can be routed by an entry for `corp.example.`.

use std::collections::HashMap;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Canonical form of a DNS name: ASCII-lowercased and fully qualified.
///
/// All map keys and all lookups go through this, so comparisons are
/// byte-exact on the canonical form.
pub fn canonical_name(name: &str) -> String {
    let mut canonical = name.trim().to_ascii_lowercase();
    if !canonical.ends_with('.') {
        canonical.push('.');
    }
    canonical
}

/// Number of labels in a name ("www.example.com." has three, "." has zero).
pub fn label_count(name: &str) -> usize {
    name.trim_end_matches('.')
        .split('.')
        .filter(|label| !label.is_empty())
        .count()
}

/// True when `parent` is a proper-or-equal suffix of `child` on a label
/// boundary. Both must already be canonical.
fn is_subdomain(parent: &str, child: &str) -> bool {
    if parent == "." {
        return true;
    }
    child == parent || child.ends_with(&format!(".{parent}"))
}

/// Maps a DNS name to an arbitrary string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainMap {
    entries: HashMap<String, String>,
}

impl DomainMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Set the value for the given domain, overwriting any prior value.
    pub fn set(&mut self, domain: &str, value: &str) {
        self.entries
            .insert(canonical_name(domain), value.to_string());
    }

    /// Exact lookup on the canonical form.
    pub fn get_exact(&self, domain: &str) -> Option<&str> {
        self.entries.get(&canonical_name(domain)).map(String::as_str)
    }

    /// Most-specific lookup: among the entries whose canonical form is a
    /// suffix of the query, return the value of the one with the most
    /// labels.
    pub fn get_most_specific(&self, domain: &str) -> Option<&str> {
        let domain = canonical_name(domain);
        let mut best: Option<(usize, &str)> = None;

        for (entry, value) in &self.entries {
            if !is_subdomain(entry, &domain) {
                continue;
            }
            let labels = label_count(entry);
            if best.map_or(true, |(max, _)| labels > max) {
                best = Some((labels, value));
            }
        }

        best.map(|(_, value)| value)
    }
}

impl FromStr for DomainMap {
    type Err = Error;

    /// Parse `"domain1:addr1,domain2:addr2,..."`. Values may themselves
    /// contain colons; each pair is split on the first one only.
    fn from_str(s: &str) -> Result<Self> {
        let mut map = DomainMap::new();
        for pair in s.split(',') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }

            let (domain, value) = pair
                .split_once(':')
                .ok_or_else(|| Error::Config(format!("{pair:?}: entry does not have a ':'")))?;
            map.set(domain.trim(), value.trim());
        }
        Ok(map)
    }
}
