//! Repository allow-list: which `owner/container` pairs may be proxied.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use super::error::DomainError;

/// Maps owners to the containers that may be proxied.
///
/// An empty list allows every owner and container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowList {
    owners: HashMap<String, BTreeSet<String>>,
}

impl AllowList {
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn from_map<I, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, C)>,
        C: IntoIterator<Item = String>,
    {
        let mut owners: HashMap<String, BTreeSet<String>> = HashMap::new();
        for (owner, containers) in entries {
            owners.entry(owner).or_default().extend(containers);
        }
        Self { owners }
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }

    pub fn permits(&self, owner: &str, container: &str) -> bool {
        if self.owners.is_empty() {
            return true;
        }
        self.owners
            .get(owner)
            .is_some_and(|containers| containers.contains(container))
    }
}

/// Parses the compact form `owner:repo1,repo2;owner2:repo3`.
impl FromStr for AllowList {
    type Err = DomainError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut owners: HashMap<String, BTreeSet<String>> = HashMap::new();
        if value.trim().is_empty() {
            return Ok(Self { owners });
        }

        for pair in value.split(';').filter(|pair| !pair.trim().is_empty()) {
            let Some((owner, containers)) = pair.split_once(':') else {
                return Err(DomainError::validation(format!(
                    "invalid allow-list item `{pair}`: expected owner:repo[,repo]"
                )));
            };
            let owner = owner.trim();
            if owner.is_empty() || containers.contains(':') {
                return Err(DomainError::validation(format!(
                    "invalid allow-list item `{pair}`"
                )));
            }

            let entry = owners.entry(owner.to_string()).or_default();
            entry.extend(
                containers
                    .split(',')
                    .map(str::trim)
                    .filter(|container| !container.is_empty())
                    .map(str::to_string),
            );
        }

        Ok(Self { owners })
    }
}
