//! Module coordinates and archive requests.

use std::fmt;

use sha2::{Digest, Sha256};

use super::error::DomainError;

/// Identifies one module inside a hosting container, e.g. `acme/infra` + `network`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModuleCoordinate {
    owner: String,
    container: String,
    module: String,
}

impl ModuleCoordinate {
    pub fn new(
        owner: impl Into<String>,
        container: impl Into<String>,
        module: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let owner = owner.into();
        let container = container.into();
        let module = module.into();

        for (field, value) in [
            ("owner", &owner),
            ("container", &container),
            ("module", &module),
        ] {
            if value.trim().is_empty() {
                return Err(DomainError::validation(format!("{field} must not be empty")));
            }
            if value.contains('/') {
                return Err(DomainError::validation(format!(
                    "{field} must be a single path segment"
                )));
            }
        }

        Ok(Self {
            owner,
            container,
            module,
        })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    /// Key under which the version list for this coordinate is cached.
    /// Segments never contain `/`, so distinct coordinates never share a key.
    pub fn cache_key(&self) -> String {
        format!("{}/{}/{}", self.owner, self.container, self.module)
    }

    /// Strip the module prefix from a tag name, yielding the version it encodes.
    pub fn version_from_tag<'a>(&self, tag: &'a str) -> Option<&'a str> {
        tag.strip_prefix(self.module.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }
}

impl fmt::Display for ModuleCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.container, self.module)
    }
}

/// One immutable downloadable artifact: a coordinate pinned to a version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArchiveRequest {
    coordinate: ModuleCoordinate,
    version: String,
}

impl ArchiveRequest {
    pub fn new(coordinate: ModuleCoordinate, version: impl Into<String>) -> Result<Self, DomainError> {
        let version = version.into();
        if version.trim().is_empty() {
            return Err(DomainError::validation("version must not be empty"));
        }
        Ok(Self {
            coordinate,
            version,
        })
    }

    pub fn coordinate(&self) -> &ModuleCoordinate {
        &self.coordinate
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Upstream tag name, `<module>/<version>`.
    pub fn tag(&self) -> String {
        format!("{}/{}", self.coordinate.module, self.version)
    }

    /// Deterministic, path-safe filename for the cached archive.
    pub fn archive_filename(&self) -> String {
        let identity = format!(
            "{}/{}/{}/{}",
            self.coordinate.owner, self.coordinate.container, self.coordinate.module, self.version
        );
        format!("{}.tar.gz", hex::encode(Sha256::digest(identity.as_bytes())))
    }
}

impl fmt::Display for ArchiveRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.coordinate, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinate() -> ModuleCoordinate {
        ModuleCoordinate::new("acme", "infra", "network").expect("valid coordinate")
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(ModuleCoordinate::new("", "infra", "network").is_err());
        assert!(ModuleCoordinate::new("acme", " ", "network").is_err());
        assert!(ModuleCoordinate::new("acme", "infra", "").is_err());
        assert!(ArchiveRequest::new(coordinate(), "").is_err());
    }

    #[test]
    fn rejects_nested_segments() {
        assert!(ModuleCoordinate::new("acme/evil", "infra", "network").is_err());
        assert!(ModuleCoordinate::new("acme", "infra/evil", "network").is_err());
        assert!(ModuleCoordinate::new("acme", "infra", "net/work").is_err());
    }

    #[test]
    fn cache_keys_do_not_collide_across_hyphenated_segments() {
        let a = ModuleCoordinate::new("acme", "infra-net", "work").expect("coordinate");
        let b = ModuleCoordinate::new("acme", "infra", "net-work").expect("coordinate");
        let c = ModuleCoordinate::new("acme-infra", "net", "work").expect("coordinate");

        assert_ne!(a.cache_key(), b.cache_key());
        assert_ne!(a.cache_key(), c.cache_key());
        assert_ne!(b.cache_key(), c.cache_key());
        assert_eq!(a.cache_key(), "acme/infra-net/work");
    }

    #[test]
    fn version_from_tag_requires_full_module_prefix() {
        let coord = coordinate();
        assert_eq!(coord.version_from_tag("network/1.0.0"), Some("1.0.0"));
        assert_eq!(coord.version_from_tag("networking/1.0.0"), None);
        assert_eq!(coord.version_from_tag("network"), None);
        assert_eq!(coord.version_from_tag("other/1.0.0"), None);
    }

    #[test]
    fn archive_filename_is_deterministic_and_distinct() {
        let a = ArchiveRequest::new(coordinate(), "1.0.0").expect("request");
        let b = ArchiveRequest::new(coordinate(), "1.0.0").expect("request");
        let c = ArchiveRequest::new(coordinate(), "1.0.1").expect("request");

        assert_eq!(a.archive_filename(), b.archive_filename());
        assert_ne!(a.archive_filename(), c.archive_filename());
        assert!(a.archive_filename().ends_with(".tar.gz"));
        assert!(!a.archive_filename().contains('/'));
    }

    #[test]
    fn tag_joins_module_and_version() {
        let request = ArchiveRequest::new(coordinate(), "2.0.0").expect("request");
        assert_eq!(request.tag(), "network/2.0.0");
        assert_eq!(request.to_string(), "acme/infra/network@2.0.0");
    }
}
