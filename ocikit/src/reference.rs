use std::fmt;
use std::str::FromStr;

use crate::digest::Digest;
use crate::error::{Error, Result};

/// Default registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";
/// Default tag assumed under weak validation.
pub const DEFAULT_TAG: &str = "latest";

/// A registry + repository pair, the "context" every reference carries.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repository {
    registry: String,
    repository: String,
    insecure: bool,
}

impl Repository {
    pub fn new(registry: impl Into<String>, repository: impl Into<String>) -> Result<Self> {
        let registry = normalize_registry(registry.into());
        let repository = repository.into();
        validate_repository(&repository)?;
        Ok(Self {
            registry,
            repository,
            insecure: false,
        })
    }

    /// Parse `[registry/]repo` without a tag or digest.
    pub fn parse(s: &str) -> Result<Self> {
        let (registry, repository) = split_registry(s);
        if repository.is_empty() {
            return Err(Error::InvalidReference(
                s.to_string(),
                "empty repository".to_string(),
            ));
        }
        Repository::new(registry, repository)
    }

    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path without the registry.
    pub fn name(&self) -> &str {
        &self.repository
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    /// Mark this repository so transports reach it over plain HTTP.
    pub fn insecure(mut self) -> Self {
        self.insecure = true;
        self
    }

    /// Token scope string for the given actions, e.g. `pull,push`.
    pub fn scope(&self, actions: &str) -> String {
        format!("repository:{}:{}", self.repository, actions)
    }

    /// A tag reference within this repository.
    pub fn tag(&self, tag: impl Into<String>) -> Result<Reference> {
        let tag = tag.into();
        validate_tag(&tag)?;
        Ok(Reference::Tag {
            repository: self.clone(),
            tag,
        })
    }

    /// A digest reference within this repository.
    pub fn digest(&self, digest: Digest) -> Reference {
        Reference::Digest {
            repository: self.clone(),
            digest,
        }
    }
}

impl fmt::Display for Repository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)
    }
}

/// A parsed image reference, discriminated by tag or digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Reference {
    Tag { repository: Repository, tag: String },
    Digest { repository: Repository, digest: Digest },
}

impl Reference {
    /// Parse with weak validation: missing registry, `library/` repo prefix
    /// and missing tag are defaulted.
    pub fn parse(s: &str) -> Result<Self> {
        Self::parse_inner(s, true)
    }

    /// Parse with strict validation: the tag or digest must be explicit and
    /// no repository defaulting happens.
    pub fn parse_strict(s: &str) -> Result<Self> {
        Self::parse_inner(s, false)
    }

    fn parse_inner(s: &str, weak: bool) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::InvalidReference(
                s.to_string(),
                "empty string".to_string(),
            ));
        }

        // A digest suffix wins over any tag before it.
        if let Some((base, digest)) = s.split_once('@') {
            let digest = Digest::from_str(digest)
                .map_err(|e| Error::InvalidReference(s.to_string(), e.to_string()))?;
            // Strip a tag that precedes the digest, e.g. repo:tag@sha256:...
            let base = match split_tag(base) {
                Some((repo_part, _tag)) => repo_part,
                None => base,
            };
            let repository = parse_repository(base, weak)
                .map_err(|e| Error::InvalidReference(s.to_string(), e.to_string()))?;
            return Ok(Reference::Digest { repository, digest });
        }

        match split_tag(s) {
            Some((base, tag)) => {
                validate_tag(tag).map_err(|e| Error::InvalidReference(s.to_string(), e.to_string()))?;
                let repository = parse_repository(base, weak)
                    .map_err(|e| Error::InvalidReference(s.to_string(), e.to_string()))?;
                Ok(Reference::Tag {
                    repository,
                    tag: tag.to_string(),
                })
            }
            None if weak => {
                let repository = parse_repository(s, weak)
                    .map_err(|e| Error::InvalidReference(s.to_string(), e.to_string()))?;
                Ok(Reference::Tag {
                    repository,
                    tag: DEFAULT_TAG.to_string(),
                })
            }
            None => Err(Error::InvalidReference(
                s.to_string(),
                "a tag or digest is required".to_string(),
            )),
        }
    }

    /// The registry + repository this reference points into.
    pub fn context(&self) -> &Repository {
        match self {
            Reference::Tag { repository, .. } => repository,
            Reference::Digest { repository, .. } => repository,
        }
    }

    /// The tag or digest string, as it appears in a `/manifests/<ref>` URL.
    pub fn identifier(&self) -> String {
        match self {
            Reference::Tag { tag, .. } => tag.clone(),
            Reference::Digest { digest, .. } => digest.to_string(),
        }
    }

    pub fn digest(&self) -> Option<&Digest> {
        match self {
            Reference::Digest { digest, .. } => Some(digest),
            Reference::Tag { .. } => None,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Reference::Tag { tag, .. } => Some(tag),
            Reference::Digest { .. } => None,
        }
    }

    /// Mark the reference's registry for plain-HTTP access.
    pub fn insecure(self) -> Self {
        match self {
            Reference::Tag { repository, tag } => Reference::Tag {
                repository: repository.insecure(),
                tag,
            },
            Reference::Digest { repository, digest } => Reference::Digest {
                repository: repository.insecure(),
                digest,
            },
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag { repository, tag } => write!(f, "{repository}:{tag}"),
            Reference::Digest { repository, digest } => write!(f, "{repository}@{digest}"),
        }
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Reference::parse(s)
    }
}

/// Split a trailing `:tag`, being careful not to confuse a registry port
/// (`host:5000/repo`) with a tag.
fn split_tag(s: &str) -> Option<(&str, &str)> {
    let idx = s.rfind(':')?;
    if s[idx + 1..].contains('/') {
        return None;
    }
    Some((&s[..idx], &s[idx + 1..]))
}

/// Decide whether the first path segment is a registry host: it must
/// contain a dot or a port, or be `localhost`.
fn split_registry(s: &str) -> (String, String) {
    match s.split_once('/') {
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        _ => (DEFAULT_REGISTRY.to_string(), s.to_string()),
    }
}

fn parse_repository(s: &str, weak: bool) -> Result<Repository> {
    let (registry, mut repository) = split_registry(s);
    if repository.is_empty() {
        return Err(Error::InvalidReference(
            s.to_string(),
            "empty repository".to_string(),
        ));
    }
    // Official images live under library/ on the default registry.
    if weak && registry == DEFAULT_REGISTRY && !repository.contains('/') {
        repository = format!("library/{repository}");
    }
    Repository::new(registry, repository)
}

fn normalize_registry(registry: String) -> String {
    if registry == "docker.io" {
        DEFAULT_REGISTRY.to_string()
    } else {
        registry
    }
}

fn validate_repository(repo: &str) -> Result<()> {
    let valid_segment = |seg: &str| {
        !seg.is_empty()
            && seg
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b"._-".contains(&b))
            && !seg.starts_with(['.', '-', '_'])
    };
    if repo.split('/').all(valid_segment) {
        Ok(())
    } else {
        Err(Error::InvalidReference(
            repo.to_string(),
            "repository must be lowercase alphanumeric path segments".to_string(),
        ))
    }
}

fn validate_tag(tag: &str) -> Result<()> {
    let mut bytes = tag.bytes();
    let head_ok = matches!(bytes.next(), Some(b) if b.is_ascii_alphanumeric() || b == b'_');
    let rest_ok = bytes.all(|b| b.is_ascii_alphanumeric() || b"._-".contains(&b));
    if head_ok && rest_ok && tag.len() <= 128 {
        Ok(())
    } else {
        Err(Error::InvalidReference(
            tag.to_string(),
            "malformed tag".to_string(),
        ))
    }
}
