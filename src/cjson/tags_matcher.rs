use std::collections::HashMap;

use crate::core::error::{Error, ErrorKind, Result};

/// Versioned registry assigning stable small integer tags to JSON paths.
/// Tags are 1-based; 0 means "no name" (array elements, root). The state
/// token fingerprints the tag set so a foreign caller can detect that its
/// cached schema went stale.
#[derive(Debug, Clone, Default)]
pub struct TagsMatcher {
    names: Vec<String>,
    name2tag: HashMap<String, u32>,
    version: u32,
}

impl TagsMatcher {
    pub fn new() -> Self {
        TagsMatcher::default()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn size(&self) -> usize {
        self.names.len()
    }

    /// Fingerprint of the registered names and version. Mixed into every
    /// CJSON exchange; a mismatch means the caller's encoder state is
    /// built against another generation of this matcher.
    pub fn state_token(&self) -> i32 {
        let mut h = crc32fast::Hasher::new();
        for name in &self.names {
            h.update(name.as_bytes());
            h.update(b"\0");
        }
        h.update(&self.version.to_le_bytes());
        h.finalize() as i32
    }

    pub fn name2tag(&self, name: &str) -> Option<u32> {
        self.name2tag.get(name).copied()
    }

    /// Registers the name on first use; every registration bumps the
    /// version, which invalidates outstanding state tokens.
    pub fn name2tag_or_add(&mut self, name: &str) -> u32 {
        if let Some(tag) = self.name2tag.get(name) {
            return *tag;
        }
        self.names.push(name.to_string());
        let tag = self.names.len() as u32;
        self.name2tag.insert(name.to_string(), tag);
        self.version += 1;
        tag
    }

    pub fn tag2name(&self, tag: u32) -> Result<&str> {
        if tag == 0 || tag as usize > self.names.len() {
            return Err(Error::new(
                ErrorKind::TagsMismatch,
                format!("unknown tag {} (have {} tags, version {})", tag, self.names.len(), self.version),
            ));
        }
        Ok(&self.names[tag as usize - 1])
    }

    /// Replace this matcher with another generation (namespace matcher
    /// wins on transaction commit).
    pub fn assign(&mut self, other: &TagsMatcher) {
        self.names = other.names.clone();
        self.name2tag = other.name2tag.clone();
        self.version = other.version;
    }

    /// Adopts names first seen by another matcher generation. Tags of
    /// shared names must agree; diverged generations are reported as a
    /// mismatch for the caller to re-encode.
    pub fn merge(&mut self, other: &TagsMatcher) -> Result<()> {
        for (i, name) in other.names.iter().enumerate() {
            let their_tag = i as u32 + 1;
            match self.name2tag(name) {
                Some(tag) if tag == their_tag => {}
                Some(_) => {
                    return Err(Error::new(
                        ErrorKind::TagsMismatch,
                        format!("tag of '{}' diverged between matcher generations", name),
                    ))
                }
                None => {
                    if self.names.len() as u32 + 1 != their_tag {
                        return Err(Error::new(
                            ErrorKind::TagsMismatch,
                            format!("tag of '{}' diverged between matcher generations", name),
                        ));
                    }
                    self.name2tag_or_add(name);
                }
            }
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.names.clear();
        self.name2tag.clear();
        self.version += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_stable_and_versioned() {
        let mut tm = TagsMatcher::new();
        let v0 = tm.version();
        let a = tm.name2tag_or_add("name");
        let b = tm.name2tag_or_add("age");
        assert_eq!(tm.name2tag_or_add("name"), a);
        assert_ne!(a, b);
        assert_eq!(tm.version(), v0 + 2);
        assert_eq!(tm.tag2name(a).unwrap(), "name");
    }

    #[test]
    fn unknown_tag_is_tags_mismatch() {
        let tm = TagsMatcher::new();
        let err = tm.tag2name(3).unwrap_err();
        assert_eq!(err.kind, ErrorKind::TagsMismatch);
    }

    #[test]
    fn state_token_changes_with_tag_set() {
        let mut tm = TagsMatcher::new();
        let t0 = tm.state_token();
        tm.name2tag_or_add("x");
        assert_ne!(tm.state_token(), t0);
    }
}
