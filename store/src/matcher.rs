use regex::Regex;

use crate::{Error, Result};

/// Decides which packed-subtree prefix a path belongs to.
///
/// Compiled once per request from the owning project's pack patterns and
/// consulted for every path: queries get redirected to the aggregate that
/// covers them, updates get routed into the matching pack buffer.
pub struct PackMatcher {
    patterns: Vec<Regex>,
}

impl PackMatcher {
    pub fn compile(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    Error::InvalidArgument(format!("bad pack pattern {:?}: {}", pattern, err))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(PackMatcher { patterns })
    }

    /// The shortest directory prefix of `path` matched by any pattern.
    ///
    /// Prefixes are built left to right (`a/`, `a/b/`, …), so the first hit
    /// is the shortest one.
    pub fn pack_prefix<'a>(&self, path: &'a str) -> Option<&'a str> {
        if self.patterns.is_empty() {
            return None;
        }
        for (idx, _) in path.match_indices('/') {
            let prefix = &path[..=idx];
            if self.patterns.iter().any(|re| re.is_match(prefix)) {
                return Some(prefix);
            }
        }
        None
    }
}
