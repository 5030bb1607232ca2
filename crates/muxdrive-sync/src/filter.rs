//! Include/exclude glob filtering
//!
//! An entry passes when the include list is empty or some include
//! matches, and no exclude matches. Patterns are case-sensitive, use `/`
//! as the separator, and `**` matches zero or more path components.
//! Directories are always walked so their children can still match.

use glob::{MatchOptions, Pattern};

use muxdrive_core::{EngineError, EngineResult};

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Compiled include/exclude filter over relative paths.
#[derive(Debug, Clone)]
pub struct PathFilter {
    includes: Vec<Pattern>,
    excludes: Vec<Pattern>,
}

impl PathFilter {
    pub fn new(includes: &[String], excludes: &[String]) -> EngineResult<Self> {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    /// Filter with no patterns; everything passes.
    pub fn allow_all() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
        }
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        if !self.includes.is_empty()
            && !self
                .includes
                .iter()
                .any(|p| p.matches_with(rel_path, MATCH_OPTIONS))
        {
            return false;
        }
        !self
            .excludes
            .iter()
            .any(|p| p.matches_with(rel_path, MATCH_OPTIONS))
    }
}

fn compile(patterns: &[String]) -> EngineResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|p| {
            Pattern::new(p)
                .map_err(|e| EngineError::InvalidArgument(format!("bad glob '{p}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(includes: &[&str], excludes: &[&str]) -> PathFilter {
        PathFilter::new(
            &includes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &excludes.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )
        .unwrap()
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let f = filter(&[], &[]);
        assert!(f.matches("a.txt"));
        assert!(f.matches("deep/nested/path.bin"));
    }

    #[test]
    fn test_include_must_match_when_present() {
        let f = filter(&["**/*.txt"], &[]);
        assert!(f.matches("a.txt"));
        assert!(f.matches("docs/b.txt"));
        assert!(!f.matches("image.png"));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let f = filter(&["**/*.txt"], &["tmp/**"]);
        assert!(f.matches("docs/keep.txt"));
        assert!(!f.matches("tmp/drop.txt"));
    }

    #[test]
    fn test_star_does_not_cross_separators() {
        let f = filter(&["*.txt"], &[]);
        assert!(f.matches("top.txt"));
        assert!(!f.matches("sub/inner.txt"));
    }

    #[test]
    fn test_double_star_matches_zero_components() {
        let f = filter(&["**/*.log"], &[]);
        assert!(f.matches("root.log"));
        assert!(f.matches("a/b/c.log"));
    }

    #[test]
    fn test_case_sensitive() {
        let f = filter(&["**/*.TXT"], &[]);
        assert!(f.matches("a.TXT"));
        assert!(!f.matches("a.txt"));
    }

    #[test]
    fn test_question_mark_single_char() {
        let f = filter(&["file?.dat"], &[]);
        assert!(f.matches("file1.dat"));
        assert!(!f.matches("file12.dat"));
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        assert!(PathFilter::new(&["[".to_string()], &[]).is_err());
    }
}
