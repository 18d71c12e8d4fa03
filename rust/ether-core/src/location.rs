//! Source locations attached to AST/IR nodes and exception traces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::rc::Rc;

/// A span in a source file: first/last line and column, 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Loc {
    pub file: Option<Rc<str>>,
    pub fl: u32,
    pub fc: u32,
    pub ll: u32,
    pub lc: u32,
}

impl Loc {
    pub fn new(file: Option<Rc<str>>, fl: u32, fc: u32, ll: u32, lc: u32) -> Self {
        Loc { file, fl, fc, ll, lc }
    }

    pub fn point(file: Option<Rc<str>>, line: u32, col: u32) -> Self {
        Loc::new(file, line, col, line, col)
    }

    /// Span covering both locations. Files are assumed to agree.
    pub fn join(&self, other: &Loc) -> Loc {
        Loc {
            file: self.file.clone(),
            fl: self.fl,
            fc: self.fc,
            ll: other.ll,
            lc: other.lc,
        }
    }
}

impl fmt::Display for Loc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file = self.file.as_deref().unwrap_or("<string>");
        if self.fl == self.ll {
            write!(f, "{}:{}:{}", file, self.fl, self.fc)
        } else {
            write!(f, "{}:{}:{}-{}:{}", file, self.fl, self.fc, self.ll, self.lc)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_point() {
        let loc = Loc::point(None, 3, 7);
        assert_eq!(loc.to_string(), "<string>:3:7");
    }

    #[test]
    fn test_join_spans() {
        let a = Loc::point(None, 1, 2);
        let b = Loc::point(None, 4, 9);
        let j = a.join(&b);
        assert_eq!(j.fl, 1);
        assert_eq!(j.ll, 4);
        assert_eq!(j.to_string(), "<string>:1:2-4:9");
    }
}
