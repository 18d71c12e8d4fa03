//! Binding attributes: flags plus optional help text and location.

use crate::location::Loc;
use bitflags::bitflags;
use std::rc::Rc;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u8 {
        const BUILTIN = 1 << 0;
        const PUB = 1 << 1;
        const DEPRECATED = 1 << 2;
        const MUT = 1 << 3;
    }
}

#[derive(Debug, Clone, Default)]
pub struct Attr {
    pub flags: AttrFlags,
    pub help: Option<Rc<str>>,
    pub loc: Option<Loc>,
}

impl Attr {
    pub fn new(flags: AttrFlags) -> Self {
        Attr { flags, help: None, loc: None }
    }

    pub fn builtin() -> Self {
        Attr::new(AttrFlags::BUILTIN)
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = Some(Rc::from(help));
        self
    }

    pub fn is_pub(&self) -> bool {
        self.flags.contains(AttrFlags::PUB)
    }

    pub fn is_builtin(&self) -> bool {
        self.flags.contains(AttrFlags::BUILTIN)
    }

    pub fn is_mut(&self) -> bool {
        self.flags.contains(AttrFlags::MUT)
    }

    pub fn is_deprecated(&self) -> bool {
        self.flags.contains(AttrFlags::DEPRECATED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_composition() {
        let attr = Attr::new(AttrFlags::PUB | AttrFlags::MUT);
        assert!(attr.is_pub());
        assert!(attr.is_mut());
        assert!(!attr.is_builtin());
    }

    #[test]
    fn test_help_text() {
        let attr = Attr::builtin().with_help("adds numbers");
        assert_eq!(attr.help.as_deref(), Some("adds numbers"));
        assert!(attr.is_builtin());
    }
}
