//! Character sets used to build words, keywords and whitespace policies

use std::collections::BTreeSet;
use std::fmt;

use crate::util::collapse_ranges;

pub const ALPHAS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
pub const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
pub const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
pub const NUMS: &str = "0123456789";
pub const HEXNUMS: &str = "0123456789ABCDEFabcdef";
pub const ALPHANUMS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
pub const PRINTABLES: &str = "!\"#$%&'()*+,-./0123456789:;<=>?@ABCDEFGHIJKLMNOPQRSTUVWXYZ[\\]^_`abcdefghijklmnopqrstuvwxyz{|}~";
pub const PUNCTUATION: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Characters that may appear in identifiers; the default keyword boundary set.
pub const IDENTCHARS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_$";

/// Default characters skipped before each match attempt.
pub const DEFAULT_WHITESPACE: &str = " \n\t\r";

/// Every character a `White` matcher knows how to name.
pub const KNOWN_WHITESPACE: &str = " \t\n\r\u{c}\u{b}";

/// A set of characters with a fast path for ASCII membership.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct CharSet {
    ascii: u128,
    other: BTreeSet<char>,
}

impl CharSet {
    pub fn new(chars: &str) -> Self {
        chars.chars().collect()
    }

    #[inline]
    pub fn contains(&self, c: char) -> bool {
        let code = c as u32;
        if code < 128 {
            self.ascii & (1u128 << code) != 0
        } else {
            self.other.contains(&c)
        }
    }

    pub fn insert(&mut self, c: char) {
        let code = c as u32;
        if code < 128 {
            self.ascii |= 1u128 << code;
        } else {
            self.other.insert(c);
        }
    }

    pub fn remove(&mut self, c: char) {
        let code = c as u32;
        if code < 128 {
            self.ascii &= !(1u128 << code);
        } else {
            self.other.remove(&c);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ascii == 0 && self.other.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ascii.count_ones() as usize + self.other.len()
    }

    /// Members in code point order.
    pub fn iter(&self) -> impl Iterator<Item = char> + '_ {
        (0u8..128)
            .filter(move |b| self.ascii & (1u128 << *b) != 0)
            .map(char::from)
            .chain(self.other.iter().copied())
    }

    pub fn union(&self, other: &CharSet) -> CharSet {
        CharSet {
            ascii: self.ascii | other.ascii,
            other: self.other.union(&other.other).copied().collect(),
        }
    }

    pub fn difference(&self, other: &CharSet) -> CharSet {
        CharSet {
            ascii: self.ascii & !other.ascii,
            other: self.other.difference(&other.other).copied().collect(),
        }
    }

    /// Upper-cased copy, used for caseless keyword boundaries.
    pub fn to_uppercase(&self) -> CharSet {
        self.iter().flat_map(char::to_uppercase).collect()
    }

    /// Regex character class body (no brackets).
    pub fn to_regex_class(&self) -> String {
        collapse_ranges(self.iter(), true)
    }

    /// Compact form for display names, truncated after 16 characters.
    pub fn to_display(&self) -> String {
        let collapsed = collapse_ranges(self.iter(), false);
        if collapsed.chars().count() > 16 {
            let head: String = collapsed.chars().take(13).collect();
            format!("{}...", head)
        } else {
            collapsed
        }
    }
}

impl FromIterator<char> for CharSet {
    fn from_iter<I: IntoIterator<Item = char>>(iter: I) -> Self {
        let mut set = CharSet::default();
        for c in iter {
            set.insert(c);
        }
        set
    }
}

impl From<&str> for CharSet {
    fn from(chars: &str) -> Self {
        CharSet::new(chars)
    }
}

impl fmt::Debug for CharSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CharSet({:?})", self.iter().collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_membership() {
        let set = CharSet::new("abc\u{e9}");
        assert!(set.contains('a'));
        assert!(set.contains('\u{e9}'));
        assert!(!set.contains('d'));
        assert_eq!(set.len(), 4);
    }

    #[test]
    fn test_iter_is_sorted() {
        let set = CharSet::new("cab");
        assert_eq!(set.iter().collect::<String>(), "abc");
    }

    #[test]
    fn test_difference_removes_newline() {
        let ws = CharSet::new(DEFAULT_WHITESPACE).difference(&CharSet::new("\n"));
        assert!(!ws.contains('\n'));
        assert!(ws.contains(' '));
    }

    #[test]
    fn test_display_is_truncated() {
        assert_eq!(CharSet::new(NUMS).to_display(), "0-9");
        assert_eq!(CharSet::new(ALPHAS).to_display(), "A-Za-z");
        assert_eq!(CharSet::new(PRINTABLES).to_display(), "!-~");
        assert!(CharSet::new("acegikmoqsuwy13579").to_display().ends_with("..."));
    }

    #[test]
    fn test_constants_are_consistent() {
        assert_eq!(CharSet::new(ALPHANUMS), CharSet::new(ALPHAS).union(&CharSet::new(NUMS)));
        assert_eq!(PRINTABLES.len(), 94);
    }
}
