//! Script pattern matching
//!
//! The dialect's own pattern language (character classes, quantifiers,
//! captures, balance and frontier items) — not regular expressions. The
//! matcher is a backtracking walk over bytes with a bounded recursion
//! depth, so a hostile pattern cannot exhaust the native stack.

use moat_core::ScriptError;

/// Most captures a single pattern may carry.
const MAX_CAPTURES: usize = 32;
/// Backtracking depth bound.
const MAX_DEPTH: usize = 200;

const CAP_UNFINISHED: isize = -1;
const CAP_POSITION: isize = -2;

/// One resolved capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CapSpan {
    /// Byte range of the source.
    Str(usize, usize),
    /// A position capture `()` (1-based index, the script convention).
    Pos(usize),
}

/// A successful match: the matched range plus its captures.
#[derive(Debug, Clone)]
pub(crate) struct Match {
    pub start: usize,
    pub end: usize,
    pub captures: Vec<CapSpan>,
}

struct MatchState<'a> {
    src: &'a [u8],
    pat: &'a [u8],
    level: usize,
    cap_start: [usize; MAX_CAPTURES],
    cap_len: [isize; MAX_CAPTURES],
    depth: usize,
}

fn err(msg: &str) -> ScriptError {
    ScriptError::raised(msg.to_string())
}

impl<'a> MatchState<'a> {
    fn new(src: &'a [u8], pat: &'a [u8]) -> MatchState<'a> {
        MatchState {
            src,
            pat,
            level: 0,
            cap_start: [0; MAX_CAPTURES],
            cap_len: [0; MAX_CAPTURES],
            depth: 0,
        }
    }

    fn class_end(&self, p: usize) -> Result<usize, ScriptError> {
        match self.pat.get(p) {
            None => Err(err("malformed pattern (ends with '%')")),
            Some(b'%') => {
                if p + 1 >= self.pat.len() {
                    return Err(err("malformed pattern (ends with '%')"));
                }
                Ok(p + 2)
            }
            Some(b'[') => {
                let mut q = p + 1;
                if self.pat.get(q) == Some(&b'^') {
                    q += 1;
                }
                // A ']' in first position is a literal member.
                if self.pat.get(q) == Some(&b']') {
                    q += 1;
                }
                loop {
                    match self.pat.get(q) {
                        None => return Err(err("malformed pattern (missing ']')")),
                        Some(b'%') => q += 2,
                        Some(b']') => return Ok(q + 1),
                        _ => q += 1,
                    }
                }
            }
            Some(_) => Ok(p + 1),
        }
    }

    fn match_class(c: u8, class: u8) -> bool {
        let res = match class.to_ascii_lowercase() {
            b'a' => c.is_ascii_alphabetic(),
            b'c' => c.is_ascii_control(),
            b'd' => c.is_ascii_digit(),
            b'g' => c.is_ascii_graphic(),
            b'l' => c.is_ascii_lowercase(),
            b'p' => c.is_ascii_punctuation(),
            b's' => c.is_ascii_whitespace(),
            b'u' => c.is_ascii_uppercase(),
            b'w' => c.is_ascii_alphanumeric(),
            b'x' => c.is_ascii_hexdigit(),
            // Any other escaped byte matches itself.
            _ => return class == c,
        };
        if class.is_ascii_uppercase() { !res } else { res }
    }

    fn match_bracket(&self, c: u8, p: usize, ep: usize) -> bool {
        // p points at '['; ep one past ']'.
        let mut i = p + 1;
        let mut negate = false;
        if self.pat.get(i) == Some(&b'^') {
            negate = true;
            i += 1;
        }
        let mut found = false;
        while i < ep - 1 {
            if self.pat[i] == b'%' && i + 1 < ep - 1 {
                i += 1;
                if Self::match_class(c, self.pat[i]) {
                    found = true;
                }
                i += 1;
            } else if i + 2 < ep - 1 && self.pat[i + 1] == b'-' {
                if self.pat[i] <= c && c <= self.pat[i + 2] {
                    found = true;
                }
                i += 3;
            } else {
                if self.pat[i] == c {
                    found = true;
                }
                i += 1;
            }
        }
        found != negate
    }

    fn single_match(&self, s: usize, p: usize, ep: usize) -> bool {
        let Some(&c) = self.src.get(s) else {
            return false;
        };
        match self.pat[p] {
            b'.' => true,
            b'%' => Self::match_class(c, self.pat[p + 1]),
            b'[' => self.match_bracket(c, p, ep),
            literal => literal == c,
        }
    }

    fn do_match(&mut self, mut s: usize, mut p: usize) -> Result<Option<usize>, ScriptError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            self.depth -= 1;
            return Err(err("pattern too complex"));
        }
        let result = loop {
            if p >= self.pat.len() {
                break Ok(Some(s));
            }
            match self.pat[p] {
                b'(' => {
                    break if self.pat.get(p + 1) == Some(&b')') {
                        self.start_capture(s, p + 2, CAP_POSITION)
                    } else {
                        self.start_capture(s, p + 1, CAP_UNFINISHED)
                    };
                }
                b')' => break self.end_capture(s, p + 1),
                b'$' if p + 1 == self.pat.len() => {
                    break Ok(if s == self.src.len() { Some(s) } else { None });
                }
                b'%' => match self.pat.get(p + 1) {
                    Some(b'b') => break self.match_balance(s, p + 2),
                    Some(b'f') => {
                        p += 2;
                        if self.pat.get(p) != Some(&b'[') {
                            break Err(err("missing '[' after '%f' in pattern"));
                        }
                        let ep = self.class_end(p)?;
                        let prev = if s == 0 { 0 } else { self.src[s - 1] };
                        let cur = self.src.get(s).copied().unwrap_or(0);
                        if !self.match_bracket(prev, p, ep) && self.match_bracket(cur, p, ep) {
                            p = ep;
                            continue;
                        }
                        break Ok(None);
                    }
                    Some(d @ b'0'..=b'9') => {
                        let result = self.match_back_capture(s, usize::from(d - b'0'))?;
                        match result {
                            Some(new_s) => {
                                s = new_s;
                                p += 2;
                                continue;
                            }
                            None => break Ok(None),
                        }
                    }
                    _ => break self.default_match(s, p),
                },
                _ => break self.default_match(s, p),
            }
        };
        self.depth -= 1;
        result
    }

    /// Ordinary single item, possibly quantified.
    fn default_match(&mut self, s: usize, p: usize) -> Result<Option<usize>, ScriptError> {
        let ep = self.class_end(p)?;
        match self.pat.get(ep) {
            Some(b'?') => {
                if self.single_match(s, p, ep) {
                    if let Some(end) = self.do_match(s + 1, ep + 1)? {
                        return Ok(Some(end));
                    }
                }
                self.do_match(s, ep + 1)
            }
            Some(b'+') => {
                if self.single_match(s, p, ep) {
                    self.max_expand(s + 1, p, ep)
                } else {
                    Ok(None)
                }
            }
            Some(b'*') => self.max_expand(s, p, ep),
            Some(b'-') => self.min_expand(s, p, ep),
            _ => {
                if self.single_match(s, p, ep) {
                    self.do_match(s + 1, ep)
                } else {
                    Ok(None)
                }
            }
        }
    }

    fn max_expand(&mut self, s: usize, p: usize, ep: usize) -> Result<Option<usize>, ScriptError> {
        let mut count = 0usize;
        while self.single_match(s + count, p, ep) {
            count += 1;
        }
        loop {
            if let Some(end) = self.do_match(s + count, ep + 1)? {
                return Ok(Some(end));
            }
            if count == 0 {
                return Ok(None);
            }
            count -= 1;
        }
    }

    fn min_expand(&mut self, mut s: usize, p: usize, ep: usize) -> Result<Option<usize>, ScriptError> {
        loop {
            if let Some(end) = self.do_match(s, ep + 1)? {
                return Ok(Some(end));
            }
            if self.single_match(s, p, ep) {
                s += 1;
            } else {
                return Ok(None);
            }
        }
    }

    fn match_balance(&mut self, s: usize, p: usize) -> Result<Option<usize>, ScriptError> {
        if p + 1 >= self.pat.len() {
            return Err(err("malformed pattern (missing arguments to '%b')"));
        }
        if self.src.get(s) != Some(&self.pat[p]) {
            return Ok(None);
        }
        let open = self.pat[p];
        let close = self.pat[p + 1];
        let mut balance = 1usize;
        let mut i = s + 1;
        while i < self.src.len() {
            if self.src[i] == close {
                balance -= 1;
                if balance == 0 {
                    return self.do_match(i + 1, p + 2);
                }
            } else if self.src[i] == open {
                balance += 1;
            }
            i += 1;
        }
        Ok(None)
    }

    fn match_back_capture(&mut self, s: usize, index: usize) -> Result<Option<usize>, ScriptError> {
        let index = index
            .checked_sub(1)
            .filter(|i| *i < self.level && self.cap_len[*i] != CAP_UNFINISHED)
            .ok_or_else(|| err("invalid capture index"))?;
        let len = self.cap_len[index] as usize;
        let start = self.cap_start[index];
        if self.src.len() - s >= len && self.src[start..start + len] == self.src[s..s + len] {
            Ok(Some(s + len))
        } else {
            Ok(None)
        }
    }

    fn start_capture(
        &mut self,
        s: usize,
        p: usize,
        what: isize,
    ) -> Result<Option<usize>, ScriptError> {
        if self.level >= MAX_CAPTURES {
            return Err(err("too many captures"));
        }
        self.cap_start[self.level] = s;
        self.cap_len[self.level] = what;
        self.level += 1;
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.level -= 1;
        }
        Ok(result)
    }

    fn end_capture(&mut self, s: usize, p: usize) -> Result<Option<usize>, ScriptError> {
        let index = (0..self.level)
            .rev()
            .find(|i| self.cap_len[*i] == CAP_UNFINISHED)
            .ok_or_else(|| err("invalid pattern capture"))?;
        self.cap_len[index] = (s - self.cap_start[index]) as isize;
        let result = self.do_match(s, p)?;
        if result.is_none() {
            self.cap_len[index] = CAP_UNFINISHED;
        }
        Ok(result)
    }

    /// Explicit captures only; callers fall back to the whole match when
    /// the pattern has none.
    fn captures(&self) -> Vec<CapSpan> {
        (0..self.level)
            .map(|i| {
                if self.cap_len[i] == CAP_POSITION {
                    CapSpan::Pos(self.cap_start[i] + 1)
                } else {
                    let start = self.cap_start[i];
                    CapSpan::Str(start, start + self.cap_len[i].max(0) as usize)
                }
            })
            .collect()
    }
}

/// Finds the first match at or after `init` (a byte offset).
pub(crate) fn first_match(
    src: &[u8],
    pat: &[u8],
    init: usize,
) -> Result<Option<Match>, ScriptError> {
    let (anchored, pat_start) = match pat.first() {
        Some(b'^') => (true, 1),
        _ => (false, 0),
    };
    let mut s = init.min(src.len());
    loop {
        let mut ms = MatchState::new(src, &pat[pat_start..]);
        if let Some(end) = ms.do_match(s, 0)? {
            return Ok(Some(Match {
                start: s,
                end,
                captures: ms.captures(),
            }));
        }
        if anchored || s >= src.len() {
            return Ok(None);
        }
        s += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(src: &str, pat: &str) -> Option<(usize, usize)> {
        first_match(src.as_bytes(), pat.as_bytes(), 0)
            .unwrap()
            .map(|m| (m.start, m.end))
    }

    #[test]
    fn literals_and_classes() {
        assert_eq!(m("hello", "ell"), Some((1, 4)));
        assert_eq!(m("abc123", "%d+"), Some((3, 6)));
        assert_eq!(m("abc", "%u"), None);
        assert_eq!(m("a.c", "a%.c"), Some((0, 3)));
    }

    #[test]
    fn anchors() {
        assert_eq!(m("hello", "^he"), Some((0, 2)));
        assert_eq!(m("hello", "^el"), None);
        assert_eq!(m("hello", "lo$"), Some((3, 5)));
        assert_eq!(m("hello", "he$"), None);
    }

    #[test]
    fn quantifiers() {
        assert_eq!(m("aaab", "a*b"), Some((0, 4)));
        assert_eq!(m("b", "a*b"), Some((0, 1)));
        assert_eq!(m("aaab", "a-b"), Some((0, 4)));
        assert_eq!(m("aab", "a?a?b"), Some((0, 3)));
        assert_eq!(m("xyz", "a+"), None);
    }

    #[test]
    fn bracket_sets() {
        assert_eq!(m("hello", "[el]+"), Some((1, 4)));
        assert_eq!(m("hi42", "[0-9]+"), Some((2, 4)));
        assert_eq!(m("abc", "[^b]+"), Some((0, 1)));
    }

    #[test]
    fn captures() {
        let found = first_match(b"key=value", b"(%w+)=(%w+)", 0)
            .unwrap()
            .unwrap();
        assert_eq!(
            found.captures,
            vec![CapSpan::Str(0, 3), CapSpan::Str(4, 9)]
        );
    }

    #[test]
    fn position_capture() {
        let found = first_match(b"ab", b"a()b", 0).unwrap().unwrap();
        assert_eq!(found.captures, vec![CapSpan::Pos(2)]);
    }

    #[test]
    fn balance_match() {
        assert_eq!(m("(a(b)c)d", "%b()"), Some((0, 7)));
        assert_eq!(m("(unclosed", "%b()"), None);
    }

    #[test]
    fn back_reference() {
        assert_eq!(m("abcabc", "(abc)%1"), Some((0, 6)));
        assert_eq!(m("abcabd", "(abc)%1"), None);
    }

    #[test]
    fn malformed_patterns_error() {
        assert!(first_match(b"x", b"%", 0).is_err());
        assert!(first_match(b"x", b"[abc", 0).is_err());
        assert!(first_match(b"x", b"(a%2)", 0).is_err());
    }
}
