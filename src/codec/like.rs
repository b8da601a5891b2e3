//! SQL LIKE matching over raw character units.
//!
//! Works on either narrow bytes or UCS-2 units. The match runs in three
//! phases: the segment before the first unescaped `%` must anchor at the
//! head, the segment after the last `%` must anchor at the tail, and the
//! inner segments are located left to right with a bounded scan that
//! remembers the next head-character candidate for backtracking.

use crate::error::{Error, ErrorCode, Result};

/// Character unit a pattern can be matched over.
pub trait LikeUnit: Copy + Eq {
    const PERCENT: Self;
    const UNDERSCORE: Self;
}

impl LikeUnit for u8 {
    const PERCENT: Self = b'%';
    const UNDERSCORE: Self = b'_';
}

impl LikeUnit for u16 {
    const PERCENT: Self = b'%' as u16;
    const UNDERSCORE: Self = b'_' as u16;
}

/// Start of the escape run covering `idx`, when `p[idx]` is escaped.
/// An even-length run of escape characters before `idx` leaves it bare.
fn trace_escape<T: LikeUnit>(p: &[T], head: usize, idx: usize, escape: Option<T>) -> Option<usize> {
    let esc = escape?;
    let mut q = idx;
    while q > head && p[q - 1] == esc {
        q -= 1;
    }
    if (idx - q) % 2 == 1 {
        Some(q)
    } else {
        None
    }
}

/// Index of the first unescaped `%` in `[head, tail)`, or `tail`.
fn first_percent<T: LikeUnit>(p: &[T], head: usize, tail: usize, escape: Option<T>) -> usize {
    let mut i = head;
    while i < tail {
        if Some(p[i]) == escape {
            i += 2;
            continue;
        }
        if p[i] == T::PERCENT {
            return i;
        }
        i += 1;
    }
    tail
}

/// Index one past the last unescaped `%` in `[head, tail)`, or `head`.
fn last_percent<T: LikeUnit>(p: &[T], head: usize, tail: usize, escape: Option<T>) -> usize {
    let mut i = tail;
    while i > head {
        i -= 1;
        if p[i] == T::PERCENT {
            match trace_escape(p, head, i, escape) {
                Some(run) => i = run,
                None => return i + 1,
            }
        }
    }
    head
}

/// Anchored prefix match of `pattern[ph..pt]` against `s[sh..st]`.
/// Returns the position one past the matched region.
fn compare_pattern<T: LikeUnit>(
    s: &[T],
    sh: usize,
    st: usize,
    pattern: &[T],
    ph: usize,
    pt: usize,
    escape: Option<T>,
) -> Result<Option<usize>> {
    if ph == pt {
        return Ok(Some(sh));
    }
    let mut i = sh;
    let mut j = ph;
    while i != st && j != pt {
        let mut pc = pattern[j];
        if Some(pc) == escape {
            j += 1;
            if j == pt {
                return Err(Error::new(ErrorCode::InvalidEscape));
            }
            pc = pattern[j];
        } else if pc == T::UNDERSCORE {
            i += 1;
            j += 1;
            continue;
        }
        if pc != s[i] {
            break;
        }
        i += 1;
        j += 1;
    }
    Ok(if j == pt { Some(i) } else { None })
}

/// Anchored suffix match of `pattern[ph..pt]` against `s[sh..st]`.
/// Returns the start of the matched region.
fn reverse_compare_pattern<T: LikeUnit>(
    s: &[T],
    st: usize,
    sh: usize,
    pattern: &[T],
    pt: usize,
    ph: usize,
    escape: Option<T>,
) -> Result<Option<usize>> {
    if pt == ph {
        return Ok(Some(st));
    }
    if Some(pattern[pt - 1]) == escape && trace_escape(pattern, ph, pt - 1, escape).is_none() {
        // A bare escape terminates the pattern.
        return Err(Error::new(ErrorCode::InvalidEscape));
    }
    let mut i = st as isize - 1;
    let mut j = pt as isize - 1;
    let s_floor = sh as isize;
    let p_floor = ph as isize;
    while i >= s_floor && j >= p_floor {
        let escaped = trace_escape(pattern, ph, j as usize, escape);
        if escaped.is_none() && pattern[j as usize] == T::UNDERSCORE {
            i -= 1;
            j -= 1;
            continue;
        }
        if pattern[j as usize] != s[i as usize] {
            break;
        }
        if escaped.is_some() {
            j -= 1;
        }
        i -= 1;
        j -= 1;
    }
    Ok(if j < p_floor {
        Some((i + 1) as usize)
    } else {
        None
    })
}

/// Floating match of `pattern[ph..pt]` somewhere in `s[sh..st]`, taking
/// the leftmost occurrence. Returns the position one past it.
fn search_pattern<T: LikeUnit>(
    s: &[T],
    sh: usize,
    st: usize,
    pattern: &[T],
    ph: usize,
    pt: usize,
    escape: Option<T>,
) -> Result<Option<usize>> {
    if ph == pt {
        return Ok(Some(sh));
    }
    let mut i = sh;
    let mut ph = ph;

    // Leading single-character wildcards consume one unit each.
    if escape != Some(T::UNDERSCORE) {
        while ph != pt && pattern[ph] == T::UNDERSCORE && i != st {
            i += 1;
            ph += 1;
        }
    }
    if ph == pt {
        return Ok(Some(i));
    }
    if i == st {
        return Ok(None);
    }

    let head_char = if Some(pattern[ph]) == escape && ph + 1 != pt {
        pattern[ph + 1]
    } else {
        pattern[ph]
    };

    loop {
        while i < st && s[i] != head_char {
            i += 1;
        }
        if i == st {
            return Ok(None);
        }

        let mut next: Option<usize> = None;
        let mut ii = i;
        let mut j = ph;
        while ii != st && j != pt {
            let mut pc = pattern[j];
            if Some(pc) == escape {
                j += 1;
                if j == pt {
                    return Err(Error::new(ErrorCode::InvalidEscape));
                }
                pc = pattern[j];
            } else if pc == T::UNDERSCORE {
                ii += 1;
                j += 1;
                if next.is_none() && ii != st && s[ii] == head_char {
                    next = Some(ii);
                }
                continue;
            }
            if pc != s[ii] {
                break;
            }
            ii += 1;
            j += 1;
            if next.is_none() && ii != st && s[ii] == head_char {
                next = Some(ii);
            }
        }

        if j == pt {
            return Ok(Some(ii));
        }
        if ii == st {
            return Ok(None);
        }
        if let Some(n) = next {
            i = n;
        }
    }
}

/// Whether `pattern` matches the whole of `s`. `%` matches any run,
/// `_` any single unit; `escape` shields either. An empty pattern
/// matches only an empty string. Matching is NO PAD regardless of the
/// field's collation.
pub fn like<T: LikeUnit>(s: &[T], pattern: &[T], escape: Option<T>) -> Result<bool> {
    if pattern.is_empty() {
        return Ok(s.is_empty());
    }

    let st = s.len();
    let pt = pattern.len();
    let first = first_percent(pattern, 0, pt, escape);
    let last = last_percent(pattern, first, pt, escape);

    let head = match compare_pattern(s, 0, st, pattern, 0, first, escape)? {
        Some(h) => h,
        None => return Ok(false),
    };

    if first == last {
        // No percent: the prefix rule must have consumed everything.
        return Ok(head == st);
    }

    let tail = match reverse_compare_pattern(s, st, head, pattern, pt, last, escape)? {
        Some(t) => t,
        None => return Ok(false),
    };

    let mut pat_head = first + 1;
    let pat_tail = last - 1;
    let mut s_head = head;
    while pat_head < pat_tail {
        let fp = first_percent(pattern, pat_head, pat_tail, escape);
        match search_pattern(s, s_head, tail, pattern, pat_head, fp, escape)? {
            Some(pos) => {
                s_head = pos;
                pat_head = fp + 1;
            }
            None => return Ok(false),
        }
    }

    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str, p: &str) -> bool {
        like(s.as_bytes(), p.as_bytes(), None).unwrap()
    }

    fn me(s: &str, p: &str, e: u8) -> Result<bool> {
        like(s.as_bytes(), p.as_bytes(), Some(e))
    }

    #[test]
    fn test_exact_and_empty() {
        assert!(m("abc", "abc"));
        assert!(!m("abc", "abd"));
        assert!(m("", ""));
        assert!(!m("a", ""));
        assert!(!m("", "a"));
    }

    #[test]
    fn test_underscore() {
        assert!(m("abc", "a_c"));
        assert!(m("abc", "___"));
        assert!(!m("abc", "____"));
        assert!(!m("abc", "__"));
    }

    #[test]
    fn test_prefix_and_suffix() {
        assert!(m("abcdef", "abc%"));
        assert!(m("abcdef", "%def"));
        assert!(m("abcdef", "abc%def"));
        assert!(!m("abcdef", "abc%deg"));
        assert!(m("abc", "abc%"));
        assert!(m("abcdef", "%"));
        assert!(m("", "%"));
    }

    #[test]
    fn test_middle_segments() {
        assert!(m("xx-foo-yy-bar-zz", "%foo%bar%"));
        assert!(!m("xx-bar-yy-foo", "%foo%bar%"));
        // The first candidate fails mid-way and the scan must back up to
        // the remembered second candidate.
        assert!(m("aab", "%a_b%"));
        assert!(m("abab", "%abb%") == false);
        assert!(m("aaab", "%aab%"));
    }

    #[test]
    fn test_escape() {
        assert!(me("10%", "10*%", b'*').unwrap());
        assert!(!me("100", "10*%", b'*').unwrap());
        assert!(me("a_b", "a*_b", b'*').unwrap());
        assert!(!me("axb", "a*_b", b'*').unwrap());
        assert!(me("a*b", "a**b", b'*').unwrap());
    }

    #[test]
    fn test_trailing_escape_is_error() {
        assert!(me("abc", "abc*", b'*').is_err());
    }

    #[test]
    fn test_ucs2_units() {
        let s: Vec<u16> = "abc".encode_utf16().collect();
        let p: Vec<u16> = "a%c".encode_utf16().collect();
        assert!(like(&s, &p, None).unwrap());
    }
}
