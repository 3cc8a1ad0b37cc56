//! Wrap-aware arithmetic for 16 bit sequence numbers.
//!
//! Sequence numbers wrap through 65535 back to 0, so plain `>` / `<` give the wrong
//! answer once a counter passes the wrap point. The comparisons here treat two numbers
//! as "close" if they are within half the sequence space of each other and assume a wrap
//! otherwise: `sequence_greater_than(1, 0)` holds, and so does
//! `sequence_greater_than(0, 65535)`.

/// True if `s1` is greater than `s2`, considering wrapping.
///
/// NB: This is *not* the same as `s1 > s2`.
#[inline]
pub fn sequence_greater_than(s1: u16, s2: u16) -> bool {
    ((s1 > s2) && (s1 - s2 <= 32768)) || ((s1 < s2) && (s2 - s1 > 32768))
}

/// True if `s1` is less than `s2`, considering wrapping.
///
/// NB: This is *not* the same as `s1 < s2`.
#[inline]
pub fn sequence_less_than(s1: u16, s2: u16) -> bool {
    sequence_greater_than(s2, s1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::adjacent(1, 0, true)]
    #[case::wrapped(0, 65535, true)]
    #[case::half_window(32768, 0, true)]
    #[case::past_half_window(32769, 0, false)]
    #[case::equal(7, 7, false)]
    #[case::plain_less(3, 9, false)]
    #[case::wrapped_less(65535, 0, false)]
    fn test_sequence_greater_than(#[case] s1: u16, #[case] s2: u16, #[case] expected: bool) {
        assert_eq!(sequence_greater_than(s1, s2), expected);
    }

    #[rstest]
    #[case::adjacent(0, 1, true)]
    #[case::wrapped(65535, 0, true)]
    #[case::equal(7, 7, false)]
    #[case::plain_greater(9, 3, false)]
    fn test_sequence_less_than(#[case] s1: u16, #[case] s2: u16, #[case] expected: bool) {
        assert_eq!(sequence_less_than(s1, s2), expected);
    }

    #[test]
    fn test_greater_than_holds_across_the_half_window() {
        // any positive distance up to half the sequence space compares as greater,
        // regardless of where the window sits
        for a in (0..=65535u16).step_by(251) {
            for d in (1..=32768u16).step_by(97).chain([1, 2, 32767, 32768]) {
                let b = a.wrapping_add(d);
                assert!(sequence_greater_than(b, a), "a={} d={}", a, d);
                assert!(sequence_less_than(a, b), "a={} d={}", a, d);
            }
        }
    }
}
