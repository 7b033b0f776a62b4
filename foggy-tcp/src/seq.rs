//! Wrap-around comparisons on 32-bit sequence numbers.
//!
//! Two sequence numbers are comparable while they are less than `2^31`
//! apart, which always holds for windows bounded by the 16-bit advertised
//! window and the send buffer.

#[inline]
pub fn lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn gt(a: u32, b: u32) -> bool {
    lt(b, a)
}

/// Signed distance from `from` to `to`.
#[inline]
pub fn diff(to: u32, from: u32) -> i64 {
    i64::from(to.wrapping_sub(from) as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_without_wrap() {
        assert!(lt(1, 2));
        assert!(le(2, 2));
        assert!(gt(3, 2));
        assert!(!lt(2, 2));
    }

    #[test]
    fn ordering_across_wrap() {
        let near_max = u32::MAX - 3;
        assert!(lt(near_max, 5));
        assert!(gt(5, near_max));
        assert_eq!(diff(5, near_max), 9);
        assert_eq!(diff(near_max, 5), -9);
    }
}
