//! Fixed-size batching of delivery payloads

use crate::error::{Error, Result};

/// Split `items` into contiguous chunks of `size`
///
/// Every chunk but the last holds exactly `size` items; concatenating the
/// chunks yields `items` unchanged. Empty input yields no chunks.
pub fn chunk<T>(items: &[T], size: usize) -> Result<Vec<&[T]>> {
    if size == 0 {
        return Err(Error::config("batch size must be positive", "batch_size"));
    }
    Ok(items.chunks(size).collect())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_preserve_order_and_content() {
        let items: Vec<u32> = (0..123).collect();
        for size in [1, 7, 50, 122, 123, 500] {
            let chunks = chunk(&items, size).unwrap();
            let rejoined: Vec<u32> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
            assert_eq!(rejoined, items, "size {size}");
            let (last, full) = chunks.split_last().unwrap();
            assert!(full.iter().all(|c| c.len() == size), "size {size}");
            assert!(!last.is_empty() && last.len() <= size, "size {size}");
        }
    }

    #[test]
    fn test_exact_multiple_has_no_short_tail() {
        let items = [1, 2, 3, 4];
        let chunks = chunk(&items, 2).unwrap();
        assert_eq!(chunks, vec![&[1, 2][..], &[3, 4][..]]);
    }

    #[test]
    fn test_empty_input_yields_no_chunks() {
        let items: [u8; 0] = [];
        assert!(chunk(&items, 50).unwrap().is_empty());
    }

    #[test]
    fn test_zero_size_is_a_config_error() {
        assert!(matches!(chunk(&[1], 0), Err(Error::Config { .. })));
    }
}
