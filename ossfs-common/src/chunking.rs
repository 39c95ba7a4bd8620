//! Size arithmetic for chunked transfers and batched deletes.

use std::ops::Range;

use crate::error::FsError;
use crate::path;

/// Most keys a single bulk-delete request may carry.
pub const MAX_BATCH_DELETE: usize = 1000;
/// Largest object a single put may create.
pub const MAX_SINGLE_PUT: u64 = 5 * 1024 * 1024 * 1024;
/// Retries never shrink a transfer chunk below this.
pub const MIN_RETRY_CHUNK: usize = 64 * 1024;

/// Payloads below this size skip multipart and go out in one put.
pub fn single_put_limit(block_size: usize) -> u64 {
    MAX_SINGLE_PUT.min(2 * block_size as u64)
}

/// Consecutive `part_size` ranges covering `0..total`; the last may be short.
pub fn part_ranges(total: u64, part_size: u64) -> Vec<Range<u64>> {
    if part_size == 0 {
        return vec![0..total];
    }
    let mut ranges = Vec::with_capacity((total / part_size + 1) as usize);
    let mut start = 0;
    while start < total {
        let end = (start + part_size).min(total);
        ranges.push(start..end);
        start = end;
    }
    ranges
}

/// Chunk length to attempt on retry `attempt` (0-based): halved per attempt,
/// floored at [`MIN_RETRY_CHUNK`] unless the chunk is already smaller.
pub fn shrink_for_attempt(len: usize, attempt: u32) -> usize {
    let floor = len.min(MIN_RETRY_CHUNK);
    len.checked_shr(attempt).unwrap_or(0).max(floor)
}

/// Clamp a requested byte span to an object of `size` bytes. `None` when
/// nothing remains to fetch.
pub fn clamp_range(start: u64, end: u64, size: u64) -> Option<Range<u64>> {
    let end = end.min(size);
    if start >= end || start >= size {
        None
    } else {
        Some(start..end)
    }
}

/// Validate a bulk-delete request and split it into `(container, keys)`.
///
/// All paths must address keys in one container and there may be at most
/// [`MAX_BATCH_DELETE`] of them.
pub fn batch_delete_keys(paths: &[String]) -> Result<(String, Vec<String>), FsError> {
    if paths.len() > MAX_BATCH_DELETE {
        return Err(FsError::InvalidArgument(format!(
            "max number of files to delete in one call is {}",
            MAX_BATCH_DELETE
        )));
    }
    let mut container: Option<String> = None;
    let mut keys = Vec::with_capacity(paths.len());
    for p in paths {
        let loc = path::resolve(p);
        if loc.key.is_empty() {
            return Err(FsError::InvalidArgument(format!("{} is not an object path", p)));
        }
        match &container {
            Some(c) if *c != loc.container => {
                return Err(FsError::InvalidArgument(
                    "bulk delete files should refer to only one bucket".into(),
                ));
            }
            Some(_) => {}
            None => container = Some(loc.container.clone()),
        }
        keys.push(loc.key);
    }
    match container {
        Some(c) => Ok((c, keys)),
        None => Err(FsError::InvalidArgument("no paths to delete".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_single_put_limit() {
        assert_eq!(single_put_limit(5 * 1024 * 1024), 10 * 1024 * 1024);
        assert_eq!(single_put_limit(4 * 1024 * 1024 * 1024), MAX_SINGLE_PUT);
    }

    #[test]
    fn test_part_ranges() {
        assert_eq!(part_ranges(10, 4), vec![0..4, 4..8, 8..10]);
        assert_eq!(part_ranges(8, 4), vec![0..4, 4..8]);
        assert!(part_ranges(0, 4).is_empty());
    }

    #[test]
    fn test_shrink_for_attempt() {
        let len = 8 * 1024 * 1024;
        assert_eq!(shrink_for_attempt(len, 0), len);
        assert_eq!(shrink_for_attempt(len, 1), len / 2);
        assert_eq!(shrink_for_attempt(len, 2), len / 4);
        assert_eq!(shrink_for_attempt(len, 40), MIN_RETRY_CHUNK);
        assert_eq!(shrink_for_attempt(100, 3), 100);
    }

    #[test]
    fn test_clamp_range() {
        assert_eq!(clamp_range(0, 100, 50), Some(0..50));
        assert_eq!(clamp_range(10, 20, 50), Some(10..20));
        assert_eq!(clamp_range(60, 70, 50), None);
        assert_eq!(clamp_range(20, 20, 50), None);
        assert_eq!(clamp_range(0, 10, 0), None);
    }

    #[test]
    fn test_batch_delete_keys() {
        let paths = vec!["/b/one".to_string(), "oss://b/dir/two".to_string()];
        let (bucket, keys) = batch_delete_keys(&paths).unwrap();
        assert_eq!(bucket, "b");
        assert_eq!(keys, vec!["one", "dir/two"]);
    }

    #[test]
    fn test_batch_delete_rejects_mixed_buckets() {
        let paths = vec!["/a/one".to_string(), "/b/two".to_string()];
        let err = batch_delete_keys(&paths).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_batch_delete_rejects_oversized() {
        let paths: Vec<String> = (0..1001).map(|i| format!("/b/k{i}")).collect();
        let err = batch_delete_keys(&paths).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(batch_delete_keys(&paths[..1000]).is_ok());
    }
}
