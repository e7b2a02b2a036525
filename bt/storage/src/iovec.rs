//! Scatter/gather buffer lists.
//!
//! A buffer list is a `Vec` of borrowed byte slices.  The functions here never copy bytes; they
//! only split and regroup the borrowed slices.

use std::mem;

/// A borrowed byte slice that can be split in two without copying.
pub trait IoBuf: Sized {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn split_at(self, mid: usize) -> (Self, Self);
}

impl IoBuf for &[u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn split_at(self, mid: usize) -> (Self, Self) {
        <[u8]>::split_at(self, mid)
    }
}

impl IoBuf for &mut [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn split_at(self, mid: usize) -> (Self, Self) {
        self.split_at_mut(mid)
    }
}

pub fn total_size<B>(bufs: &[B]) -> usize
where
    B: IoBuf,
{
    bufs.iter().map(IoBuf::len).sum()
}

/// Splits off the first `size` bytes of `bufs`, leaving the rest in `bufs`.
///
/// If `bufs` holds fewer than `size` bytes, all of them are taken.
pub fn split_prefix<B>(bufs: &mut Vec<B>, size: usize) -> Vec<B>
where
    B: IoBuf,
{
    let mut prefix = Vec::new();
    let mut rest = Vec::with_capacity(bufs.len());
    let mut size = size;
    for buf in mem::take(bufs) {
        if size == 0 {
            rest.push(buf);
        } else if buf.len() <= size {
            size -= buf.len();
            prefix.push(buf);
        } else {
            let (head, tail) = buf.split_at(size);
            size = 0;
            prefix.push(head);
            rest.push(tail);
        }
    }
    *bufs = rest;
    prefix
}

/// Returns a buffer list over the same memory, truncated to `size` bytes.
pub fn copy_prefix<B>(mut bufs: Vec<B>, size: usize) -> Vec<B>
where
    B: IoBuf,
{
    split_prefix(&mut bufs, size)
}

/// Drops the first `size` bytes of `bufs`.
pub fn advance<B>(mut bufs: Vec<B>, size: usize) -> Vec<B>
where
    B: IoBuf,
{
    split_prefix(&mut bufs, size);
    bufs
}

pub fn zero_fill(bufs: &mut [&mut [u8]]) {
    for buf in bufs {
        buf.fill(0);
    }
}

/// Copies bytes from `src` into `bufs`, and returns the number of bytes copied.
pub(crate) fn copy_from(bufs: &mut [&mut [u8]], mut src: &[u8]) -> usize {
    let mut size = 0;
    for buf in bufs {
        if src.is_empty() {
            break;
        }
        let n = buf.len().min(src.len());
        buf[..n].copy_from_slice(&src[..n]);
        src = &src[n..];
        size += n;
    }
    size
}

/// Copies bytes from `bufs` into `dst`, and returns the number of bytes copied.
pub(crate) fn copy_to(bufs: &[&[u8]], mut dst: &mut [u8]) -> usize {
    let mut size = 0;
    for buf in bufs {
        if dst.is_empty() {
            break;
        }
        let n = buf.len().min(dst.len());
        dst[..n].copy_from_slice(&buf[..n]);
        dst = &mut dst[n..];
        size += n;
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Allocates `n` buffers of sizes `n * 1, n * 2, ..., n * n`.
    fn alloc(n: usize) -> Vec<Vec<u8>> {
        (1..=n).map(|i| vec![0u8; n * i]).collect()
    }

    fn fill_pattern(bufs: &mut [Vec<u8>]) {
        let mut counter = 0u8;
        for buf in bufs {
            for x in buf.iter_mut() {
                *x = counter;
                counter = counter.wrapping_add(1);
            }
        }
    }

    fn check_pattern<'a>(bufs: impl IntoIterator<Item = &'a [u8]>, mut counter: u8) -> usize {
        let mut size = 0;
        for buf in bufs {
            for x in buf {
                assert_eq!(*x, counter);
                counter = counter.wrapping_add(1);
                size += 1;
            }
        }
        size
    }

    #[test]
    fn test_copy_prefix() {
        let mut data = alloc(10);
        fill_pattern(&mut data);
        let bufs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        assert!(total_size(&bufs) >= 106);

        let prefix = copy_prefix(bufs.clone(), 106);
        assert_eq!(total_size(&prefix), 106);
        assert_eq!(prefix.len(), 5);
        assert_eq!(prefix.last().unwrap().len(), 6);
        assert_eq!(check_pattern(prefix, 0), 106);

        let all = copy_prefix(bufs.clone(), 10000);
        assert_eq!(total_size(&all), total_size(&bufs));

        assert_eq!(copy_prefix(bufs, 0).len(), 0);
    }

    #[test]
    fn test_zero_fill() {
        let mut data = alloc(10);
        fill_pattern(&mut data);
        let mut bufs: Vec<&mut [u8]> = data.iter_mut().map(Vec::as_mut_slice).collect();
        zero_fill(&mut bufs);
        assert!(data.iter().flatten().all(|x| *x == 0));
    }

    #[test]
    fn test_total_size() {
        for n in 1..10 {
            let data = alloc(n);
            let bufs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
            let expect: usize = (1..=n).map(|k| n * k).sum();
            assert_eq!(total_size(&bufs), expect);
        }
        assert_eq!(total_size::<&[u8]>(&[]), 0);
    }

    #[test]
    fn test_advance() {
        let mut data = alloc(10);
        fill_pattern(&mut data);
        let bufs: Vec<&[u8]> = data.iter().map(Vec::as_slice).collect();
        let total = total_size(&bufs);

        let rest = advance(bufs.clone(), 13);
        assert_eq!(rest.len(), 9);
        assert_eq!(rest[0].len(), 17);
        assert_eq!(check_pattern(rest, 13), total - 13);

        assert_eq!(advance(bufs.clone(), 10).len(), 9);
        assert_eq!(advance(bufs.clone(), total).len(), 0);
        assert_eq!(advance(bufs, total + 1).len(), 0);
    }

    #[test]
    fn test_split_prefix_mut() {
        let mut data = alloc(3);
        fill_pattern(&mut data);
        let mut bufs: Vec<&mut [u8]> = data.iter_mut().map(Vec::as_mut_slice).collect();

        let mut head = split_prefix(&mut bufs, 4);
        assert_eq!(total_size(&head), 4);
        assert_eq!(total_size(&bufs), 14);
        zero_fill(&mut head);
        drop(head);
        drop(bufs);

        assert_eq!(data[0], [0, 0, 0]);
        assert_eq!(data[1], [0, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_copy_from_to() {
        let mut a = [0u8; 3];
        let mut b = [0u8; 4];
        let mut bufs: Vec<&mut [u8]> = vec![&mut a[..], &mut b[..]];
        assert_eq!(copy_from(&mut bufs, b"hello"), 5);
        assert_eq!(&a, b"hel");
        assert_eq!(&b, b"lo\0\0");

        let mut dst = [0u8; 6];
        assert_eq!(copy_to(&[&b"ab"[..], &b"cde"[..], &b"fgh"[..]], &mut dst), 6);
        assert_eq!(&dst, b"abcdef");
    }
}
