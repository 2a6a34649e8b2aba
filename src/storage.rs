//! Collects finalized output files, keeping only the N largest when the
//! report size is bounded. The running byte total covers every accepted
//! entry, including ones later evicted from the bounded set.

use crate::task_state::OutputFilePtr;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

struct HeapEntry(OutputFilePtr);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .size
            .cmp(&other.0.size)
            .then_with(|| self.0.filename.cmp(&other.0.filename))
    }
}

pub struct FileStorage {
    /// Min-heap so the smallest retained entry is cheap to evict.
    heap: BinaryHeap<Reverse<HeapEntry>>,
    /// Negative means unbounded, zero means collect nothing.
    capacity: i64,
    store_empty: bool,
    total_size: u64,
}

impl FileStorage {
    pub fn new(capacity: i64, store_empty: bool) -> FileStorage {
        FileStorage {
            heap: BinaryHeap::new(),
            capacity,
            store_empty,
            total_size: 0,
        }
    }

    pub fn add(&mut self, file: OutputFilePtr) {
        if self.capacity == 0 {
            return;
        }
        if file.size == 0 && !self.store_empty {
            return;
        }
        self.total_size += file.size;
        if self.capacity > 0 && self.heap.len() as i64 >= self.capacity {
            match self.heap.peek() {
                Some(Reverse(smallest)) if file.size > smallest.0.size => {
                    self.heap.pop();
                }
                _ => return,
            }
        }
        self.heap.push(Reverse(HeapEntry(file)));
    }

    /// Total bytes across all accepted files, not just the retained ones.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Snapshot of the retained entries, largest first.
    pub fn largest_files(&self) -> Vec<OutputFilePtr> {
        let mut entries: Vec<OutputFilePtr> = self
            .heap
            .iter()
            .map(|Reverse(e)| std::rc::Rc::clone(&e.0))
            .collect();
        entries.sort_by(|a, b| {
            b.size
                .cmp(&a.size)
                .then_with(|| a.filename.cmp(&b.filename))
        });
        entries
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::task_state::{OutputFile, ProcInfo};

    fn entry(name: &str, size: u64) -> OutputFilePtr {
        OutputFile::new(name.into(), size, ProcInfo::new(100, 1, "prog".into(), "prog".into()))
    }

    #[test]
    fn keeps_the_largest_within_capacity() {
        let mut s = FileStorage::new(2, false);
        s.add(entry("/a", 10));
        s.add(entry("/b", 50));
        s.add(entry("/c", 20));
        let kept = s.largest_files();
        let names: Vec<&str> = kept.iter().map(|f| f.filename.as_str()).collect();
        assert_eq!(names, ["/b", "/c"]);
    }

    #[test]
    fn total_counts_evicted_entries() {
        let mut s = FileStorage::new(2, false);
        s.add(entry("/a", 10));
        s.add(entry("/b", 50));
        s.add(entry("/c", 20));
        assert_eq!(s.total_size(), 80);
    }

    #[test]
    fn entry_not_above_minimum_is_rejected() {
        let mut s = FileStorage::new(1, false);
        s.add(entry("/a", 50));
        s.add(entry("/b", 50));
        assert_eq!(s.total_size(), 100);
        let kept = s.largest_files();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].filename, "/a");
    }

    #[test]
    fn unbounded_keeps_everything_sorted() {
        let mut s = FileStorage::new(-1, false);
        for (name, size) in [("/a", 3u64), ("/b", 9), ("/c", 1), ("/d", 7)].iter() {
            s.add(entry(name, *size));
        }
        let sizes: Vec<u64> = s.largest_files().iter().map(|f| f.size).collect();
        assert_eq!(sizes, [9, 7, 3, 1]);
    }

    #[test]
    fn zero_capacity_collects_nothing() {
        let mut s = FileStorage::new(0, false);
        s.add(entry("/a", 10));
        assert_eq!(s.total_size(), 0);
        assert!(s.largest_files().is_empty());
    }

    #[test]
    fn empty_files_are_dropped_unless_requested() {
        let mut s = FileStorage::new(-1, false);
        s.add(entry("/a", 0));
        assert!(s.largest_files().is_empty());

        let mut s = FileStorage::new(-1, true);
        s.add(entry("/a", 0));
        assert_eq!(s.largest_files().len(), 1);
    }
}
