/*!
 * In-Memory Storage Implementation
 *
 * The backing store of one logical database: a concurrent byte-keyed map
 * hashed with AHash. Connection threads share it without an outer lock.
 */

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::hash::BuildHasherDefault;

// AHash is considerably faster than SipHash for short keys
type AHash = BuildHasherDefault<ahash::AHasher>;

/// Concurrent key-value dictionary
///
/// Values are plain byte strings; the store has no other data types.
#[derive(Default)]
pub struct Dict {
    inner: DashMap<Bytes, Bytes, AHash>,
}

impl Dict {
    #[inline]
    pub fn get(&self, k: &[u8]) -> Option<Bytes> {
        self.inner.get(k).map(|v| v.value().clone())
    }

    /// Insert or overwrite a key
    ///
    /// # Returns
    /// * `1` if the key is new, `0` if an existing value was replaced
    #[inline]
    pub fn put(&self, k: Bytes, v: Bytes) -> i64 {
        match self.inner.insert(k, v) {
            Some(_) => 0,
            None => 1,
        }
    }

    /// Like [`Dict::put`], running `then` before the key's shard is unlocked
    pub fn put_with(&self, k: Bytes, v: Bytes, then: impl FnOnce()) -> i64 {
        match self.inner.entry(k) {
            Entry::Occupied(mut e) => {
                e.insert(v);
                then();
                0
            }
            Entry::Vacant(e) => {
                let _held = e.insert(v);
                then();
                1
            }
        }
    }

    /// Insert only when the key is absent; returns `1` if inserted.
    /// `then` runs under the shard lock, and only on insert.
    pub fn put_if_absent(&self, k: Bytes, v: Bytes, then: impl FnOnce()) -> i64 {
        match self.inner.entry(k) {
            Entry::Occupied(_) => 0,
            Entry::Vacant(e) => {
                let _held = e.insert(v);
                then();
                1
            }
        }
    }

    /// Replace the value and hand back the previous one
    pub fn swap(&self, k: Bytes, v: Bytes, then: impl FnOnce()) -> Option<Bytes> {
        match self.inner.entry(k) {
            Entry::Occupied(mut e) => {
                let old = e.insert(v);
                then();
                Some(old)
            }
            Entry::Vacant(e) => {
                let _held = e.insert(v);
                then();
                None
            }
        }
    }

    /// Delete a key, returning its value if it existed
    #[inline]
    pub fn remove(&self, k: &[u8]) -> Option<Bytes> {
        self.inner.remove(k).map(|(_, v)| v)
    }

    /// Delete a key; `then` runs under the shard lock, and only if it existed
    pub fn remove_with(&self, k: &[u8], then: impl FnOnce()) -> Option<Bytes> {
        self.inner
            .remove_if(k, |_, _| {
                then();
                true
            })
            .map(|(_, v)| v)
    }

    #[inline]
    pub fn contains(&self, k: &[u8]) -> bool {
        self.inner.contains_key(k)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Snapshot of every key. Concurrent writers may or may not be reflected.
    pub fn keys(&self) -> Vec<Bytes> {
        self.inner.iter().map(|e| e.key().clone()).collect()
    }

    pub fn clear(&self) {
        self.inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn conditional_puts() {
        let d = Dict::default();
        let logged = Cell::new(0);
        let log = || logged.set(logged.get() + 1);
        assert_eq!(d.put_if_absent(Bytes::from_static(b"k"), Bytes::from_static(b"1"), log), 1);
        assert_eq!(d.put_if_absent(Bytes::from_static(b"k"), Bytes::from_static(b"2"), log), 0);
        assert_eq!(logged.get(), 1);
        assert_eq!(
            d.swap(Bytes::from_static(b"k"), Bytes::from_static(b"3"), log),
            Some(Bytes::from_static(b"1"))
        );
        assert_eq!(d.get(b"k"), Some(Bytes::from_static(b"3")));
        assert_eq!(d.put_with(Bytes::from_static(b"k"), Bytes::from_static(b"4"), log), 0);
        assert_eq!(d.len(), 1);
        assert_eq!(logged.get(), 3);
    }

    #[test]
    fn callbacks_see_the_key_locked() {
        let d = Dict::default();
        d.put(Bytes::from_static(b"k"), Bytes::from_static(b"1"));
        // a blocking read of the same key from the callback would deadlock,
        // so check from another thread that the write is not visible yet
        let seen = std::thread::scope(|s| {
            let mut seen = None;
            d.put_with(Bytes::from_static(b"k"), Bytes::from_static(b"2"), || {
                seen = s
                    .spawn(|| d.inner.try_get(&b"k"[..]).is_locked())
                    .join()
                    .ok();
            });
            seen
        });
        assert_eq!(seen, Some(true));

        assert!(d.remove_with(b"missing", || panic!("nothing to remove")).is_none());
        let mut ran = false;
        assert_eq!(d.remove_with(b"k", || ran = true), Some(Bytes::from_static(b"2")));
        assert!(ran);
        assert!(d.is_empty());
    }
}
