// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The identifier registry: an ordered map that also supports multiple
//! values per key, as the vgname-to-vgid table needs (VG names are not
//! unique). Values are owned; ownership passes in on insert and back
//! out on remove. The registry itself performs no locking; the cache
//! imposes it.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct Registry<K: Ord, V> {
    map: BTreeMap<K, Vec<V>>,
}

impl<K: Ord + Clone, V> Registry<K, V> {
    pub fn new() -> Registry<K, V> {
        Registry {
            map: BTreeMap::new(),
        }
    }

    /// The first value for the key, if any.
    pub fn lookup(&self, k: &K) -> Option<&V> {
        self.map.get(k).and_then(|v| v.first())
    }

    pub fn lookup_mut(&mut self, k: &K) -> Option<&mut V> {
        self.map.get_mut(k).and_then(|v| v.first_mut())
    }

    /// The first value for the key, plus how many entries share it.
    pub fn lookup_with_count(&self, k: &K) -> Option<(&V, usize)> {
        self.map.get(k).and_then(|v| v.first().map(|f| (f, v.len())))
    }

    /// Insert, replacing any existing entries for the key. Returns the
    /// first replaced value.
    pub fn insert(&mut self, k: K, v: V) -> Option<V> {
        self.map
            .insert(k, vec![v])
            .and_then(|mut old| {
                if old.is_empty() {
                    None
                } else {
                    Some(old.swap_remove(0))
                }
            })
    }

    /// Insert without disturbing existing entries for the key.
    pub fn insert_allow_multiple(&mut self, k: K, v: V) {
        self.map.entry(k).or_insert_with(Vec::new).push(v);
    }

    /// Remove the (sole) entry for the key.
    pub fn remove(&mut self, k: &K) -> Option<V> {
        match self.map.remove(k) {
            Some(mut v) if !v.is_empty() => Some(v.swap_remove(0)),
            _ => None,
        }
    }

    pub fn contains_key(&self, k: &K) -> bool {
        self.map.contains_key(k)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k, v)))
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl<K: Ord + Clone, V: PartialEq> Registry<K, V> {
    /// Find the specific value among duplicates for the key.
    pub fn lookup_with_val(&self, k: &K, val: &V) -> Option<&V> {
        self.map.get(k).and_then(|vs| vs.iter().find(|v| *v == val))
    }

    /// Remove only the matching (key, value) pair. Returns the removed
    /// value, passing ownership back out.
    pub fn remove_with_val(&mut self, k: &K, val: &V) -> Option<V> {
        let vs = self.map.get_mut(k)?;
        let pos = vs.iter().position(|v| v == val)?;
        let removed = vs.remove(pos);
        if vs.is_empty() {
            self.map.remove(k);
        }
        Some(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_value_replace() {
        let mut r: Registry<String, String> = Registry::new();
        assert!(r.insert("k".to_string(), "a".to_string()).is_none());
        let old = r.insert("k".to_string(), "b".to_string());
        assert_eq!(old, Some("a".to_string()));
        assert_eq!(r.lookup(&"k".to_string()), Some(&"b".to_string()));
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn multimap_count_and_val() {
        let mut r: Registry<String, String> = Registry::new();
        r.insert_allow_multiple("vg".to_string(), "uuid1".to_string());
        r.insert_allow_multiple("vg".to_string(), "uuid2".to_string());

        let (_, count) = r.lookup_with_count(&"vg".to_string()).unwrap();
        assert_eq!(count, 2);
        assert_eq!(
            r.lookup_with_val(&"vg".to_string(), &"uuid2".to_string()),
            Some(&"uuid2".to_string())
        );
        assert!(r
            .lookup_with_val(&"vg".to_string(), &"uuid3".to_string())
            .is_none());
    }

    #[test]
    fn remove_with_val_leaves_siblings() {
        let mut r: Registry<String, String> = Registry::new();
        r.insert_allow_multiple("vg".to_string(), "uuid1".to_string());
        r.insert_allow_multiple("vg".to_string(), "uuid2".to_string());

        let out = r.remove_with_val(&"vg".to_string(), &"uuid1".to_string());
        assert_eq!(out, Some("uuid1".to_string()));
        assert_eq!(r.lookup(&"vg".to_string()), Some(&"uuid2".to_string()));

        r.remove_with_val(&"vg".to_string(), &"uuid2".to_string());
        assert!(!r.contains_key(&"vg".to_string()));
    }

    #[test]
    fn binary_keys() {
        let mut r: Registry<u64, String> = Registry::new();
        r.insert(2049, "pv1".to_string());
        r.insert(2050, "pv2".to_string());
        assert_eq!(r.lookup(&2049), Some(&"pv1".to_string()));
        assert_eq!(r.remove(&2049), Some("pv1".to_string()));
        assert!(r.lookup(&2049).is_none());
    }

    #[test]
    fn iteration_yields_all_pairs() {
        let mut r: Registry<String, i32> = Registry::new();
        r.insert_allow_multiple("a".to_string(), 1);
        r.insert_allow_multiple("a".to_string(), 2);
        r.insert("b".to_string(), 3);
        let pairs: Vec<_> = r.iter().map(|(k, v)| (k.clone(), *v)).collect();
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), 1),
                ("a".to_string(), 2),
                ("b".to_string(), 3)
            ]
        );
    }
}
