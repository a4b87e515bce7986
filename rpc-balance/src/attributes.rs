/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

/// Restricts the attribute map to types that support value-based comparison,
/// so that two maps holding equal values compare equal without relying on
/// pointer identity.
trait AttributeValue: Any + Send + Sync + Debug {
    fn as_any(&self) -> &dyn Any;
    fn eq_value(&self, other: &dyn AttributeValue) -> bool;
    fn cmp_value(&self, other: &dyn AttributeValue) -> Ordering;
}

impl<T: Any + Send + Sync + Eq + Ord + Debug> AttributeValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_value(&self, other: &dyn AttributeValue) -> bool {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self == other,
            None => false,
        }
    }

    fn cmp_value(&self, other: &dyn AttributeValue) -> Ordering {
        match other.as_any().downcast_ref::<T>() {
            Some(other) => self.cmp(other),
            // Entries are keyed by TypeId, so same-slot comparisons are
            // always same-type; fall back to the key order otherwise.
            None => TypeId::of::<T>().cmp(&other.as_any().type_id()),
        }
    }
}

/// A small immutable collection of values indexed by their type.
///
/// Adding or removing a value produces a new `Attributes`; existing clones
/// are unaffected.  Equality and ordering are structural over the stored
/// values, which must implement `Any + Send + Sync + Eq + Ord + Debug`.
///
/// Intended for the handful of optional per-address or per-update values
/// (weights, authorities, and the like) carried alongside resolver output.
#[derive(Clone, Default, Debug)]
pub struct Attributes {
    // Sorted by TypeId; shared storage, clone-on-write.
    entries: Vec<(TypeId, Arc<dyn AttributeValue>)>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new `Attributes` with the value added, replacing any
    /// existing value of the same type.
    pub fn add<T: Send + Sync + Eq + Ord + Debug + 'static>(&self, value: T) -> Self {
        let id = TypeId::of::<T>();
        let mut entries = self.entries.clone();
        let value: Arc<dyn AttributeValue> = Arc::new(value);
        match entries.binary_search_by_key(&id, |(k, _)| *k) {
            Ok(idx) => entries[idx] = (id, value),
            Err(idx) => entries.insert(idx, (id, value)),
        }
        Attributes { entries }
    }

    /// Gets a reference to the value of type `T`, if present.
    pub fn get<T: 'static>(&self) -> Option<&T> {
        let id = TypeId::of::<T>();
        let idx = self.entries.binary_search_by_key(&id, |(k, _)| *k).ok()?;
        self.entries[idx].1.as_any().downcast_ref()
    }

    /// Returns a new `Attributes` with any value of type `T` removed.
    pub fn remove<T: 'static>(&self) -> Self {
        let id = TypeId::of::<T>();
        let mut entries = self.entries.clone();
        if let Ok(idx) = entries.binary_search_by_key(&id, |(k, _)| *k) {
            entries.remove(idx);
        }
        Attributes { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PartialEq for Attributes {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .zip(&other.entries)
                .all(|((k1, v1), (k2, v2))| k1 == k2 && v1.eq_value(v2.as_ref()))
    }
}

impl Eq for Attributes {}

impl PartialOrd for Attributes {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Attributes {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut lhs = self.entries.iter();
        let mut rhs = other.entries.iter();
        loop {
            match (lhs.next(), rhs.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some((k1, v1)), Some((k2, v2))) => {
                    let ord = k1.cmp(k2).then_with(|| v1.cmp_value(v2.as_ref()));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}
