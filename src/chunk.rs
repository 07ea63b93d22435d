//! Immutable element batches.
//!
//! A [`Chunk`] is the unit of transfer between stream stages. Every operation
//! consumes the receiver and returns a new chunk, so a chunk that was handed to
//! another stage can never be observed changing.

use std::ops::Deref;

/// An ordered, immutable batch of elements.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Chunk<A> {
    items: Vec<A>,
}

impl<A> Chunk<A> {
    /// An empty chunk.
    pub fn empty() -> Self {
        Self { items: Vec::new() }
    }

    /// A chunk holding exactly one element.
    pub fn single(item: A) -> Self {
        Self { items: vec![item] }
    }

    /// A chunk holding the given elements.
    pub fn of<I: IntoIterator<Item = A>>(items: I) -> Self {
        items.into_iter().collect()
    }

    /// Wrap a vector without copying.
    pub fn from_vec(items: Vec<A>) -> Self {
        Self { items }
    }

    /// Unwrap into the underlying vector.
    pub fn into_vec(self) -> Vec<A> {
        self.items
    }

    /// Append a single element.
    pub fn append(mut self, item: A) -> Self {
        self.items.push(item);
        self
    }

    /// Concatenate two chunks.
    pub fn append_all(mut self, other: Chunk<A>) -> Self {
        if self.items.is_empty() {
            return other;
        }
        self.items.extend(other.items);
        self
    }

    /// Keep the first `n` elements.
    pub fn take(mut self, n: usize) -> Self {
        self.items.truncate(n);
        self
    }

    /// Remove the first `n` elements.
    pub fn drop(self, n: usize) -> Self {
        self.split_at(n).1
    }

    /// Keep the last `n` elements.
    pub fn take_right(self, n: usize) -> Self {
        let len = self.items.len();
        self.drop(len.saturating_sub(n))
    }

    /// Split into the first `n` elements and the rest.
    pub fn split_at(mut self, n: usize) -> (Self, Self) {
        let n = n.min(self.items.len());
        let rest = self.items.split_off(n);
        (self, Self { items: rest })
    }

    /// Split before the first element matching `pred`.
    ///
    /// When nothing matches, the whole chunk is the prefix.
    pub fn split_where<F>(self, pred: F) -> (Self, Self)
    where
        F: FnMut(&A) -> bool,
    {
        let index = self.items.iter().position(pred).unwrap_or(self.items.len());
        self.split_at(index)
    }

    /// Transform every element.
    pub fn map<B, F>(self, f: F) -> Chunk<B>
    where
        F: FnMut(A) -> B,
    {
        Chunk {
            items: self.items.into_iter().map(f).collect(),
        }
    }

    /// Keep elements matching `pred`.
    pub fn filter<F>(mut self, mut pred: F) -> Self
    where
        F: FnMut(&A) -> bool,
    {
        self.items.retain(|item| pred(item));
        self
    }

    /// Transform and filter in one pass.
    pub fn filter_map<B, F>(self, f: F) -> Chunk<B>
    where
        F: FnMut(A) -> Option<B>,
    {
        Chunk {
            items: self.items.into_iter().filter_map(f).collect(),
        }
    }

    /// Pair elements positionally; the result is as long as the shorter side.
    pub fn zip_with<B, C, F>(self, other: Chunk<B>, mut f: F) -> Chunk<C>
    where
        F: FnMut(A, B) -> C,
    {
        Chunk {
            items: self
                .items
                .into_iter()
                .zip(other.items)
                .map(|(a, b)| f(a, b))
                .collect(),
        }
    }

    /// Move out the final element, if any.
    pub fn last_owned(self) -> Option<A> {
        self.items.into_iter().next_back()
    }

    /// Move out the first element, if any.
    pub fn first_owned(self) -> Option<A> {
        self.items.into_iter().next()
    }
}

impl<A> Default for Chunk<A> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<A> Deref for Chunk<A> {
    type Target = [A];

    fn deref(&self) -> &[A] {
        &self.items
    }
}

impl<A> AsRef<[A]> for Chunk<A> {
    fn as_ref(&self) -> &[A] {
        &self.items
    }
}

impl<A> From<Vec<A>> for Chunk<A> {
    fn from(items: Vec<A>) -> Self {
        Self { items }
    }
}

impl<A, const N: usize> From<[A; N]> for Chunk<A> {
    fn from(items: [A; N]) -> Self {
        Self {
            items: items.into(),
        }
    }
}

impl<A> From<Chunk<A>> for Vec<A> {
    fn from(chunk: Chunk<A>) -> Self {
        chunk.items
    }
}

impl<A> FromIterator<A> for Chunk<A> {
    fn from_iter<I: IntoIterator<Item = A>>(iter: I) -> Self {
        Self {
            items: iter.into_iter().collect(),
        }
    }
}

impl<A> IntoIterator for Chunk<A> {
    type Item = A;
    type IntoIter = std::vec::IntoIter<A>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, A> IntoIterator for &'a Chunk<A> {
    type Item = &'a A;
    type IntoIter = std::slice::Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}
