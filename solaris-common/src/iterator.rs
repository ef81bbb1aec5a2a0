//! Fallible synchronous iterator used by the chunk reader, local log
//! engine and merge iterator: an `Iterator`-alike whose `next`
//! can fail, so callers don't have to thread `Result<Option<T>>` through
//! combinators by hand.

use crate::error::Result;

pub trait IteratorIO {
    type Item;

    fn next(&mut self) -> Result<Option<Self::Item>>;

    fn map<F, A>(self, func: F) -> Map<F, Self>
    where
        Self: Sized,
        F: FnMut(Self::Item) -> A,
    {
        Map { func, inner: self }
    }

    fn collect(mut self) -> Result<Vec<Self::Item>>
    where
        Self: Sized,
    {
        let mut out = Vec::new();

        while let Some(item) = self.next()? {
            out.push(item);
        }

        Ok(out)
    }

    fn take(self, n: usize) -> Take<Self>
    where
        Self: Sized,
    {
        Take { inner: self, remaining: n }
    }
}

pub struct Map<F, I> {
    func: F,
    inner: I,
}

impl<F, A, I> IteratorIO for Map<F, I>
where
    I: IteratorIO,
    F: FnMut(I::Item) -> A,
{
    type Item = A;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        if let Some(item) = self.inner.next()? {
            return Ok(Some((self.func)(item)));
        }

        Ok(None)
    }
}

pub struct Take<I> {
    inner: I,
    remaining: usize,
}

impl<I: IteratorIO> IteratorIO for Take<I> {
    type Item = I::Item;

    fn next(&mut self) -> Result<Option<Self::Item>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        self.remaining -= 1;
        self.inner.next()
    }
}
