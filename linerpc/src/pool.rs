use std::sync::{
    Arc, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

/// How the selection cursor behaves once it runs past the end of the pool.
#[derive(Deserialize, Serialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Balance {
    /// Return the first entry and restart the cursor at 1. Under concurrent
    /// selection or after the pool shrinks this lands on index 0 more often
    /// than on the others.
    #[default]
    WrapToFirst,
    /// Plain `cursor mod len`.
    Modulo,
}

/// Round-robin pool of live connections.
///
/// The member list is copy-on-write: mutations build a new `Vec` and swap it in,
/// while [`select`](Self::select) clones the current `Arc` and indexes into that
/// snapshot. A selection therefore sees the list either before or after a
/// concurrent `add`/`remove`, never in between, and its bounds check is always
/// against the snapshot it reads from.
#[derive(Debug)]
pub struct ConnectionPool<C> {
    members: RwLock<Arc<Vec<C>>>,
    cursor: AtomicUsize,
    balance: Balance,
}

impl<C> Default for ConnectionPool<C> {
    fn default() -> Self {
        Self::new(Balance::default())
    }
}

impl<C> ConnectionPool<C> {
    #[must_use]
    pub fn new(balance: Balance) -> Self {
        Self {
            members: RwLock::new(Arc::new(Vec::new())),
            cursor: AtomicUsize::new(0),
            balance,
        }
    }

    /// The current member list.
    #[must_use]
    pub fn snapshot(&self) -> Arc<Vec<C>> {
        match self.members.read() {
            Ok(members) => members.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.snapshot().is_empty()
    }

    fn update<R>(&self, f: impl FnOnce(&mut Vec<C>) -> R) -> R
    where
        C: Clone,
    {
        let mut members = match self.members.write() {
            Ok(members) => members,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut next = Vec::clone(&members);
        let result = f(&mut next);
        *members = Arc::new(next);
        result
    }

    pub fn add(&self, conn: C)
    where
        C: Clone,
    {
        self.update(|members| members.push(conn));
    }

    /// Removes every entry equal to `conn`. Returns whether anything was removed.
    pub fn remove(&self, conn: &C) -> bool
    where
        C: Clone + PartialEq,
    {
        self.remove_where(|member| member == conn) > 0
    }

    /// Removes every entry matching `pred` and returns how many were removed.
    pub fn remove_where(&self, mut pred: impl FnMut(&C) -> bool) -> usize
    where
        C: Clone,
    {
        self.update(|members| {
            let before = members.len();
            members.retain(|member| !pred(member));
            before - members.len()
        })
    }

    pub fn clear(&self)
    where
        C: Clone,
    {
        self.update(Vec::clear);
    }

    /// Picks the next member in round-robin order.
    ///
    /// # Errors
    ///
    /// Fails with `PoolExhausted` when the pool is empty.
    pub fn select(&self) -> Result<C>
    where
        C: Clone,
    {
        let members = self.snapshot();
        let len = members.len();
        if len == 0 {
            return Err(Error::new(
                ErrorKind::PoolExhausted,
                "no connection available".to_string(),
            ));
        }

        let pos = self.cursor.fetch_add(1, Ordering::AcqRel);
        let index = match self.balance {
            Balance::WrapToFirst if pos >= len => {
                self.cursor.store(1, Ordering::Release);
                0
            }
            Balance::WrapToFirst => pos,
            Balance::Modulo => pos % len,
        };
        Ok(members[index].clone())
    }
}
