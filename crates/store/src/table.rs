//! In-memory table: one owning store per entity kind.
//!
//! Every method takes `&self` and returns owned clones, so a table can be
//! shared behind an `Arc` by any number of tasks. Reads run concurrently;
//! writes are serialised by the inner `RwLock`.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::StoreError;

/// Anything a [`MemoryTable`] can hold.
pub trait Record: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;
}

#[derive(Debug)]
struct Inner<T> {
    rows: HashMap<Uuid, T>,
    /// Insertion order, used by `list`.
    order: Vec<Uuid>,
}

/// A keyed, insertion-ordered collection guarded by a `tokio::sync::RwLock`.
#[derive(Debug)]
pub struct MemoryTable<T> {
    name: &'static str,
    inner: RwLock<Inner<T>>,
}

impl<T: Record> MemoryTable<T> {
    /// Create an empty table; `name` only shows up in logs.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: RwLock::new(Inner {
                rows: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Insert a new record.
    ///
    /// Returns [`StoreError::Duplicate`] if the id is already present.
    pub async fn insert(&self, record: T) -> Result<Uuid, StoreError> {
        let id = record.id();
        let mut inner = self.inner.write().await;
        if inner.rows.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }
        inner.rows.insert(id, record);
        inner.order.push(id);
        debug!(table = self.name, %id, "inserted record");
        Ok(id)
    }

    /// Insert `record` unless `limit` rows already match `pred`.
    ///
    /// Counting and inserting happen under one write lock, so concurrent
    /// callers can never push the matching rows past `limit`.
    pub async fn insert_capped<P>(&self, record: T, pred: P, limit: usize) -> Result<Uuid, StoreError>
    where
        P: Fn(&T) -> bool,
    {
        let id = record.id();
        let mut inner = self.inner.write().await;
        if inner.rows.contains_key(&id) {
            return Err(StoreError::Duplicate(id));
        }
        if inner.rows.values().filter(|row| pred(*row)).count() >= limit {
            return Err(StoreError::LimitReached(limit));
        }
        inner.rows.insert(id, record);
        inner.order.push(id);
        debug!(table = self.name, %id, limit, "inserted capped record");
        Ok(id)
    }

    /// Fetch a clone of the record, or `None` if absent.
    pub async fn get(&self, id: Uuid) -> Option<T> {
        self.inner.read().await.rows.get(&id).cloned()
    }

    pub async fn contains(&self, id: Uuid) -> bool {
        self.inner.read().await.rows.contains_key(&id)
    }

    /// Mutate a record in place and return the updated copy.
    ///
    /// The closure runs under the write lock, so read-modify-write sequences
    /// on the same record never interleave.
    pub async fn update<F>(&self, id: Uuid, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut T),
    {
        let mut inner = self.inner.write().await;
        let row = inner.rows.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        f(row);
        Ok(row.clone())
    }

    /// Remove a record and return it.
    pub async fn remove(&self, id: Uuid) -> Result<T, StoreError> {
        let mut inner = self.inner.write().await;
        let row = inner.rows.remove(&id).ok_or(StoreError::NotFound(id))?;
        inner.order.retain(|other| *other != id);
        debug!(table = self.name, %id, "removed record");
        Ok(row)
    }

    /// All records in insertion order.
    pub async fn list(&self) -> Vec<T> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id).cloned())
            .collect()
    }

    /// Records matching `pred`, in insertion order.
    pub async fn filter<P>(&self, pred: P) -> Vec<T>
    where
        P: Fn(&T) -> bool,
    {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.rows.get(id))
            .filter(|row| pred(*row))
            .cloned()
            .collect()
    }

    /// Number of records matching `pred`.
    pub async fn count<P>(&self, pred: P) -> usize
    where
        P: Fn(&T) -> bool,
    {
        self.inner.read().await.rows.values().filter(|row| pred(*row)).count()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: Uuid,
        owner: &'static str,
        hits: u32,
    }

    impl Record for Row {
        fn id(&self) -> Uuid {
            self.id
        }
    }

    fn row(owner: &'static str) -> Row {
        Row { id: Uuid::new_v4(), owner, hits: 0 }
    }

    #[tokio::test]
    async fn insert_then_get_returns_clone() {
        let table = MemoryTable::new("rows");
        let r = row("a");
        let id = table.insert(r.clone()).await.unwrap();

        assert_eq!(table.get(id).await, Some(r));
        assert_eq!(table.get(Uuid::new_v4()).await, None);
    }

    #[tokio::test]
    async fn duplicate_insert_is_rejected() {
        let table = MemoryTable::new("rows");
        let r = row("a");
        table.insert(r.clone()).await.unwrap();
        assert_eq!(table.insert(r.clone()).await, Err(StoreError::Duplicate(r.id)));
    }

    #[tokio::test]
    async fn update_and_remove_unknown_ids_fail() {
        let table: MemoryTable<Row> = MemoryTable::new("rows");
        let ghost = Uuid::new_v4();
        assert_eq!(table.update(ghost, |_| {}).await.unwrap_err(), StoreError::NotFound(ghost));
        assert_eq!(table.remove(ghost).await.unwrap_err(), StoreError::NotFound(ghost));
    }

    #[tokio::test]
    async fn list_preserves_insertion_order_across_removals() {
        let table = MemoryTable::new("rows");
        let (a, b, c) = (row("a"), row("b"), row("c"));
        for r in [&a, &b, &c] {
            table.insert(r.clone()).await.unwrap();
        }
        table.remove(b.id).await.unwrap();

        let owners: Vec<_> = table.list().await.into_iter().map(|r| r.owner).collect();
        assert_eq!(owners, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn filter_and_count_apply_predicate() {
        let table = MemoryTable::new("rows");
        for owner in ["x", "y", "x"] {
            table.insert(row(owner)).await.unwrap();
        }
        assert_eq!(table.filter(|r| r.owner == "x").await.len(), 2);
        assert_eq!(table.count(|r| r.owner == "y").await, 1);
        assert_eq!(table.len().await, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn capped_inserts_never_exceed_the_limit() {
        let table = Arc::new(MemoryTable::new("rows"));
        table.insert(row("other")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                table.insert_capped(row("capped"), |r| r.owner == "capped", 3).await
            }));
        }
        let mut accepted = 0;
        for t in tasks {
            match t.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(e) => assert_eq!(e, StoreError::LimitReached(3)),
            }
        }

        assert_eq!(accepted, 3);
        assert_eq!(table.count(|r| r.owner == "capped").await, 3);
        assert_eq!(table.len().await, 4);
    }

    #[tokio::test]
    async fn concurrent_updates_do_not_lose_writes() {
        let table = Arc::new(MemoryTable::new("rows"));
        let id = table.insert(row("shared")).await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let table = Arc::clone(&table);
            tasks.push(tokio::spawn(async move {
                table.update(id, |r| r.hits += 1).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        assert_eq!(table.get(id).await.unwrap().hits, 50);
    }
}
