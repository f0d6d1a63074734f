//! Block based id allocation.
//!
//! Every collection owns a counter document in `hilo_keys` holding the next block
//! number (`serverHi`). An allocator reserves a whole block with one atomic increment
//! and then hands out `capacity` ids from it without talking to the server:
//!
//! ```text
//! id = (hi - 1) * capacity + lo      lo in 1..=capacity
//! ```
//!
//! Blocks never overlap because the server increment is atomic, so any number of
//! allocators in any number of processes can share one counter.
//!
//! Locally the current block is a single 128 bit word, `hi` in the upper half and
//! `lo` in the lower. Taking an id is one `fetch_add` on that word. Only the thread
//! that finds the block used up takes the refill lock and goes to the server.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError, RwLock},
};

use bson::{Bson, Document, doc};
use log::{debug, info};
use portable_atomic::{AtomicU128, Ordering};

use crate::{
    ClientConfig, Database, Error,
    mapping::{MetadataProvider, TypeKey},
};

/// Collection holding one `{_id: <collection>, serverHi: <next block>}` document
/// per allocating collection.
pub const COUNTER_COLLECTION: &str = "hilo_keys";

/// Value a freshly created counter holds: block 1 belongs to its creator.
const FIRST_SERVER_HI: i64 = 2;

/// Shared block counters. `next_hi` must increment atomically and hand back the
/// value from before the increment.
pub trait CounterStore {
    /// Increments the counter for `key`, returning its previous value, or `None`
    /// when no counter exists yet.
    fn next_hi(&self, key: &str) -> Result<Option<i64>, Error>;

    /// Creates the counter for `key` holding `value`. Fails with
    /// [`Error::DuplicateKey`] when someone else created it first.
    fn create_counter(&self, key: &str, value: i64) -> Result<(), Error>;
}

impl<T: CounterStore + ?Sized> CounterStore for &T {
    fn next_hi(&self, key: &str) -> Result<Option<i64>, Error> {
        (**self).next_hi(key)
    }

    fn create_counter(&self, key: &str, value: i64) -> Result<(), Error> {
        (**self).create_counter(key, value)
    }
}

impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    fn next_hi(&self, key: &str) -> Result<Option<i64>, Error> {
        (**self).next_hi(key)
    }

    fn create_counter(&self, key: &str, value: i64) -> Result<(), Error> {
        (**self).create_counter(key, value)
    }
}

impl CounterStore for Database {
    fn next_hi(&self, key: &str) -> Result<Option<i64>, Error> {
        let previous = self.collection(COUNTER_COLLECTION).find_and_modify(
            doc! { "_id": key },
            doc! { "$inc": { "serverHi": 1_i64 } },
            false,
            false,
        )?;
        previous.map(|doc| server_hi(key, &doc)).transpose()
    }

    fn create_counter(&self, key: &str, value: i64) -> Result<(), Error> {
        self.collection(COUNTER_COLLECTION)
            .insert_safe(vec![doc! { "_id": key, "serverHi": value }])
    }
}

fn server_hi(key: &str, counter: &Document) -> Result<i64, Error> {
    match counter.get("serverHi") {
        Some(Bson::Int64(hi)) => Ok(*hi),
        Some(Bson::Int32(hi)) => Ok(i64::from(*hi)),
        // Integral and inside [-2^63, 2^63), so the cast below is exact.
        Some(Bson::Double(hi))
            if hi.fract() == 0.0 && *hi >= i64::MIN as f64 && *hi < i64::MAX as f64 =>
        {
            Ok(*hi as i64)
        }
        other => Err(Error::Counter {
            key: key.to_string(),
            reason: format!("serverHi is {other:?}"),
        }),
    }
}

fn pack(hi: u64, lo: u64) -> u128 {
    (u128::from(hi) << 64) | u128::from(lo)
}

fn unpack(state: u128) -> (u64, u64) {
    ((state >> 64) as u64, state as u64)
}

/// The current block of one collection.
pub struct IdBlock {
    collection: String,
    capacity: u64,
    state: AtomicU128,
    refill: Mutex<()>,
}

impl IdBlock {
    pub fn new(collection: impl Into<String>, capacity: u64) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::Config("id block capacity must be at least 1".into()));
        }

        // starts used up so the first call reserves a block
        Ok(Self {
            collection: collection.into(),
            capacity,
            state: AtomicU128::new(pack(0, capacity)),
            refill: Mutex::new(()),
        })
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Block number currently handed out from, 0 before the first reservation.
    pub fn hi(&self) -> u64 {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    pub fn next_id<S>(&self, store: &S, max_races: usize) -> Result<i64, Error>
    where
        S: CounterStore + ?Sized,
    {
        loop {
            if let Some(id) = self.take() {
                return Ok(id);
            }

            let _refill = self.refill.lock().unwrap_or_else(PoisonError::into_inner);
            let (hi, lo) = unpack(self.state.load(Ordering::Acquire));
            if lo < self.capacity {
                // another thread refilled while we waited
                continue;
            }

            return match self.reserve(store, max_races) {
                Ok(next) => {
                    self.state.store(pack(next, 1), Ordering::Release);
                    debug!(
                        "reserved block {next} of {} ids for '{}'",
                        self.capacity, self.collection
                    );
                    Ok(self.id(next, 1))
                }
                Err(e) => {
                    self.state.store(pack(hi, self.capacity), Ordering::Release);
                    Err(Error::Allocation {
                        collection: self.collection.clone(),
                        source: Box::new(e),
                    })
                }
            };
        }
    }

    fn take(&self) -> Option<i64> {
        let (hi, lo) = unpack(self.state.fetch_add(1, Ordering::AcqRel));
        let lo = lo + 1;
        (hi > 0 && lo <= self.capacity).then(|| self.id(hi, lo))
    }

    // hi was range checked when the block was reserved
    fn id(&self, hi: u64, lo: u64) -> i64 {
        ((hi - 1) * self.capacity + lo) as i64
    }

    fn reserve<S>(&self, store: &S, max_races: usize) -> Result<u64, Error>
    where
        S: CounterStore + ?Sized,
    {
        let mut races = 0;
        loop {
            if let Some(hi) = store.next_hi(&self.collection)? {
                return self.checked(hi);
            }

            match store.create_counter(&self.collection, FIRST_SERVER_HI) {
                Ok(()) => {
                    info!("created id counter for '{}'", self.collection);
                    return Ok(1);
                }
                Err(e) if e.is_duplicate_key() && races < max_races => {
                    races += 1;
                    debug!(
                        "lost counter creation race for '{}', retrying ({races}/{max_races})",
                        self.collection
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn checked(&self, hi: i64) -> Result<u64, Error> {
        let invalid = |reason: String| Error::Counter {
            key: self.collection.clone(),
            reason,
        };

        let hi = u64::try_from(hi)
            .ok()
            .filter(|hi| *hi > 0)
            .ok_or_else(|| invalid(format!("serverHi {hi} is not positive")))?;
        let last = hi.checked_mul(self.capacity).filter(|last| *last <= i64::MAX as u64);
        match last {
            Some(_) => Ok(hi),
            None => Err(invalid(format!(
                "block {hi} of {} ids overflows the id range",
                self.capacity
            ))),
        }
    }
}

/// Hands out ids per collection, reserving blocks through `S`.
pub struct HiLoIdGenerator<S> {
    store: S,
    capacity: u64,
    max_races: usize,
    mapping: Option<Arc<dyn MetadataProvider>>,
    blocks: RwLock<HashMap<String, Arc<IdBlock>>>,
}

impl<S: CounterStore> HiLoIdGenerator<S> {
    pub fn new(store: S, capacity: u64) -> Result<Self, Error> {
        if capacity == 0 {
            return Err(Error::Config("id block capacity must be at least 1".into()));
        }

        Ok(Self {
            store,
            capacity,
            max_races: ClientConfig::default().max_counter_races,
            mapping: None,
            blocks: RwLock::new(HashMap::new()),
        })
    }

    pub fn from_config(store: S, config: &ClientConfig) -> Result<Self, Error> {
        Ok(Self::new(store, config.hilo_capacity)?.with_max_races(config.max_counter_races))
    }

    /// How many lost counter creation races are retried before giving up.
    pub fn with_max_races(mut self, max_races: usize) -> Self {
        self.max_races = max_races;
        self
    }

    /// Installs the provider used by [`Self::generate_id_for`].
    pub fn with_mapping(mut self, mapping: Arc<dyn MetadataProvider>) -> Self {
        self.mapping = Some(mapping);
        self
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn generate_id(&self, collection: &str) -> Result<i64, Error> {
        self.block(collection)?.next_id(&self.store, self.max_races)
    }

    /// Next id for the collection storing `T`.
    pub fn generate_id_for<T: 'static>(&self) -> Result<i64, Error> {
        let key = TypeKey::of::<T>();
        let collection = match &self.mapping {
            Some(mapping) => mapping.collection_name(key),
            None => key.scrubbed_name(),
        };
        self.generate_id(&collection)
    }

    /// The block for `collection`, created on first use.
    pub fn block(&self, collection: &str) -> Result<Arc<IdBlock>, Error> {
        let blocks = self.blocks.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(block) = blocks.get(collection) {
            return Ok(Arc::clone(block));
        }
        drop(blocks);

        let mut blocks = self.blocks.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(block) = blocks.get(collection) {
            return Ok(Arc::clone(block));
        }
        let block = Arc::new(IdBlock::new(collection, self.capacity)?);
        blocks.insert(collection.to_string(), Arc::clone(&block));
        Ok(block)
    }
}
