//! The two-tier account/storage cache.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, B256, U256};
use parking_lot::Mutex;

use crate::lru::{LruList, Ticket};

const SHARD_COUNT: usize = 64;

const ONE_SECOND_NANOS: i64 = 1_000_000_000;

/// Minimum interval between LRU promotions of the same entry.
const LRU_UPDATE_PERIOD: i64 = ONE_SECOND_NANOS;

/// A cached account body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    /// Transaction count.
    pub nonce: u64,
    /// Balance in wei.
    pub balance: U256,
    /// Root of the account's storage trie.
    pub storage_root: B256,
    /// Hash of the account's code.
    pub code_hash: B256,
}

/// Entry caps per tier.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum cached accounts.
    pub max_accounts: usize,
    /// Maximum cached storage slots, across all accounts.
    pub max_storage: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_accounts: 100_000,
            max_storage: 1_000_000,
        }
    }
}

struct StorageSlot {
    value: B256,
    ticket: Ticket,
    lru_time: AtomicI64,
}

struct AccountEntry {
    /// `None` caches a confirmed absence.
    account: Option<Account>,
    ticket: Ticket,
    lru_time: AtomicI64,
    storage: HashMap<B256, StorageSlot>,
}

type Shard = Mutex<HashMap<Address, AccountEntry>>;

/// Concurrent two-tier LRU keyed by address and by (address, slot).
///
/// Contents live in lock-striped shards; each tier's recency list sits
/// behind its own mutex. An entry re-promotes at most once per second, so
/// a hot key does not hammer the list lock, and an entry mid-eviction
/// observes its stale list ticket and declines promotion rather than race
/// the evictor.
pub struct AccountStorageCache {
    shards: Vec<Shard>,
    account_lru: Mutex<LruList<Address>>,
    storage_lru: Mutex<LruList<(Address, B256)>>,
    account_count: AtomicUsize,
    storage_count: AtomicUsize,
    config: CacheConfig,
}

impl AccountStorageCache {
    /// An empty cache with the given caps.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        assert!(config.max_accounts > 0 && config.max_storage > 0);
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            account_lru: Mutex::new(LruList::new()),
            storage_lru: Mutex::new(LruList::new()),
            account_count: AtomicUsize::new(0),
            storage_count: AtomicUsize::new(0),
            config,
        }
    }

    /// Cached account state for `address`. The outer `None` is a miss; an
    /// inner `None` is a cached confirmed absence.
    #[must_use]
    pub fn find_account(&self, address: &Address) -> Option<Option<Account>> {
        let shard = self.shard(address).lock();
        let entry = shard.get(address)?;
        let account = entry.account.clone();
        let (ticket, due) = (entry.ticket, lru_update_due(&entry.lru_time));
        drop(shard);
        if due {
            let mut lru = self.account_lru.lock();
            lru.promote(ticket);
        }
        Some(account)
    }

    /// Install (or overwrite) the cached state of `address`, evicting the
    /// least recently used account if the tier is full.
    pub fn insert_account(&self, address: Address, account: Option<Account>) {
        {
            let mut shard = self.shard(&address).lock();
            if let Some(entry) = shard.get_mut(&address) {
                entry.account = account;
                entry.lru_time.store(cur_time(), Ordering::Release);
                let ticket = entry.ticket;
                drop(shard);
                self.account_lru.lock().promote(ticket);
                return;
            }
        }
        self.reserve_account_slot();
        let ticket = self.account_lru.lock().push_front(address);
        let mut shard = self.shard(&address).lock();
        // A racing insert may have beaten us; keep the newer value either
        // way.
        match shard.entry(address) {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                occupied.get_mut().account = account;
                drop(shard);
                self.account_lru.lock().remove(ticket);
                self.account_count.fetch_sub(1, Ordering::AcqRel);
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(AccountEntry {
                    account,
                    ticket,
                    lru_time: AtomicI64::new(cur_time()),
                    storage: HashMap::new(),
                });
            }
        }
    }

    /// Cached value of `slot` under `address`.
    #[must_use]
    pub fn find_storage(&self, address: &Address, slot: &B256) -> Option<B256> {
        let shard = self.shard(address).lock();
        let entry = shard.get(address)?;
        let cached = entry.storage.get(slot)?;
        let value = cached.value;
        let (ticket, due) = (cached.ticket, lru_update_due(&cached.lru_time));
        drop(shard);
        if due {
            self.storage_lru.lock().promote(ticket);
        }
        Some(value)
    }

    /// Install (or overwrite) `slot` under `address`. A missing account
    /// entry is cached as a confirmed-absence placeholder first, through
    /// the counted insert path.
    pub fn insert_storage(&self, address: Address, slot: B256, value: B256) {
        {
            let mut shard = self.shard(&address).lock();
            if let Some(entry) = shard.get_mut(&address) {
                if let Some(cached) = entry.storage.get_mut(&slot) {
                    cached.value = value;
                    cached.lru_time.store(cur_time(), Ordering::Release);
                    let ticket = cached.ticket;
                    drop(shard);
                    self.storage_lru.lock().promote(ticket);
                    return;
                }
            }
        }
        self.reserve_storage_slot();
        let ticket = self.storage_lru.lock().push_front((address, slot));
        loop {
            {
                let mut shard = self.shard(&address).lock();
                if let Some(entry) = shard.get_mut(&address) {
                    match entry.storage.entry(slot) {
                        std::collections::hash_map::Entry::Occupied(mut occupied) => {
                            // A racing insert won; keep the newer value and
                            // give back our claim.
                            occupied.get_mut().value = value;
                            drop(shard);
                            self.storage_lru.lock().remove(ticket);
                            self.storage_count.fetch_sub(1, Ordering::AcqRel);
                        }
                        std::collections::hash_map::Entry::Vacant(vacant) => {
                            vacant.insert(StorageSlot {
                                value,
                                ticket,
                                lru_time: AtomicI64::new(cur_time()),
                            });
                        }
                    }
                    return;
                }
            }
            // No account entry to hang the slot off; cache a miss
            // placeholder and retry. The entry may be evicted again in
            // between, hence the loop.
            self.insert_account(address, None);
        }
    }

    /// Discard every cached storage slot of `address`; used when an
    /// account is re-created and its old storage must not be served.
    pub fn reset_account_storage(&self, address: &Address) {
        let mut shard = self.shard(address).lock();
        let Some(entry) = shard.get_mut(address) else {
            return;
        };
        let tickets: Vec<Ticket> = entry.storage.values().map(|slot| slot.ticket).collect();
        let dropped = entry.storage.len();
        entry.storage.clear();
        drop(shard);
        let mut lru = self.storage_lru.lock();
        for ticket in tickets {
            lru.remove(ticket);
        }
        drop(lru);
        self.storage_count.fetch_sub(dropped, Ordering::AcqRel);
        tracing::debug!(%address, dropped, "account storage reset");
    }

    /// Drop everything.
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.lock().clear();
        }
        let mut account_lru = self.account_lru.lock();
        while account_lru.evict_lru().is_some() {}
        drop(account_lru);
        let mut storage_lru = self.storage_lru.lock();
        while storage_lru.evict_lru().is_some() {}
        drop(storage_lru);
        self.account_count.store(0, Ordering::Release);
        self.storage_count.store(0, Ordering::Release);
    }

    /// Cached account entries.
    #[must_use]
    pub fn account_len(&self) -> usize {
        self.account_count.load(Ordering::Acquire)
    }

    /// Cached storage slots across all accounts.
    #[must_use]
    pub fn storage_len(&self) -> usize {
        self.storage_count.load(Ordering::Acquire)
    }

    fn shard(&self, address: &Address) -> &Shard {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        address.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARD_COUNT]
    }

    /// First phase of an insert: claim a size slot, evicting until one
    /// frees up.
    fn reserve_account_slot(&self) {
        loop {
            let size = self.account_count.load(Ordering::Acquire);
            if size < self.config.max_accounts {
                if self
                    .account_count
                    .compare_exchange(size, size + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.evict_account();
        }
    }

    fn reserve_storage_slot(&self) {
        loop {
            let size = self.storage_count.load(Ordering::Acquire);
            if size < self.config.max_storage {
                if self
                    .storage_count
                    .compare_exchange(size, size + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.evict_storage();
        }
    }

    fn evict_account(&self) {
        let victim = self.account_lru.lock().evict_lru();
        let Some(address) = victim else {
            return;
        };
        let mut shard = self.shard(&address).lock();
        let Some(entry) = shard.remove(&address) else {
            return;
        };
        let storage_tickets: Vec<Ticket> =
            entry.storage.values().map(|slot| slot.ticket).collect();
        let dropped = entry.storage.len();
        drop(shard);
        if dropped > 0 {
            let mut lru = self.storage_lru.lock();
            for ticket in storage_tickets {
                lru.remove(ticket);
            }
            self.storage_count.fetch_sub(dropped, Ordering::AcqRel);
        }
        self.account_count.fetch_sub(1, Ordering::AcqRel);
    }

    fn evict_storage(&self) {
        let victim = self.storage_lru.lock().evict_lru();
        let Some((address, slot)) = victim else {
            return;
        };
        let mut shard = self.shard(&address).lock();
        if let Some(entry) = shard.get_mut(&address) {
            if entry.storage.remove(&slot).is_some() {
                drop(shard);
                self.storage_count.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

fn cur_time() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as i64)
}

fn lru_update_due(lru_time: &AtomicI64) -> bool {
    let last = lru_time.load(Ordering::Acquire);
    let now = cur_time();
    if now - last >= LRU_UPDATE_PERIOD {
        lru_time.store(now, Ordering::Release);
        return true;
    }
    false
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    fn address(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn account(nonce: u64) -> Account {
        Account {
            nonce,
            balance: U256::from(nonce) * U256::from(1_000u64),
            storage_root: B256::ZERO,
            code_hash: B256::repeat_byte(0xcc),
        }
    }

    #[test]
    fn account_hit_and_confirmed_absence() {
        let cache = AccountStorageCache::new(CacheConfig::default());
        assert_eq!(cache.find_account(&address(1)), None);

        cache.insert_account(address(1), Some(account(7)));
        assert_eq!(cache.find_account(&address(1)), Some(Some(account(7))));

        cache.insert_account(address(2), None);
        assert_eq!(cache.find_account(&address(2)), Some(None));
        assert_eq!(cache.account_len(), 2);
    }

    #[test]
    fn account_tier_evicts_least_recently_used() {
        let cache = AccountStorageCache::new(CacheConfig {
            max_accounts: 2,
            max_storage: 16,
        });
        cache.insert_account(address(1), Some(account(1)));
        cache.insert_account(address(2), Some(account(2)));
        cache.insert_account(address(3), Some(account(3)));

        assert_eq!(cache.account_len(), 2);
        assert_eq!(cache.find_account(&address(1)), None, "oldest evicted");
        assert!(cache.find_account(&address(2)).is_some());
        assert!(cache.find_account(&address(3)).is_some());
    }

    #[test]
    fn storage_tier_evicts_independently() {
        let cache = AccountStorageCache::new(CacheConfig {
            max_accounts: 8,
            max_storage: 2,
        });
        let a = address(1);
        cache.insert_storage(a, B256::repeat_byte(1), B256::repeat_byte(0x11));
        cache.insert_storage(a, B256::repeat_byte(2), B256::repeat_byte(0x22));
        cache.insert_storage(a, B256::repeat_byte(3), B256::repeat_byte(0x33));

        assert_eq!(cache.storage_len(), 2);
        assert_eq!(cache.find_storage(&a, &B256::repeat_byte(1)), None);
        assert_eq!(
            cache.find_storage(&a, &B256::repeat_byte(3)),
            Some(B256::repeat_byte(0x33))
        );
        // The account entry itself survives storage evictions.
        assert_eq!(cache.find_account(&a), Some(None));
    }

    #[test]
    fn reset_account_storage_drops_only_that_account() {
        let cache = AccountStorageCache::new(CacheConfig::default());
        let a = address(1);
        let b = address(2);
        cache.insert_storage(a, B256::repeat_byte(1), B256::repeat_byte(0xaa));
        cache.insert_storage(b, B256::repeat_byte(1), B256::repeat_byte(0xbb));

        cache.reset_account_storage(&a);
        assert_eq!(cache.find_storage(&a, &B256::repeat_byte(1)), None);
        assert_eq!(
            cache.find_storage(&b, &B256::repeat_byte(1)),
            Some(B256::repeat_byte(0xbb))
        );
        assert_eq!(cache.storage_len(), 1);
    }

    #[test]
    fn overwrite_does_not_grow_the_tier() {
        let cache = AccountStorageCache::new(CacheConfig::default());
        let a = address(1);
        for nonce in 0..10 {
            cache.insert_account(a, Some(account(nonce)));
        }
        assert_eq!(cache.account_len(), 1);
        assert_eq!(cache.find_account(&a), Some(Some(account(9))));

        for i in 0..10u8 {
            cache.insert_storage(a, B256::repeat_byte(7), B256::repeat_byte(i));
        }
        assert_eq!(cache.storage_len(), 1);
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cache = Arc::new(AccountStorageCache::new(CacheConfig {
            max_accounts: 64,
            max_storage: 256,
        }));
        let mut handles = Vec::new();
        for t in 0..4u8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..500u64 {
                    let a = address((i % 32) as u8);
                    cache.insert_account(a, Some(account(i)));
                    cache.insert_storage(
                        a,
                        B256::repeat_byte((i % 8) as u8),
                        B256::repeat_byte(t),
                    );
                    let _ = cache.find_account(&a);
                    let _ = cache.find_storage(&a, &B256::repeat_byte((i % 8) as u8));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(cache.account_len() <= 64);
        assert!(cache.storage_len() <= 256);
    }

    #[test]
    fn clear_empties_both_tiers() {
        let cache = AccountStorageCache::new(CacheConfig::default());
        cache.insert_account(address(1), Some(account(1)));
        cache.insert_storage(address(1), B256::repeat_byte(1), B256::repeat_byte(1));
        cache.clear();
        assert_eq!(cache.account_len(), 0);
        assert_eq!(cache.storage_len(), 0);
        assert_eq!(cache.find_account(&address(1)), None);
    }
}
