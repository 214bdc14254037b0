// FIXME: orderings are uniformly SeqCst; several could weaken to
// acquire/release once the protocol has soaked.

use core::fmt;

#[cfg(not(loom))]
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::*};

#[cfg(loom)]
use loom::sync::atomic::{AtomicU32, AtomicU64, Ordering::*};

use memaddr::{extract_bits_64, OwnerId, VirtAddr, PAGE_SIZE};

/// Packed identity of a cached translation: `owner:16 | page:48`.
/// All-ones is the invalid pair (no page, no owner); a machine-keyed
/// pair has `OwnerId::NONE` in the owner bits but a real page number.
pub(crate) const TAG_INVALID: u64 = u64::MAX;

const PAGE_BITS: u32 = 48;
const PAGE_NUM_MASK: u64 = (1 << PAGE_BITS) - 1;

#[inline]
pub(crate) fn pack_tag(owner: OwnerId, page: u64) -> u64 {
    debug_assert!(page <= PAGE_NUM_MASK);
    ((owner.0 as u64) << PAGE_BITS) | page
}

#[inline]
pub(crate) fn tag_page(tag: u64) -> u64 {
    extract_bits_64!(tag, 0, 48)
}

#[inline]
pub(crate) fn tag_owner(tag: u64) -> OwnerId {
    OwnerId(extract_bits_64!(tag, 48, 16) as u16)
}

/// One way of the cache: a permanently-assigned two-page kernel-virtual
/// window plus the mutable translation it currently holds.
///
/// Lookup never locks. The invariants that make the flush race safe:
///
/// a) a flusher stores `TAG_INVALID` *before* it reads `refs`;
///
/// b) a lookup increments `refs` *before* it re-reads the tag, and only
///    trusts the pair when the re-read still matches.
///
/// So a lookup that observes a match after its increment cannot have been
/// missed: the flusher's later `refs` read sees the count. Conversely, a
/// flusher that reads `refs == 0` already published the invalid tag, and
/// the lookup's re-read fails and restarts. Both accesses are SeqCst so
/// neither the compiler nor the CPU can reorder them.
pub(crate) struct Pair {
    tag: AtomicU64,
    /// First address past the mapped extent, in the tag's address space
    /// (machine for owner-less pairs, guest-physical otherwise).
    /// Decides whether one or both virtual pages are bound.
    max_addr: AtomicU64,
    refs: AtomicU32,
    /// First of the pair's two adjacent virtual pages. Fixed at attach.
    vaddr: VirtAddr,
}

impl fmt::Debug for Pair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = self.tag();
        let mut s = f.debug_struct("Pair");
        if tag == TAG_INVALID {
            s.field("tag", &"invalid");
        } else {
            s.field("owner", &tag_owner(tag)).field("page", &tag_page(tag));
        }
        s.field("max_addr", &self.max_addr())
            .field("refs", &self.refs())
            .field("vaddr", &self.vaddr)
            .finish()
    }
}

impl Pair {
    pub fn new(vaddr: VirtAddr) -> Pair {
        Pair {
            tag: AtomicU64::new(TAG_INVALID),
            max_addr: AtomicU64::new(0),
            refs: AtomicU32::new(0),
            vaddr,
        }
    }

    #[inline]
    pub fn vaddr(&self) -> VirtAddr {
        self.vaddr
    }

    #[inline]
    pub fn second_page(&self) -> VirtAddr {
        self.vaddr.add(PAGE_SIZE as usize)
    }

    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag.load(SeqCst)
    }

    #[inline]
    pub fn max_addr(&self) -> u64 {
        self.max_addr.load(SeqCst)
    }

    #[inline]
    pub fn refs(&self) -> u32 {
        self.refs.load(SeqCst)
    }

    /// Increment the reference count, then re-read the tag through the
    /// fence. True means the pair is pinned and still holds `tag`; false
    /// means a flush won the race and the count has been backed out.
    #[inline]
    pub fn acquire(&self, tag: u64) -> bool {
        self.refs.fetch_add(1, SeqCst);
        if self.tag.load(SeqCst) == tag {
            true
        } else {
            self.refs.fetch_sub(1, SeqCst);
            false
        }
    }

    #[inline]
    pub fn release(&self) {
        let prev = self.refs.fetch_sub(1, SeqCst);
        debug_assert!(prev > 0, "kseg pair over-released");
    }

    /// Publish a new translation. Local CPU only: the max-addr store must
    /// be visible no later than the tag that makes the pair matchable.
    pub fn install(&self, tag: u64, max_addr: u64) {
        debug_assert_ne!(tag, TAG_INVALID);
        self.max_addr.store(max_addr, SeqCst);
        self.tag.store(tag, SeqCst);
    }

    /// Grow the mapped extent (second-page install). Local CPU only.
    pub fn extend(&self, max_addr: u64) {
        self.max_addr.store(max_addr, SeqCst);
    }

    /// Tag-first teardown; see the struct docs for why the order matters.
    pub fn invalidate(&self) {
        self.tag.store(TAG_INVALID, SeqCst);
        self.max_addr.store(0, SeqCst);
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn tag_packing_round_trips() {
        let tag = pack_tag(OwnerId(7), 0x1234);
        assert_eq!(tag_owner(tag), OwnerId(7));
        assert_eq!(tag_page(tag), 0x1234);

        let machine = pack_tag(OwnerId::NONE, 0x1000);
        assert_ne!(machine, TAG_INVALID);
        assert_eq!(tag_owner(machine), OwnerId::NONE);
    }

    #[test]
    fn acquire_fails_after_invalidate() {
        let pair = Pair::new(VirtAddr(0x1000));
        let tag = pack_tag(OwnerId::NONE, 5);
        pair.install(tag, 0x6000);
        assert!(pair.acquire(tag));
        pair.release();

        pair.invalidate();
        assert!(!pair.acquire(tag));
        assert_eq!(pair.refs(), 0);
    }
}

#[cfg(all(loom, test))]
mod loom_tests {
    use super::*;
    use loom::sync::atomic::{AtomicU32, Ordering::*};
    use std::sync::Arc;

    /// The flush race: a holder that wins `acquire` must be observed by
    /// the flusher's quiescence wait; a holder that loses must leave no
    /// reference behind.
    #[test]
    fn flush_waits_for_winning_lookup() {
        loom::model(|| {
            let pair = Arc::new(Pair::new(VirtAddr(0x1000)));
            let tag = pack_tag(OwnerId(1), 5);
            pair.install(tag, 0x6000);

            let holding = Arc::new(AtomicU32::new(0));

            let lookup = loom::thread::spawn({
                let pair = pair.clone();
                let holding = holding.clone();
                move || {
                    if pair.acquire(tag) {
                        holding.store(1, SeqCst);
                        // critical section: the mapping must stay pinned
                        holding.store(0, SeqCst);
                        pair.release();
                    }
                }
            });

            // flusher: invalidate first, then wait out the references
            pair.invalidate();
            while pair.refs() != 0 {
                loom::thread::yield_now();
            }
            assert_eq!(
                holding.load(SeqCst),
                0,
                "flush returned while a lookup still held the pair"
            );
            assert_eq!(pair.tag(), TAG_INVALID);

            lookup.join().unwrap();
        });
    }

    /// A lookup racing a reinstall must never pin the pair under the old
    /// tag once the new tag is published.
    #[test]
    fn stale_tag_never_survives_acquire() {
        loom::model(|| {
            let pair = Arc::new(Pair::new(VirtAddr(0x1000)));
            let old_tag = pack_tag(OwnerId(1), 5);
            let new_tag = pack_tag(OwnerId(1), 9);
            pair.install(old_tag, 0x6000);

            let lookup = loom::thread::spawn({
                let pair = pair.clone();
                move || {
                    if pair.acquire(old_tag) {
                        let seen = pair.tag();
                        pair.release();
                        seen
                    } else {
                        TAG_INVALID
                    }
                }
            });

            pair.invalidate();
            while pair.refs() != 0 {
                loom::thread::yield_now();
            }
            pair.install(new_tag, 0xa000);

            let seen = lookup.join().unwrap();
            assert_ne!(seen, new_tag, "lookup pinned the pair across a reinstall");
        });
    }
}
