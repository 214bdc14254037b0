//! Process-wide registry of live memspaces, for the diagnostic listing.
//! Registration happens at create/destroy only; no hot path touches it.

use core::fmt;
use std::sync::{Arc, Weak};

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::handle::Space;

static REGISTRY: Lazy<Mutex<Vec<Weak<Space>>>> = Lazy::new(|| Mutex::new(Vec::new()));

pub(crate) fn register(space: &Arc<Space>) {
    let mut reg = REGISTRY.lock();
    reg.retain(|w| w.strong_count() > 0);
    reg.push(Arc::downgrade(space));
}

pub(crate) fn unregister(space: &Arc<Space>) {
    let mut reg = REGISTRY.lock();
    reg.retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, &Arc::downgrade(space)));
}

/// Write every live memspace's statistics dump to `out`.
pub fn dump_registry(out: &mut dyn fmt::Write) -> fmt::Result {
    let spaces: Vec<Arc<Space>> = {
        let reg = REGISTRY.lock();
        reg.iter().filter_map(Weak::upgrade).collect()
    };
    for space in spaces {
        let stats = space.state.lock().stats();
        write!(out, "{stats}")?;
    }
    Ok(())
}
