//! Process-wide streaming diagnostics.
//!
//! Mixers register a statistics handle at construction; the registry is
//! explicitly initialized and shut down by the embedding application.
//! Everything here is observational; the data path never depends on it.

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};
use std::sync::{
    Arc, OnceLock,
    atomic::{AtomicU64, Ordering},
};

new_key_type! {
    /// Registry key of one mixer's statistics entry.
    pub struct MixerStatsKey;
}

/// Runtime counters of one stream mixer.
#[derive(Default)]
pub struct MixerStats {
    pub frames_mixed: AtomicU64,
    pub starvations: AtomicU64,
    pub packets_bounced: AtomicU64,
}

/// Snapshot of one mixer's counters.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MixerStatsSnapshot {
    pub frames_mixed: u64,
    pub starvations: u64,
    pub packets_bounced: u64,
}

struct Registry {
    mixers: Mutex<SlotMap<MixerStatsKey, (String, Arc<MixerStats>)>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static ENABLED: AtomicU64 = AtomicU64::new(0);

/// Enable the diagnostics registry. Safe to call more than once.
pub fn init() {
    REGISTRY.get_or_init(|| Registry {
        mixers: Mutex::new(SlotMap::with_key()),
    });
    ENABLED.store(1, Ordering::SeqCst);
}

/// Disable the registry and drop all entries. Handles held by running
/// mixers stay valid; they just stop being listed.
pub fn shutdown() {
    ENABLED.store(0, Ordering::SeqCst);
    if let Some(registry) = REGISTRY.get() {
        registry.mixers.lock().clear();
    }
}

/// Register a mixer; called at mixer construction. Returns a live handle
/// even when the registry is disabled.
pub fn register_mixer(name: &str) -> Arc<MixerStats> {
    let stats = Arc::new(MixerStats::default());
    if ENABLED.load(Ordering::SeqCst) != 0 {
        if let Some(registry) = REGISTRY.get() {
            registry
                .mixers
                .lock()
                .insert((name.to_owned(), stats.clone()));
        }
    }
    stats
}

/// Snapshot every registered mixer.
pub fn snapshot() -> Vec<(String, MixerStatsSnapshot)> {
    let Some(registry) = REGISTRY.get() else {
        return Vec::new();
    };
    registry
        .mixers
        .lock()
        .values()
        .map(|(name, stats)| {
            (
                name.clone(),
                MixerStatsSnapshot {
                    frames_mixed: stats.frames_mixed.load(Ordering::Relaxed),
                    starvations: stats.starvations.load(Ordering::Relaxed),
                    packets_bounced: stats.packets_bounced.load(Ordering::Relaxed),
                },
            )
        })
        .collect()
}
