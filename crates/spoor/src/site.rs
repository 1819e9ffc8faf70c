//! Per-call-site state.
//!
//! Every trace macro expansion creates one `static CallSite`. The site
//! carries the static descriptor (kind, verbosity, file, line, key) and
//! a one-word decision cache. The cache packs the configuration
//! generation it was resolved against together with the resolved flags,
//! so the disabled fast path is a single acquire load plus a compare.
//! Racing writers are harmless: for a given generation every writer
//! computes the same word.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use spoor_types::TracePointKind;

const GENERATION_BITS: u32 = 61;
const GENERATION_MASK: u64 = (1 << GENERATION_BITS) - 1;
const ACTIVE_BIT: u64 = 1 << 61;
const BACKTRACES_BIT: u64 = 1 << 62;
const VARIABLES_BIT: u64 = 1 << 63;

/// Resolved action flags for one site under one configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct SiteDecision {
    pub active: bool,
    pub backtraces: bool,
    pub variables: bool,
}

#[derive(Debug)]
pub(crate) struct SiteCache {
    word: AtomicU64,
}

impl SiteCache {
    pub(crate) const fn new() -> Self {
        // Generation 0 never matches an installed configuration, so a
        // fresh site always resolves on first hit.
        Self {
            word: AtomicU64::new(0),
        }
    }

    pub(crate) fn load(&self) -> (u64, SiteDecision) {
        let word = self.word.load(Ordering::Acquire);
        (
            word & GENERATION_MASK,
            SiteDecision {
                active: word & ACTIVE_BIT != 0,
                backtraces: word & BACKTRACES_BIT != 0,
                variables: word & VARIABLES_BIT != 0,
            },
        )
    }

    pub(crate) fn store(&self, generation: u64, decision: SiteDecision) {
        let mut word = generation & GENERATION_MASK;
        if decision.active {
            word |= ACTIVE_BIT;
        }
        if decision.backtraces {
            word |= BACKTRACES_BIT;
        }
        if decision.variables {
            word |= VARIABLES_BIT;
        }
        self.word.store(word, Ordering::Release);
    }
}

/// One instrumentation site. Constructed in `static` position by the
/// trace macros; lives until process exit.
#[derive(Debug)]
pub struct CallSite {
    kind: TracePointKind,
    verbosity: u32,
    file: &'static str,
    line: u32,
    key: Option<&'static str>,
    // The enclosing function path is not nameable in const position; the
    // macro passes it on every visit and the first one wins.
    function: OnceLock<&'static str>,
    pub(crate) cache: SiteCache,
}

impl CallSite {
    pub const fn new(
        kind: TracePointKind,
        verbosity: u32,
        file: &'static str,
        line: u32,
        key: Option<&'static str>,
    ) -> Self {
        Self {
            kind,
            verbosity,
            file,
            line,
            key,
            function: OnceLock::new(),
            cache: SiteCache::new(),
        }
    }

    pub fn kind(&self) -> TracePointKind {
        self.kind
    }

    pub fn verbosity(&self) -> u32 {
        self.verbosity
    }

    pub fn file(&self) -> &'static str {
        self.file
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn key(&self) -> Option<&'static str> {
        self.key
    }

    pub fn function(&self) -> &'static str {
        self.function.get().copied().unwrap_or("?")
    }

    pub(crate) fn record_function(&self, function: &'static str) {
        let _ = self.function.set(function);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_site_reports_generation_zero() {
        let cache = SiteCache::new();
        let (generation, decision) = cache.load();
        assert_eq!(generation, 0);
        assert_eq!(decision, SiteDecision::default());
    }

    #[test]
    fn store_round_trips_generation_and_flags() {
        let cache = SiteCache::new();
        cache.store(
            42,
            SiteDecision {
                active: true,
                backtraces: false,
                variables: true,
            },
        );
        let (generation, decision) = cache.load();
        assert_eq!(generation, 42);
        assert!(decision.active);
        assert!(!decision.backtraces);
        assert!(decision.variables);
    }

    #[test]
    fn flags_never_bleed_into_the_generation() {
        let cache = SiteCache::new();
        cache.store(
            u64::MAX,
            SiteDecision {
                active: true,
                backtraces: true,
                variables: true,
            },
        );
        let (generation, _) = cache.load();
        assert_eq!(generation, GENERATION_MASK);
    }
}
