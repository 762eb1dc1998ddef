//! Locale/core routing arithmetic for the multi-core aggregator.
//!
//! Cores are numbered globally: locale `l` owns cores
//! `l * locale_cores .. (l + 1) * locale_cores`. Each local core is
//! responsible for a contiguous slice of destination locales, so every
//! locale pair has exactly one sending core and one receiving core.

use crate::{Core, Locale};

/// Locale of a global core id.
#[inline]
pub fn locale_of(core: Core, locale_cores: usize) -> Locale {
    core / locale_cores
}

/// Index of a global core within its locale.
#[inline]
pub fn core_index(core: Core, locale_cores: usize) -> usize {
    core % locale_cores
}

/// Per-locale routing tables computed once at startup.
#[derive(Debug, Clone)]
pub struct RouteMap {
    /// Locales each local core is responsible for sending to.
    locales_per_core: usize,
    /// Global core on this locale that sends to locale `l`.
    source_core_for_locale: Vec<Core>,
    /// Global core on locale `l` that receives traffic from this locale.
    dest_core_for_locale: Vec<Core>,
}

impl RouteMap {
    pub fn new(my_locale: Locale, locales: usize, locale_cores: usize) -> Self {
        assert!(locales > 0 && locale_cores > 0, "degenerate topology");
        let locales_per_core = locales.div_ceil(locale_cores);
        let source_core_for_locale = (0..locales)
            .map(|l| my_locale * locale_cores + l / locales_per_core)
            .collect();
        let dest_core_for_locale = (0..locales)
            .map(|l| l * locale_cores + my_locale / locales_per_core)
            .collect();
        Self { locales_per_core, source_core_for_locale, dest_core_for_locale }
    }

    /// Number of destination locales each local core covers.
    #[inline]
    pub fn locales_per_core(&self) -> usize {
        self.locales_per_core
    }

    /// Global core on this locale that sends to `dest_locale`.
    #[inline]
    pub fn source_core_for_locale(&self, dest_locale: Locale) -> Core {
        self.source_core_for_locale[dest_locale]
    }

    /// Global core on `dest_locale` that receives this locale's traffic.
    #[inline]
    pub fn dest_core_for_locale(&self, dest_locale: Locale) -> Core {
        self.dest_core_for_locale[dest_locale]
    }

    /// Destination locales the local core at `index` is responsible for.
    pub fn partner_locales(&self, index: usize) -> std::ops::Range<Locale> {
        let locales = self.source_core_for_locale.len();
        let start = (index * self.locales_per_core).min(locales);
        let end = ((index + 1) * self.locales_per_core).min(locales);
        start..end
    }
}
