//! CPU capability detection and instruction-set tier selection.
//!
//! Detection runs once per process and is cached. The selected tier is the
//! highest tier the hardware supports, capped by the `TESSERA_MAX_CPU_TIER`
//! environment variable when set. A per-computation cap
//! ([`ComputeConfig::max_tier`](crate::ComputeConfig)) can lower it further
//! but nothing raises it above what the hardware supports.

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Environment variable capping the selected tier.
pub const MAX_TIER_ENV: &str = "TESSERA_MAX_CPU_TIER";

/// Instruction-set tier a kernel is built for. Ordered from narrowest.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CpuTier {
    /// Portable scalar code.
    #[default]
    Baseline,
    /// SSE4.2.
    Sse42,
    /// AVX2.
    Avx2,
    /// AVX-512 foundation.
    Avx512,
}

impl CpuTier {
    /// All tiers, narrowest first.
    pub const ALL: [CpuTier; 4] = [
        CpuTier::Baseline,
        CpuTier::Sse42,
        CpuTier::Avx2,
        CpuTier::Avx512,
    ];

    /// Lower-case name, as accepted by [`FromStr`].
    pub fn name(self) -> &'static str {
        match self {
            CpuTier::Baseline => "baseline",
            CpuTier::Sse42 => "sse42",
            CpuTier::Avx2 => "avx2",
            CpuTier::Avx512 => "avx512",
        }
    }

    /// The next narrower tier, or `None` at baseline.
    pub fn lower(self) -> Option<CpuTier> {
        match self {
            CpuTier::Baseline => None,
            CpuTier::Sse42 => Some(CpuTier::Baseline),
            CpuTier::Avx2 => Some(CpuTier::Sse42),
            CpuTier::Avx512 => Some(CpuTier::Avx2),
        }
    }
}

impl fmt::Display for CpuTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unrecognized tier name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown CPU tier `{0}` (expected baseline, sse42, avx2 or avx512)")]
pub struct ParseTierError(String);

impl FromStr for CpuTier {
    type Err = ParseTierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        CpuTier::ALL
            .into_iter()
            .find(|t| t.name() == normalized)
            .ok_or_else(|| ParseTierError(s.to_owned()))
    }
}

// =============================================================================
// Detection
// =============================================================================

/// Detected instruction-set extensions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuCaps {
    pub sse42: bool,
    pub avx2: bool,
    pub avx512f: bool,
}

impl CpuCaps {
    /// Highest tier these capabilities support.
    pub fn max_tier(&self) -> CpuTier {
        if self.avx512f && self.avx2 {
            CpuTier::Avx512
        } else if self.avx2 {
            CpuTier::Avx2
        } else if self.sse42 {
            CpuTier::Sse42
        } else {
            CpuTier::Baseline
        }
    }

    /// Whether a kernel of `tier` may run on this hardware.
    pub fn supports(&self, tier: CpuTier) -> bool {
        tier <= self.max_tier()
    }
}

static CAPS: OnceLock<CpuCaps> = OnceLock::new();
static SELECTED: OnceLock<CpuTier> = OnceLock::new();

/// Detect hardware capabilities (cached after first call).
///
/// Targets without runtime detection report no extensions.
pub fn caps() -> &'static CpuCaps {
    CAPS.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            CpuCaps {
                sse42: is_x86_feature_detected!("sse4.2"),
                avx2: is_x86_feature_detected!("avx2"),
                avx512f: is_x86_feature_detected!("avx512f"),
            }
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            CpuCaps::default()
        }
    })
}

/// Parse an environment cap. Unknown values are ignored with a warning.
fn parse_env_cap(value: Option<&str>) -> Option<CpuTier> {
    let value = value?;
    match value.parse::<CpuTier>() {
        Ok(tier) => Some(tier),
        Err(e) => {
            log::warn!("ignoring {MAX_TIER_ENV}: {e}");
            None
        }
    }
}

fn cap_tier(hardware: CpuTier, cap: Option<CpuTier>) -> CpuTier {
    cap.map_or(hardware, |c| c.min(hardware))
}

/// Process-wide tier: hardware maximum capped by `TESSERA_MAX_CPU_TIER`.
///
/// Computed on first use and cached for the lifetime of the process.
pub fn selected_tier() -> CpuTier {
    *SELECTED.get_or_init(|| {
        let hardware = caps().max_tier();
        let env = std::env::var(MAX_TIER_ENV).ok();
        let tier = cap_tier(hardware, parse_env_cap(env.as_deref()));
        log::debug!("cpu tier: hardware {hardware}, selected {tier}");
        tier
    })
}

/// Tier for one computation: [`selected_tier`] lowered by `cap`.
pub fn effective_tier(cap: Option<CpuTier>) -> CpuTier {
    cap_tier(selected_tier(), cap)
}
