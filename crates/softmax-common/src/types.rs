//! Selector enums shared by configuration, the device runtime and kernels.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Device class a context should bind to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceTarget {
    /// Host CPU device.
    Cpu,
    /// Best available device: a GPU-class device if one is registered,
    /// otherwise the host CPU.
    Default,
    /// GPU-class device only.
    Gpu,
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Default => write!(f, "default"),
            Self::Gpu => write!(f, "gpu"),
        }
    }
}

impl FromStr for DeviceTarget {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "default" | "auto" => Ok(Self::Default),
            "gpu" => Ok(Self::Gpu),
            other => Err(format!("unknown device target: {other}")),
        }
    }
}

/// Ordering between successive submissions on one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueOrdering {
    /// Each submission starts after the previous one completed.
    InOrder,
    /// Submissions may overlap unless an explicit dependency is declared.
    Unordered,
}

impl fmt::Display for QueueOrdering {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InOrder => write!(f, "in-order"),
            Self::Unordered => write!(f, "unordered"),
        }
    }
}

impl FromStr for QueueOrdering {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in-order" | "in_order" | "inorder" => Ok(Self::InOrder),
            "unordered" | "out-of-order" => Ok(Self::Unordered),
            other => Err(format!("unknown queue ordering: {other}")),
        }
    }
}

/// How input/output data reaches the device and comes back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResidencyKind {
    /// Host-mirrored buffers; the runtime copies at access boundaries.
    StagedCopy,
    /// One allocation valid on both sides, pages migrated on first touch.
    UnifiedImplicit,
    /// Host allocation plus device-only allocation with manual copies.
    UnifiedExplicit,
    /// Explicitly allocated shared memory, no copy calls, explicit release.
    SharedManaged,
}

impl ResidencyKind {
    /// All residency kinds, in declaration order.
    pub const ALL: [ResidencyKind; 4] =
        [Self::StagedCopy, Self::UnifiedImplicit, Self::UnifiedExplicit, Self::SharedManaged];
}

impl fmt::Display for ResidencyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StagedCopy => write!(f, "staged-copy"),
            Self::UnifiedImplicit => write!(f, "unified-implicit"),
            Self::UnifiedExplicit => write!(f, "unified-explicit"),
            Self::SharedManaged => write!(f, "shared-managed"),
        }
    }
}

impl FromStr for ResidencyKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "staged-copy" | "buffer" => Ok(Self::StagedCopy),
            "unified-implicit" | "usm" => Ok(Self::UnifiedImplicit),
            "unified-explicit" => Ok(Self::UnifiedExplicit),
            "shared-managed" | "shared" => Ok(Self::SharedManaged),
            other => Err(format!("unknown residency kind: {other}")),
        }
    }
}

/// Evaluation strategy chosen per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Sequential host reference.
    Sequential,
    /// Flat kernel over staged-copy buffers.
    StagedCopy,
    /// Flat kernel over unified memory with implicit migration.
    UnifiedImplicit,
    /// Flat kernel over explicitly copied device memory.
    UnifiedExplicit,
    /// Flat kernel over explicitly managed shared memory.
    SharedManaged,
    /// Work-group tiled two-phase reduction.
    TiledGroup,
}

impl Strategy {
    /// All strategies, in declaration order.
    pub const ALL: [Strategy; 6] = [
        Self::Sequential,
        Self::StagedCopy,
        Self::UnifiedImplicit,
        Self::UnifiedExplicit,
        Self::SharedManaged,
        Self::TiledGroup,
    ];

    /// Residency used by the flat strategies; `None` for the reference and
    /// for the tiled strategy, whose residency comes from configuration.
    pub fn residency(self) -> Option<ResidencyKind> {
        match self {
            Self::StagedCopy => Some(ResidencyKind::StagedCopy),
            Self::UnifiedImplicit => Some(ResidencyKind::UnifiedImplicit),
            Self::UnifiedExplicit => Some(ResidencyKind::UnifiedExplicit),
            Self::SharedManaged => Some(ResidencyKind::SharedManaged),
            Self::Sequential | Self::TiledGroup => None,
        }
    }

    /// Whether this strategy needs an execution context.
    pub fn uses_device(self) -> bool {
        !matches!(self, Self::Sequential)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequential => write!(f, "sequential"),
            Self::StagedCopy => write!(f, "staged-copy"),
            Self::UnifiedImplicit => write!(f, "unified-implicit"),
            Self::UnifiedExplicit => write!(f, "unified-explicit"),
            Self::SharedManaged => write!(f, "shared-managed"),
            Self::TiledGroup => write!(f, "tiled-group"),
        }
    }
}

impl FromStr for Strategy {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "sequential" | "reference" => Ok(Self::Sequential),
            "staged-copy" => Ok(Self::StagedCopy),
            "unified-implicit" => Ok(Self::UnifiedImplicit),
            "unified-explicit" => Ok(Self::UnifiedExplicit),
            "shared-managed" => Ok(Self::SharedManaged),
            "tiled-group" | "tiled" => Ok(Self::TiledGroup),
            other => Err(format!("unknown strategy: {other}")),
        }
    }
}

/// Flat kernel family member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KernelVariant {
    /// Every task recomputes the full denominator. O(N²) baseline, not scalable.
    Naive,
    /// Exp pass, chunked partial sums, combine, normalize.
    Reduced,
}

impl fmt::Display for KernelVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Naive => write!(f, "naive"),
            Self::Reduced => write!(f, "reduced"),
        }
    }
}

impl FromStr for KernelVariant {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "naive" => Ok(Self::Naive),
            "reduced" => Ok(Self::Reduced),
            other => Err(format!("unknown kernel variant: {other}")),
        }
    }
}

/// How per-group partial sums become one denominator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CombineMode {
    /// Partials in a scratch region indexed by group id, summed by one task.
    TwoPass,
    /// Partials added into a zeroed scalar with a relaxed atomic add.
    Atomic,
}

impl fmt::Display for CombineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TwoPass => write!(f, "two-pass"),
            Self::Atomic => write!(f, "atomic"),
        }
    }
}

impl FromStr for CombineMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "two-pass" | "twopass" => Ok(Self::TwoPass),
            "atomic" => Ok(Self::Atomic),
            other => Err(format!("unknown combine mode: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_display_roundtrip() {
        for strategy in Strategy::ALL {
            let parsed: Strategy = strategy.to_string().parse().unwrap();
            assert_eq!(parsed, strategy);
        }
    }

    #[test]
    fn residency_display_roundtrip() {
        for kind in ResidencyKind::ALL {
            let parsed: ResidencyKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn flat_strategies_map_to_residency() {
        assert_eq!(Strategy::StagedCopy.residency(), Some(ResidencyKind::StagedCopy));
        assert_eq!(Strategy::SharedManaged.residency(), Some(ResidencyKind::SharedManaged));
        assert_eq!(Strategy::Sequential.residency(), None);
        assert_eq!(Strategy::TiledGroup.residency(), None);
        assert!(!Strategy::Sequential.uses_device());
        assert!(Strategy::TiledGroup.uses_device());
    }

    #[test]
    fn parsing_accepts_aliases() {
        assert_eq!("AUTO".parse::<DeviceTarget>().unwrap(), DeviceTarget::Default);
        assert_eq!("in_order".parse::<QueueOrdering>().unwrap(), QueueOrdering::InOrder);
        assert_eq!("tiled".parse::<Strategy>().unwrap(), Strategy::TiledGroup);
        assert_eq!("unified_explicit".parse::<ResidencyKind>().unwrap(), ResidencyKind::UnifiedExplicit);
        assert_eq!("two_pass".parse::<CombineMode>().unwrap(), CombineMode::TwoPass);
    }

    #[test]
    fn parsing_rejects_unknown() {
        let err = "tpu".parse::<DeviceTarget>().unwrap_err();
        assert!(err.contains("unknown device target"));
        assert!("blocked".parse::<KernelVariant>().is_err());
    }
}
