//! Randomized selection of an execution region.
//!
//! Parallel cases must not all land in the first allowed region, so the pick is
//! uniform over every eligible candidate. The caller supplies the `Rng`.

use std::collections::BTreeSet;

use rand::Rng;
use rand::seq::SliceRandom;

use crate::error::NoEligibleRegionError;

/// Regions that are generally reliable for ephemeral test infrastructure.
pub const DEFAULT_STABLE_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-west-2",
    "eu-central-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-south-1",
    "ca-central-1",
    "sa-east-1",
];

/// Allowed regions (in preference order) and regions known to be bad right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionCandidates {
    pub allowed: Vec<String>,
    pub excluded: BTreeSet<String>,
}

impl RegionCandidates {
    pub fn new<A, E>(allowed: A, excluded: E) -> Self
    where
        A: IntoIterator,
        A::Item: Into<String>,
        E: IntoIterator,
        E::Item: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
            excluded: excluded.into_iter().map(Into::into).collect(),
        }
    }

    /// Allowed regions minus exclusions, deduplicated, in allowed order.
    pub fn eligible(&self) -> Vec<&str> {
        let mut seen = BTreeSet::new();
        self.allowed
            .iter()
            .map(String::as_str)
            .filter(|region| !self.excluded.contains(*region))
            .filter(|region| seen.insert(*region))
            .collect()
    }

    fn no_eligible(&self) -> NoEligibleRegionError {
        NoEligibleRegionError {
            allowed: self.allowed.clone(),
            excluded: self.excluded.iter().cloned().collect(),
        }
    }
}

/// Pick one eligible region uniformly at random.
pub fn select_region<R: Rng + ?Sized>(
    candidates: &RegionCandidates,
    rng: &mut R,
) -> Result<String, NoEligibleRegionError> {
    candidates
        .eligible()
        .choose(rng)
        .map(|region| (*region).to_string())
        .ok_or_else(|| candidates.no_eligible())
}

/// Read-only source of region health.
pub trait RegionOracle {
    /// Regions considered stable enough for tests.
    fn stable_regions(&self) -> BTreeSet<String>;
    /// Regions currently overloaded or unstable.
    fn unavailable_regions(&self) -> BTreeSet<String>;
}

/// Oracle backed by fixed lists (built-in defaults unless overridden by settings).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRegionOracle {
    stable: BTreeSet<String>,
    unavailable: BTreeSet<String>,
}

impl StaticRegionOracle {
    pub fn new<S, U>(stable: S, unavailable: U) -> Self
    where
        S: IntoIterator,
        S::Item: Into<String>,
        U: IntoIterator,
        U::Item: Into<String>,
    {
        Self {
            stable: stable.into_iter().map(Into::into).collect(),
            unavailable: unavailable.into_iter().map(Into::into).collect(),
        }
    }
}

impl Default for StaticRegionOracle {
    fn default() -> Self {
        Self::new(DEFAULT_STABLE_REGIONS.iter().copied(), std::iter::empty::<String>())
    }
}

impl RegionOracle for StaticRegionOracle {
    fn stable_regions(&self) -> BTreeSet<String> {
        self.stable.clone()
    }

    fn unavailable_regions(&self) -> BTreeSet<String> {
        self.unavailable.clone()
    }
}

/// Region selection that also consults a [`RegionOracle`].
#[derive(Debug, Clone)]
pub struct RegionSelector<O> {
    oracle: O,
    forced: Option<String>,
}

impl<O: RegionOracle> RegionSelector<O> {
    pub fn new(oracle: O) -> Self {
        Self {
            oracle,
            forced: None,
        }
    }

    /// Always return `region` (it must still be eligible).
    pub fn with_forced(mut self, region: Option<String>) -> Self {
        self.forced = region;
        self
    }

    /// Narrow `candidates` with the oracle: only stable regions, minus unavailable ones.
    pub fn effective_candidates(&self, candidates: &RegionCandidates) -> RegionCandidates {
        let stable = self.oracle.stable_regions();
        let mut excluded = candidates.excluded.clone();
        excluded.extend(self.oracle.unavailable_regions());
        excluded.extend(
            candidates
                .allowed
                .iter()
                .filter(|region| !stable.contains(*region))
                .cloned(),
        );
        RegionCandidates {
            allowed: candidates.allowed.clone(),
            excluded,
        }
    }

    pub fn select<R: Rng + ?Sized>(
        &self,
        candidates: &RegionCandidates,
        rng: &mut R,
    ) -> Result<String, NoEligibleRegionError> {
        let effective = self.effective_candidates(candidates);
        match &self.forced {
            Some(region) if effective.eligible().contains(&region.as_str()) => Ok(region.clone()),
            Some(_) => Err(effective.no_eligible()),
            None => select_region(&effective, rng),
        }
    }
}
