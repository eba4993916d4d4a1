//! Resource dimensions, limits and per-entity quotas.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Raw wire value meaning "no ceiling".
pub const UNLIMITED_SENTINEL: i64 = -1;

/// The five metered resources. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceDimension {
    Workflows,
    Plugins,
    ApiCalls,
    Storage,
    Steps,
}

impl ResourceDimension {
    pub const ALL: [ResourceDimension; 5] = [
        ResourceDimension::Workflows,
        ResourceDimension::Plugins,
        ResourceDimension::ApiCalls,
        ResourceDimension::Storage,
        ResourceDimension::Steps,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ResourceDimension::Workflows => "workflows",
            ResourceDimension::Plugins => "plugins",
            ResourceDimension::ApiCalls => "api_calls",
            ResourceDimension::Storage => "storage",
            ResourceDimension::Steps => "steps",
        }
    }
}

impl fmt::Display for ResourceDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceDimension {
    type Err = Error;

    /// Accepts `api_calls`, `ApiCalls`, `API_CALLS` and friends.
    fn from_str(s: &str) -> Result<Self> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .collect::<String>()
            .to_ascii_lowercase();
        match normalized.as_str() {
            "workflows" => Ok(ResourceDimension::Workflows),
            "plugins" => Ok(ResourceDimension::Plugins),
            "apicalls" => Ok(ResourceDimension::ApiCalls),
            "storage" => Ok(ResourceDimension::Storage),
            "steps" => Ok(ResourceDimension::Steps),
            _ => Err(Error::validation(format!("unknown resource dimension: {s}"))),
        }
    }
}

/// A ceiling for one dimension. Serialized as `i64` with `-1` for unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum Limit {
    Unlimited,
    Finite(u64),
}

impl Limit {
    /// Parse a raw wire value. Anything below `-1` is `InvalidLimit`.
    pub fn from_raw(raw: i64) -> Result<Self> {
        match raw {
            UNLIMITED_SENTINEL => Ok(Limit::Unlimited),
            n if n < UNLIMITED_SENTINEL => {
                Err(Error::invalid_limit(format!("{n} is below the unlimited sentinel -1")))
            }
            n => Ok(Limit::Finite(n as u64)),
        }
    }

    /// Raw wire value. Finite values beyond `i64::MAX` saturate.
    pub fn as_raw(self) -> i64 {
        match self {
            Limit::Unlimited => UNLIMITED_SENTINEL,
            Limit::Finite(n) => i64::try_from(n).unwrap_or(i64::MAX),
        }
    }

    pub fn is_unlimited(self) -> bool {
        matches!(self, Limit::Unlimited)
    }

    pub fn finite(self) -> Option<u64> {
        match self {
            Limit::Unlimited => None,
            Limit::Finite(n) => Some(n),
        }
    }
}

impl TryFrom<i64> for Limit {
    type Error = Error;

    fn try_from(raw: i64) -> Result<Self> {
        Limit::from_raw(raw)
    }
}

impl From<Limit> for i64 {
    fn from(limit: Limit) -> Self {
        limit.as_raw()
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => f.write_str("unlimited"),
            Limit::Finite(n) => write!(f, "{n}"),
        }
    }
}

/// Per-dimension ceilings owned by one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub workflows: Limit,
    pub plugins: Limit,
    pub api_calls: Limit,
    pub storage: Limit,
    pub steps: Limit,
}

impl Quota {
    /// Same limit on every dimension.
    pub fn uniform(limit: Limit) -> Self {
        Self {
            workflows: limit,
            plugins: limit,
            api_calls: limit,
            storage: limit,
            steps: limit,
        }
    }

    pub fn zero() -> Self {
        Self::uniform(Limit::Finite(0))
    }

    pub fn unlimited() -> Self {
        Self::uniform(Limit::Unlimited)
    }

    pub fn get(&self, dimension: ResourceDimension) -> Limit {
        match dimension {
            ResourceDimension::Workflows => self.workflows,
            ResourceDimension::Plugins => self.plugins,
            ResourceDimension::ApiCalls => self.api_calls,
            ResourceDimension::Storage => self.storage,
            ResourceDimension::Steps => self.steps,
        }
    }

    pub fn set(&mut self, dimension: ResourceDimension, limit: Limit) {
        let slot = match dimension {
            ResourceDimension::Workflows => &mut self.workflows,
            ResourceDimension::Plugins => &mut self.plugins,
            ResourceDimension::ApiCalls => &mut self.api_calls,
            ResourceDimension::Storage => &mut self.storage,
            ResourceDimension::Steps => &mut self.steps,
        };
        *slot = limit;
    }

    pub fn with(mut self, dimension: ResourceDimension, limit: Limit) -> Self {
        self.set(dimension, limit);
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceDimension, Limit)> + '_ {
        ResourceDimension::ALL.iter().map(move |d| (*d, self.get(*d)))
    }

    /// Dimension → raw `i64` (`-1` = unlimited), the external query shape.
    pub fn to_raw(&self) -> BTreeMap<ResourceDimension, i64> {
        self.iter().map(|(d, l)| (d, l.as_raw())).collect()
    }
}

impl Default for Quota {
    fn default() -> Self {
        Self::zero()
    }
}

/// A partial quota change in raw wire form.
///
/// Dimensions absent from the update keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuotaUpdate(BTreeMap<ResourceDimension, i64>);

impl QuotaUpdate {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Same raw value on every dimension.
    pub fn uniform(raw: i64) -> Self {
        Self(ResourceDimension::ALL.iter().map(|d| (*d, raw)).collect())
    }

    pub fn with(mut self, dimension: ResourceDimension, raw: i64) -> Self {
        self.0.insert(dimension, raw);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = ResourceDimension> + '_ {
        self.0.keys().copied()
    }

    /// Validate every value and overlay it onto `base`.
    pub fn apply_to(&self, base: &Quota) -> Result<Quota> {
        let mut next = *base;
        for (dimension, raw) in &self.0 {
            let limit = Limit::from_raw(*raw).map_err(|_| {
                Error::invalid_limit(format!("{dimension} = {raw}: must be -1 or non-negative"))
            })?;
            next.set(*dimension, limit);
        }
        Ok(next)
    }
}

impl From<BTreeMap<ResourceDimension, i64>> for QuotaUpdate {
    fn from(map: BTreeMap<ResourceDimension, i64>) -> Self {
        Self(map)
    }
}
