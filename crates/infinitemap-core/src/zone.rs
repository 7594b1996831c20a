//! Concentric zone classification.
//!
//! Zones are distance bands around the grid center. Placement steers
//! important files inward; migration moves frequently-accessed clusters
//! toward HOT and idle clusters toward COLD.

use crate::cluster::ClusterLocation;
use serde::{Deserialize, Serialize};

/// Zone classification for a grid location, ordered hottest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Zone {
    /// Innermost band, `d < N/64`.
    Hot,
    /// `d < 3N/64`.
    Warm,
    /// `d < N/16`.
    Temperate,
    /// `d < N/8`.
    Cool,
    /// Everything else out to the grid edge.
    Cold,
}

impl Zone {
    /// Desirability weight used by the migration planner. Higher is more
    /// desirable.
    #[must_use]
    pub fn weight(self) -> u32 {
        match self {
            Zone::Hot => 100,
            Zone::Warm => 80,
            Zone::Temperate => 60,
            Zone::Cool => 40,
            Zone::Cold => 20,
        }
    }

    /// Upper-case name as used in reports and serialized documents.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Zone::Hot => "HOT",
            Zone::Warm => "WARM",
            Zone::Temperate => "TEMPERATE",
            Zone::Cool => "COOL",
            Zone::Cold => "COLD",
        }
    }
}

impl std::fmt::Display for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Zone radii for a given grid, all distances in cells from the center.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ZoneMap {
    /// Grid side length `N`.
    pub grid_size: u32,
    /// HOT outer radius, `N/64`.
    pub hot_radius: f64,
    /// WARM outer radius, `3N/64`.
    pub warm_radius: f64,
    /// TEMPERATE outer radius, `N/16`.
    pub temperate_radius: f64,
    /// COOL outer radius, `N/8`.
    pub cool_radius: f64,
    /// Grid edge distance, used as the COLD band's nominal outer radius.
    pub cold_radius: f64,
}

impl ZoneMap {
    /// Derives the zone radii for a grid of side `grid_size`.
    #[must_use]
    pub fn for_grid(grid_size: u32) -> Self {
        let n = f64::from(grid_size);
        Self {
            grid_size,
            hot_radius: n / 64.0,
            warm_radius: n * 3.0 / 64.0,
            temperate_radius: n / 16.0,
            cool_radius: n / 8.0,
            cold_radius: n / 2.0,
        }
    }

    /// The grid center `(N/2, N/2)`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // grid_size <= 4096 fits u16
    pub fn center(&self) -> ClusterLocation {
        ClusterLocation::new((self.grid_size / 2) as u16, (self.grid_size / 2) as u16)
    }

    /// Classifies a distance from center into a zone.
    #[must_use]
    pub fn classify_distance(&self, distance: f64) -> Zone {
        if distance < self.hot_radius {
            Zone::Hot
        } else if distance < self.warm_radius {
            Zone::Warm
        } else if distance < self.temperate_radius {
            Zone::Temperate
        } else if distance < self.cool_radius {
            Zone::Cool
        } else {
            Zone::Cold
        }
    }

    /// Classifies a grid location into a zone by its distance to center.
    #[must_use]
    pub fn classify(&self, location: ClusterLocation) -> Zone {
        self.classify_distance(location.distance_to(self.center()))
    }
}
