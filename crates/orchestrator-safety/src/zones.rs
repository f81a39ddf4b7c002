//! Safety zones: angular sectors with a distance threshold and an action.

use orchestrator_types::{
    AngularSector, HalError, ObstacleInfo, SafetyConfig, SafetyZone, Scan, SectorHit, ZoneAction,
};

/// Warning zones sit at this fraction of the stop threshold.
pub const WARNING_FRACTION: f64 = 0.7;

/// Built-in zones used when the configuration lists none.
pub fn default_zones(obstacle_threshold: f64) -> Vec<SafetyZone> {
    vec![
        SafetyZone {
            name: "critical_front".to_string(),
            angle_min: -45.0,
            angle_max: 45.0,
            distance_threshold: obstacle_threshold,
            priority: 1,
            action: ZoneAction::Stop,
        },
        SafetyZone {
            name: "warning_left".to_string(),
            angle_min: 45.0,
            angle_max: 135.0,
            distance_threshold: obstacle_threshold * WARNING_FRACTION,
            priority: 2,
            action: ZoneAction::Warn,
        },
        SafetyZone {
            name: "warning_right".to_string(),
            angle_min: 225.0,
            angle_max: 315.0,
            distance_threshold: obstacle_threshold * WARNING_FRACTION,
            priority: 2,
            action: ZoneAction::Warn,
        },
    ]
}

struct CompiledZone {
    zone: SafetyZone,
    sector: AngularSector,
}

/// A violated zone and what was seen inside it.
#[derive(Debug, Clone, Copy)]
pub struct ZoneHit<'a> {
    pub zone: &'a SafetyZone,
    pub hit: SectorHit,
}

impl ZoneHit<'_> {
    pub fn obstacle_info(&self) -> ObstacleInfo {
        ObstacleInfo {
            distance: self.hit.distance,
            angle: self.hit.angle,
            zone_name: self.zone.name.clone(),
            obstacle_count: self.hit.count,
        }
    }
}

/// Result of checking one scan against every zone.
#[derive(Debug, Default)]
pub struct Evaluation<'a> {
    /// The first stop zone violated, if any.  Evaluation ends there.
    pub stop: Option<ZoneHit<'a>>,
    /// Warn zones violated before the stop zone (or all of them).
    pub warnings: Vec<ZoneHit<'a>>,
}

impl Evaluation<'_> {
    pub fn is_clear(&self) -> bool {
        self.stop.is_none() && self.warnings.is_empty()
    }
}

/// Zones in evaluation order.
pub struct ZoneSet {
    zones: Vec<CompiledZone>,
}

impl ZoneSet {
    /// Configured zones, or the defaults when none are configured, sorted by
    /// priority.  Zones with equal priority keep their configured order.
    ///
    /// # Errors
    ///
    /// Returns [`HalError::Validation`] for an invalid zone.
    pub fn from_config(config: &SafetyConfig) -> Result<Self, HalError> {
        let zones = if config.zones.is_empty() {
            default_zones(config.obstacle_threshold)
        } else {
            config.zones.clone()
        };
        Self::new(zones)
    }

    pub fn new(mut zones: Vec<SafetyZone>) -> Result<Self, HalError> {
        for zone in &zones {
            zone.validate()?;
        }
        zones.sort_by_key(|z| z.priority);
        Ok(Self {
            zones: zones
                .into_iter()
                .map(|zone| CompiledZone {
                    sector: AngularSector::new(zone.angle_min, zone.angle_max),
                    zone,
                })
                .collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SafetyZone> {
        self.zones.iter().map(|c| &c.zone)
    }

    pub fn evaluate(&self, scan: &Scan) -> Evaluation<'_> {
        let mut result = Evaluation::default();
        for compiled in &self.zones {
            let Some(hit) = scan.sector_minimum(compiled.sector, compiled.zone.distance_threshold) else {
                continue;
            };
            let zone_hit = ZoneHit {
                zone: &compiled.zone,
                hit,
            };
            match compiled.zone.action {
                ZoneAction::Stop => {
                    result.stop = Some(zone_hit);
                    break;
                }
                ZoneAction::Warn => result.warnings.push(zone_hit),
            }
        }
        result
    }
}
