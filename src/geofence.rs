//! Geofence and frequency policy module.
//!
//! Maps the last known position to the regional APRS frequency and clamps
//! every resolved frequency to the band plan. All containment math is done
//! on 1e-7 degree integers.

use crate::telemetry::DataPoint;

/// A transmit frequency request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Frequency {
    /// A fixed frequency, in Hz.
    Static(u32),
    /// The regional APRS frequency for the current position.
    Dynamic,
}

/// One entry of the band plan.
#[derive(Debug, Clone, Copy)]
pub struct Band {
    /// Lower band edge, in Hz.
    pub start: u32,
    /// Upper band edge, in Hz.
    pub end: u32,
    /// Channel raster, in Hz.
    pub step: u32,
    /// The APRS frequency used when a resolved frequency falls outside the
    /// band.
    pub default_aprs: u32,
}

/// The 2 m amateur band.
pub const BAND_2M: Band = Band {
    start: 144_000_000,
    end: 148_000_000,
    step: 12_500,
    default_aprs: 144_800_000,
};

/// The 70 cm amateur band.
pub const BAND_70CM: Band = Band {
    start: 430_000_000,
    end: 440_000_000,
    step: 12_500,
    default_aprs: 432_500_000,
};

/// All supported bands.
pub const BANDS: [Band; 2] = [BAND_2M, BAND_70CM];

/// Whole degrees to 1e-7 degree units.
const fn deg(d: i32) -> i32 {
    d * 10_000_000
}

/// Region outline, in 1e-7 degree units.
#[derive(Debug, Clone, Copy)]
enum Shape {
    /// Axis-aligned rectangle.
    Rect {
        lat_min: i32,
        lat_max: i32,
        lon_min: i32,
        lon_max: i32,
    },
    /// Closed polygon of (lat, lon) vertices, even-odd rule.
    Poly(&'static [(i32, i32)]),
}

impl Shape {
    fn contains(&self, lat: i32, lon: i32) -> bool {
        match *self {
            Shape::Rect {
                lat_min,
                lat_max,
                lon_min,
                lon_max,
            } => lat >= lat_min && lat <= lat_max && lon >= lon_min && lon <= lon_max,
            Shape::Poly(points) => {
                let mut inside = false;
                let n = points.len();
                let (lat, lon) = (i64::from(lat), i64::from(lon));
                for i in 0..n {
                    let (y1, x1) = (i64::from(points[i].0), i64::from(points[i].1));
                    let j = (i + 1) % n;
                    let (y2, x2) = (i64::from(points[j].0), i64::from(points[j].1));
                    if (y1 > lat) != (y2 > lat)
                        && lon < (x2 - x1) * (lat - y1) / (y2 - y1) + x1
                    {
                        inside = !inside;
                    }
                }
                inside
            }
        }
    }
}

/// One geofence region with its primary APRS frequency.
#[derive(Debug, Clone, Copy)]
struct Region {
    name: &'static str,
    frequency_hz: u32,
    shape: Shape,
}

/// Rough Japan outline. Kept as a polygon so the mainland is matched without
/// swallowing the Korean peninsula or eastern China.
const JAPAN: [(i32, i32); 5] = [
    (deg(24), deg(123)),
    (deg(24), deg(147)),
    (deg(46), deg(147)),
    (deg(46), deg(140)),
    (deg(33), deg(128)),
];

/// Region table, first match wins. More specific regions come first.
const REGIONS: [Region; 9] = [
    Region {
        name: "Japan",
        frequency_hz: 144_640_000,
        shape: Shape::Poly(&JAPAN),
    },
    Region {
        name: "Thailand",
        frequency_hz: 145_525_000,
        shape: Shape::Rect {
            lat_min: deg(5),
            lat_max: deg(21),
            lon_min: deg(97),
            lon_max: deg(106),
        },
    },
    Region {
        name: "New Zealand",
        frequency_hz: 144_575_000,
        shape: Shape::Rect {
            lat_min: deg(-48),
            lat_max: deg(-34),
            lon_min: deg(166),
            lon_max: deg(179),
        },
    },
    Region {
        name: "Australia",
        frequency_hz: 145_175_000,
        shape: Shape::Rect {
            lat_min: deg(-45),
            lat_max: deg(-10),
            lon_min: deg(112),
            lon_max: deg(154),
        },
    },
    Region {
        name: "Argentina",
        frequency_hz: 144_930_000,
        shape: Shape::Rect {
            lat_min: deg(-56),
            lat_max: deg(-21),
            lon_min: deg(-74),
            lon_max: deg(-53),
        },
    },
    Region {
        name: "Brazil",
        frequency_hz: 145_570_000,
        shape: Shape::Rect {
            lat_min: deg(-34),
            lat_max: deg(6),
            lon_min: deg(-74),
            lon_max: deg(-34),
        },
    },
    Region {
        name: "China",
        frequency_hz: 144_640_000,
        shape: Shape::Rect {
            lat_min: deg(18),
            lat_max: deg(54),
            lon_min: deg(73),
            lon_max: deg(123),
        },
    },
    Region {
        name: "North America",
        frequency_hz: 144_390_000,
        shape: Shape::Rect {
            lat_min: deg(15),
            lat_max: deg(72),
            lon_min: deg(-168),
            lon_max: deg(-52),
        },
    },
    Region {
        name: "Europe",
        frequency_hz: 144_800_000,
        shape: Shape::Rect {
            lat_min: deg(36),
            lat_max: deg(71),
            lon_min: deg(-11),
            lon_max: deg(40),
        },
    },
];

/// Checks whether a frequency lies inside any band of the plan.
pub fn in_any_band(hz: u32) -> bool {
    BANDS.iter().any(|b| hz >= b.start && hz <= b.end)
}

/// Finds the band containing a frequency.
pub fn band_for(hz: u32) -> Option<&'static Band> {
    BANDS.iter().find(|b| hz >= b.start && hz <= b.end)
}

/// Clamps a frequency to a band, substituting the band's APRS default when
/// it falls outside.
pub fn clamp_to_band(hz: u32, band: &Band) -> u32 {
    if hz >= band.start && hz <= band.end {
        hz
    } else {
        band.default_aprs
    }
}

/// Looks up the regional APRS frequency for a position, if any region
/// contains it.
pub fn region_frequency(lat: i32, lon: i32) -> Option<u32> {
    REGIONS
        .iter()
        .find(|r| r.shape.contains(lat, lon))
        .map(|r| r.frequency_hz)
}

/// Looks up the region name for a position. Diagnostic only.
pub fn region_name(lat: i32, lon: i32) -> Option<&'static str> {
    REGIONS
        .iter()
        .find(|r| r.shape.contains(lat, lon))
        .map(|r| r.name)
}

/// Resolves a frequency request against the last known position.
///
/// A dynamic request picks the regional frequency by containment. If no
/// region matches, or no usable position exists, the configured default is
/// used. The result always lies inside `band`.
pub fn resolve(
    frequency: Frequency,
    point: Option<&DataPoint>,
    default_hz: u32,
    band: &Band,
) -> u32 {
    let hz = match frequency {
        Frequency::Static(hz) => hz,
        Frequency::Dynamic => point
            .filter(|p| p.has_position())
            .and_then(|p| region_frequency(p.gps_lat, p.gps_lon))
            .unwrap_or(default_hz),
    };
    clamp_to_band(hz, band)
}
