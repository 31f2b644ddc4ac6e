//! WGS-84 geometry kernel.
//!
//! Pure, stateless math over the wire types: great-circle distance,
//! bounding boxes with antimeridian handling, containment and
//! intersection tests, and volumes for inside-out result ordering.

use crate::types::{BoundingBox, Geometry, Location};

/// WGS-84 mean radius in meters.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Meters per degree of latitude (and of longitude at the equator).
const METERS_PER_DEGREE: f64 = EARTH_RADIUS_M * std::f64::consts::PI / 180.0;

/// Great-circle surface distance between two points, in meters.
///
/// Haversine formula; elevation is ignored.
pub fn haversine_distance(a: &Location, b: &Location) -> f64 {
    let lat1 = a.lat.to_radians();
    let lat2 = b.lat.to_radians();
    let dlat = (b.lat - a.lat).to_radians();
    let dlon = (b.lon - a.lon).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * h.sqrt().asin() * EARTH_RADIUS_M
}

/// 3-D distance including elevation. This is the value reported in
/// search results.
pub fn distance_3d(a: &Location, b: &Location) -> f64 {
    let surface = haversine_distance(a, b);
    let vertical = (a.ele - b.ele).abs();
    (surface * surface + vertical * vertical).sqrt()
}

/// Compute the axis-aligned bounding box of a geometry.
///
/// The box may include area outside the geometry but never excludes any
/// of it. Near the poles the longitude range widens to the full ±180.
/// A box whose longitude span would exceed 180° is stored as the
/// wrapping complement (`min_lon > max_lon`).
pub fn compute_bounding_box(geometry: &Geometry) -> BoundingBox {
    match geometry {
        Geometry::Sphere { center, radius } => sphere_bounding_box(center, *radius),
        Geometry::Polygon { vertices, .. } => polygon_bounding_box(vertices),
    }
}

/// Bounding box of a search query: a sphere of radius `range` at
/// `location`.
pub fn bounding_box_for_search(location: &Location, range: f64) -> BoundingBox {
    sphere_bounding_box(location, range)
}

fn sphere_bounding_box(center: &Location, radius: f64) -> BoundingBox {
    let lat_delta = radius / METERS_PER_DEGREE;

    let min_lat = (center.lat - lat_delta).max(-90.0);
    let max_lat = (center.lat + lat_delta).min(90.0);
    let pole_clamped = center.lat - lat_delta < -90.0 || center.lat + lat_delta > 90.0;

    // Longitude degrees shrink with latitude; near a pole the box covers
    // every longitude.
    let cos_lat = center.lat.to_radians().cos();
    if pole_clamped || cos_lat < 0.001 {
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
        };
    }

    let lon_delta = lat_delta / cos_lat;
    if lon_delta >= 180.0 {
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: -180.0,
            max_lon: 180.0,
        };
    }

    let min_lon = normalize_lon(center.lon - lon_delta);
    let max_lon = normalize_lon(center.lon + lon_delta);

    BoundingBox {
        min_lat,
        max_lat,
        min_lon,
        max_lon,
    }
}

fn polygon_bounding_box(vertices: &[Location]) -> BoundingBox {
    let min_lat = vertices.iter().map(|v| v.lat).fold(f64::INFINITY, f64::min);
    let max_lat = vertices
        .iter()
        .map(|v| v.lat)
        .fold(f64::NEG_INFINITY, f64::max);
    let min_lon = vertices.iter().map(|v| v.lon).fold(f64::INFINITY, f64::min);
    let max_lon = vertices
        .iter()
        .map(|v| v.lon)
        .fold(f64::NEG_INFINITY, f64::max);

    if max_lon - min_lon > 180.0 {
        // Vertices straddle the antimeridian: the tight box is the
        // complement interval, running east from the smallest positive
        // longitude across ±180 to the largest negative one.
        let west = vertices
            .iter()
            .map(|v| v.lon)
            .filter(|l| *l >= 0.0)
            .fold(f64::INFINITY, f64::min);
        let east = vertices
            .iter()
            .map(|v| v.lon)
            .filter(|l| *l < 0.0)
            .fold(f64::NEG_INFINITY, f64::max);
        return BoundingBox {
            min_lat,
            max_lat,
            min_lon: west,
            max_lon: east,
        };
    }

    BoundingBox {
        min_lat,
        max_lat,
        min_lon,
        max_lon,
    }
}

fn normalize_lon(lon: f64) -> f64 {
    if lon > 180.0 {
        lon - 360.0
    } else if lon < -180.0 {
        lon + 360.0
    } else {
        lon
    }
}

/// Test whether a point lies inside a geometry.
pub fn contains_point(geometry: &Geometry, point: &Location) -> bool {
    match geometry {
        Geometry::Sphere { center, radius } => distance_3d(center, point) <= *radius,
        Geometry::Polygon { vertices, height } => {
            let floor = min_vertex_ele(vertices);
            if point.ele < floor || point.ele > floor + height {
                return false;
            }
            point_in_footprint(vertices, point)
        }
    }
}

/// Test whether a geometry intersects a search sphere of radius `range`
/// at `center`.
pub fn intersects(geometry: &Geometry, center: &Location, range: f64) -> bool {
    match geometry {
        Geometry::Sphere {
            center: c,
            radius: r,
        } => distance_3d(c, center) <= r + range,
        Geometry::Polygon { .. } => distance_to_geometry(geometry, center) <= range,
    }
}

/// 3-D distance from a point to a geometry: center distance for spheres,
/// distance to the nearest point of the extruded prism for polygons.
pub fn distance_to_geometry(geometry: &Geometry, point: &Location) -> f64 {
    match geometry {
        Geometry::Sphere { center, .. } => distance_3d(center, point),
        Geometry::Polygon { vertices, height } => {
            let horizontal = if point_in_footprint(vertices, point) {
                0.0
            } else {
                footprint_edge_distance(vertices, point)
            };
            let floor = min_vertex_ele(vertices);
            let vertical = if point.ele < floor {
                floor - point.ele
            } else if point.ele > floor + height {
                point.ele - (floor + height)
            } else {
                0.0
            };
            (horizontal * horizontal + vertical * vertical).sqrt()
        }
    }
}

/// Volume in cubic meters, used only for inside-out result ordering.
pub fn volume(geometry: &Geometry) -> f64 {
    match geometry {
        Geometry::Sphere { radius, .. } => (4.0 / 3.0) * std::f64::consts::PI * radius.powi(3),
        Geometry::Polygon { vertices, height } => footprint_area_m2(vertices) * height,
    }
}

/// True if no two non-adjacent edges of the polygon intersect.
pub fn polygon_is_simple(vertices: &[Location]) -> bool {
    let n = vertices.len();
    if n < 3 {
        return false;
    }
    let origin = footprint_centroid(vertices);
    let pts: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();

    for i in 0..n {
        let a1 = pts[i];
        let a2 = pts[(i + 1) % n];
        for j in (i + 1)..n {
            // Skip adjacent edges (they share a vertex).
            if j == i || (j + 1) % n == i || (i + 1) % n == j {
                continue;
            }
            let b1 = pts[j];
            let b2 = pts[(j + 1) % n];
            if segments_intersect(a1, a2, b1, b2) {
                return false;
            }
        }
    }
    true
}

fn min_vertex_ele(vertices: &[Location]) -> f64 {
    vertices.iter().map(|v| v.ele).fold(f64::INFINITY, f64::min)
}

fn footprint_centroid(vertices: &[Location]) -> Location {
    let n = vertices.len() as f64;
    let lat = vertices.iter().map(|v| v.lat).sum::<f64>() / n;
    // Average longitudes via unit vectors so antimeridian polygons do
    // not produce a centroid on the wrong side of the globe.
    let (sx, sy) = vertices.iter().fold((0.0, 0.0), |(sx, sy), v| {
        let r = v.lon.to_radians();
        (sx + r.cos(), sy + r.sin())
    });
    let lon = sy.atan2(sx).to_degrees();
    Location::new(lat, lon, 0.0)
}

/// Equirectangular projection to local meters around `origin`, with the
/// longitude delta normalized into [-180, 180).
fn project(origin: &Location, p: &Location) -> (f64, f64) {
    let mut dlon = p.lon - origin.lon;
    if dlon > 180.0 {
        dlon -= 360.0;
    } else if dlon < -180.0 {
        dlon += 360.0;
    }
    let x = dlon * METERS_PER_DEGREE * origin.lat.to_radians().cos();
    let y = (p.lat - origin.lat) * METERS_PER_DEGREE;
    (x, y)
}

fn point_in_footprint(vertices: &[Location], point: &Location) -> bool {
    let origin = footprint_centroid(vertices);
    let pts: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();
    let (px, py) = project(&origin, point);

    // Ray cast east from the point.
    let mut inside = false;
    let n = pts.len();
    for i in 0..n {
        let (x1, y1) = pts[i];
        let (x2, y2) = pts[(i + 1) % n];
        if (y1 > py) != (y2 > py) {
            let x_at = x1 + (py - y1) / (y2 - y1) * (x2 - x1);
            if px < x_at {
                inside = !inside;
            }
        }
    }
    inside
}

fn footprint_edge_distance(vertices: &[Location], point: &Location) -> f64 {
    let origin = footprint_centroid(vertices);
    let pts: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();
    let p = project(&origin, point);

    let n = pts.len();
    let mut best = f64::INFINITY;
    for i in 0..n {
        let d = point_segment_distance(p, pts[i], pts[(i + 1) % n]);
        if d < best {
            best = d;
        }
    }
    best
}

fn point_segment_distance(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (px, py) = p;
    let (ax, ay) = a;
    let (bx, by) = b;
    let dx = bx - ax;
    let dy = by - ay;
    let len2 = dx * dx + dy * dy;
    let t = if len2 == 0.0 {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / len2).clamp(0.0, 1.0)
    };
    let cx = ax + t * dx;
    let cy = ay + t * dy;
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Shoelace area of the footprint on an equirectangular projection
/// centered at the polygon centroid, in square meters.
fn footprint_area_m2(vertices: &[Location]) -> f64 {
    let origin = footprint_centroid(vertices);
    let pts: Vec<(f64, f64)> = vertices.iter().map(|v| project(&origin, v)).collect();
    let n = pts.len();
    let mut sum = 0.0;
    for i in 0..n {
        let (x1, y1) = pts[i];
        let (x2, y2) = pts[(i + 1) % n];
        sum += x1 * y2 - x2 * y1;
    }
    (sum / 2.0).abs()
}

fn orientation(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    (b.0 - a.0) * (c.1 - a.1) - (b.1 - a.1) * (c.0 - a.0)
}

fn segments_intersect(a1: (f64, f64), a2: (f64, f64), b1: (f64, f64), b2: (f64, f64)) -> bool {
    let d1 = orientation(a1, a2, b1);
    let d2 = orientation(a1, a2, b2);
    let d3 = orientation(b1, b2, a1);
    let d4 = orientation(b1, b2, a2);
    (d1 * d2 < 0.0) && (d3 * d4 < 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sphere(lat: f64, lon: f64, radius: f64) -> Geometry {
        Geometry::Sphere {
            center: Location::new(lat, lon, 0.0),
            radius,
        }
    }

    #[test]
    fn test_haversine_same_point() {
        let loc = Location::new(-33.8568, 151.2153, 0.0);
        assert!(haversine_distance(&loc, &loc) < 0.1);
    }

    #[test]
    fn test_haversine_known_distance() {
        // Sydney Opera House to the Harbour Bridge, roughly 700 m.
        let opera_house = Location::new(-33.8568, 151.2153, 0.0);
        let harbour_bridge = Location::new(-33.8523, 151.2108, 0.0);
        let d = haversine_distance(&opera_house, &harbour_bridge);
        assert!(d > 600.0 && d < 800.0, "distance {}", d);
    }

    #[test]
    fn test_haversine_pole_to_pole() {
        let north = Location::new(90.0, 0.0, 0.0);
        let south = Location::new(-90.0, 0.0, 0.0);
        let d = haversine_distance(&north, &south);
        assert!(d > 19_000_000.0 && d < 21_000_000.0);
    }

    #[test]
    fn test_distance_3d_includes_elevation() {
        let a = Location::new(0.0, 0.0, 0.0);
        let b = Location::new(0.0, 0.0, 30.0);
        let d = distance_3d(&a, &b);
        assert!((d - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_small_sphere_bbox() {
        let bbox = compute_bounding_box(&sphere(0.0, 0.0, 1000.0));
        assert!(bbox.min_lat < 0.0 && bbox.max_lat > 0.0);
        assert!(bbox.min_lon < 0.0 && bbox.max_lon > 0.0);
        assert!(bbox.max_lat - bbox.min_lat < 0.1);
        assert!(bbox.max_lon - bbox.min_lon < 0.1);
        assert!(!bbox.wraps());
    }

    #[test]
    fn test_bbox_near_pole_widens_longitude() {
        let bbox = compute_bounding_box(&sphere(89.0, 0.0, 10_000.0));
        assert!(bbox.max_lon - bbox.min_lon > 1.0);
    }

    #[test]
    fn test_bbox_pole_clamp_covers_all_longitudes() {
        let bbox = compute_bounding_box(&sphere(89.999, 10.0, 50_000.0));
        assert_eq!(bbox.min_lon, -180.0);
        assert_eq!(bbox.max_lon, 180.0);
        assert_eq!(bbox.max_lat, 90.0);
    }

    #[test]
    fn test_bbox_wraps_across_antimeridian() {
        let bbox = compute_bounding_box(&sphere(0.0, 179.99, 10_000.0));
        assert!(bbox.wraps(), "bbox {:?}", bbox);
        assert!(bbox.contains(&Location::new(0.0, -179.99, 0.0)));
        assert!(bbox.contains(&Location::new(0.0, 179.95, 0.0)));
        assert!(!bbox.contains(&Location::new(0.0, 0.0, 0.0)));
    }

    #[test]
    fn test_polygon_bbox_antimeridian_complement() {
        let poly = Geometry::Polygon {
            vertices: vec![
                Location::new(0.0, 179.9, 0.0),
                Location::new(0.1, -179.9, 0.0),
                Location::new(-0.1, -179.8, 0.0),
            ],
            height: 10.0,
        };
        let bbox = compute_bounding_box(&poly);
        assert!(bbox.wraps());
        assert_eq!(bbox.min_lon, 179.9);
        assert!((bbox.max_lon - (-179.8)).abs() < 1e-9);
    }

    #[test]
    fn test_sphere_contains_point() {
        let s = sphere(0.0, 0.0, 1000.0);
        assert!(contains_point(&s, &Location::new(0.001, 0.001, 0.0)));
        assert!(!contains_point(&s, &Location::new(1.0, 1.0, 0.0)));
    }

    #[test]
    fn test_sphere_containment_uses_elevation() {
        let s = sphere(0.0, 0.0, 100.0);
        assert!(contains_point(&s, &Location::new(0.0, 0.0, 99.0)));
        assert!(!contains_point(&s, &Location::new(0.0, 0.0, 101.0)));
    }

    #[test]
    fn test_sphere_intersects_search() {
        let s = sphere(-33.8568, 151.2153, 50.0);
        let near = Location::new(-33.8570, 151.2155, 0.0);
        let far = Location::new(-33.8600, 151.2200, 0.0);
        assert!(intersects(&s, &near, 100.0));
        assert!(!intersects(&s, &far, 100.0));
    }

    #[test]
    fn test_polygon_contains_and_extrusion() {
        // Roughly a 200 m square at the equator, 50 m tall.
        let poly = Geometry::Polygon {
            vertices: vec![
                Location::new(0.0, 0.0, 10.0),
                Location::new(0.0, 0.002, 10.0),
                Location::new(0.002, 0.002, 10.0),
                Location::new(0.002, 0.0, 10.0),
            ],
            height: 50.0,
        };
        assert!(contains_point(&poly, &Location::new(0.001, 0.001, 30.0)));
        // Above the prism.
        assert!(!contains_point(&poly, &Location::new(0.001, 0.001, 61.0)));
        // Below the floor (min vertex elevation).
        assert!(!contains_point(&poly, &Location::new(0.001, 0.001, 5.0)));
        // Outside the footprint.
        assert!(!contains_point(&poly, &Location::new(0.01, 0.01, 30.0)));
    }

    #[test]
    fn test_polygon_prism_distance() {
        let poly = Geometry::Polygon {
            vertices: vec![
                Location::new(0.0, 0.0, 0.0),
                Location::new(0.0, 0.001, 0.0),
                Location::new(0.001, 0.001, 0.0),
                Location::new(0.001, 0.0, 0.0),
            ],
            height: 10.0,
        };
        // Inside at valid elevation: zero.
        assert_eq!(
            distance_to_geometry(&poly, &Location::new(0.0005, 0.0005, 5.0)),
            0.0
        );
        // Directly above the footprint by 20 m: 10 m past the roof.
        let above = distance_to_geometry(&poly, &Location::new(0.0005, 0.0005, 20.0));
        assert!((above - 10.0).abs() < 1e-6, "distance {}", above);
        // Horizontally offset: positive and of plausible magnitude.
        let aside = distance_to_geometry(&poly, &Location::new(0.0005, 0.002, 5.0));
        assert!(aside > 50.0 && aside < 200.0, "distance {}", aside);
    }

    #[test]
    fn test_sphere_volume_formula() {
        let v = volume(&sphere(0.0, 0.0, 100.0));
        let expected = (4.0 / 3.0) * std::f64::consts::PI * 100.0_f64.powi(3);
        assert!((v - expected).abs() < 1e-6);
    }

    #[test]
    fn test_volume_orders_inside_out() {
        assert!(volume(&sphere(0.0, 0.0, 10.0)) < volume(&sphere(0.0, 0.0, 1000.0)));
    }

    #[test]
    fn test_polygon_volume_roughly_square() {
        // ~111 m x ~111 m x 10 m at the equator.
        let poly = Geometry::Polygon {
            vertices: vec![
                Location::new(0.0, 0.0, 0.0),
                Location::new(0.0, 0.001, 0.0),
                Location::new(0.001, 0.001, 0.0),
                Location::new(0.001, 0.0, 0.0),
            ],
            height: 10.0,
        };
        let v = volume(&poly);
        assert!(v > 100_000.0 && v < 150_000.0, "volume {}", v);
    }

    #[test]
    fn test_polygon_simplicity() {
        let square = vec![
            Location::new(0.0, 0.0, 0.0),
            Location::new(0.0, 1.0, 0.0),
            Location::new(1.0, 1.0, 0.0),
            Location::new(1.0, 0.0, 0.0),
        ];
        assert!(polygon_is_simple(&square));

        // Bowtie: edges cross.
        let bowtie = vec![
            Location::new(0.0, 0.0, 0.0),
            Location::new(1.0, 1.0, 0.0),
            Location::new(0.0, 1.0, 0.0),
            Location::new(1.0, 0.0, 0.0),
        ];
        assert!(!polygon_is_simple(&bowtie));
    }
}
