//! Spatial index over catch locations.
//!
//! Points live in 1°×1° cells. A query collects the cells that can intersect the search
//! circle, measures every candidate with the haversine formula and hands back a
//! [`GeoScan`]: an iterator that yields hits by ascending `(distance, catch id)`.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::f64::consts::FRAC_PI_2;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::core::errors::{CoreError, Result};
use crate::models::models::{CatchId, GeoPoint};

/// Mean earth radius (IUGG).
pub const EARTH_RADIUS_METERS: f64 = 6_371_008.8;

/// Great-circle distance between two points.
pub fn haversine_meters(a: GeoPoint, b: GeoPoint) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let half_dlat = ((b.latitude - a.latitude).to_radians() / 2.0).sin();
    let half_dlon = ((b.longitude - a.longitude).to_radians() / 2.0).sin();
    let h = half_dlat * half_dlat + lat1.cos() * lat2.cos() * half_dlon * half_dlon;
    2.0 * EARTH_RADIUS_METERS * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoHit {
    pub catch_id: CatchId,
    pub distance_meters: f64,
}

impl GeoHit {
    fn order(&self, other: &Self) -> Ordering {
        self.distance_meters
            .total_cmp(&other.distance_meters)
            .then_with(|| self.catch_id.cmp(&other.catch_id))
    }
}

impl Eq for GeoHit {}

impl PartialOrd for GeoHit {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GeoHit {
    fn cmp(&self, other: &Self) -> Ordering {
        self.order(other)
    }
}

/// Where a previous scan stopped. Resuming yields only hits strictly after it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoCursor {
    pub distance_meters: f64,
    pub catch_id: CatchId,
}

impl From<GeoHit> for GeoCursor {
    fn from(hit: GeoHit) -> Self {
        Self {
            distance_meters: hit.distance_meters,
            catch_id: hit.catch_id,
        }
    }
}

/// Lazily ordered hits of one query, taken from a snapshot of the index.
#[derive(Debug)]
pub struct GeoScan {
    heap: BinaryHeap<Reverse<GeoHit>>,
}

impl GeoScan {
    fn new(hits: Vec<GeoHit>) -> Self {
        Self {
            heap: hits.into_iter().map(Reverse).collect(),
        }
    }

    /// Drops everything up to and including `cursor`.
    pub fn resume_after(self, cursor: GeoCursor) -> Self {
        let bound = GeoHit {
            catch_id: cursor.catch_id,
            distance_meters: cursor.distance_meters,
        };
        Self::new(self.heap.into_iter().map(|Reverse(h)| h).filter(|h| *h > bound).collect())
    }

    /// Drops hits closer than `distance_meters`, keeping those exactly at it.
    pub fn from_distance(self, distance_meters: f64) -> Self {
        Self::new(
            self.heap
                .into_iter()
                .map(|Reverse(h)| h)
                .filter(|h| h.distance_meters.total_cmp(&distance_meters) != Ordering::Less)
                .collect(),
        )
    }
}

impl Iterator for GeoScan {
    type Item = GeoHit;

    fn next(&mut self) -> Option<GeoHit> {
        self.heap.pop().map(|Reverse(hit)| hit)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.heap.len(), Some(self.heap.len()))
    }
}

type Cell = (i32, i32);

fn cell_of(point: GeoPoint) -> Cell {
    let lon = point.longitude.floor() as i32;
    let lat = point.latitude.floor() as i32;
    (if lon >= 180 { -180 } else { lon }, lat.min(89))
}

fn wrap_lon_cell(lon: i32) -> i32 {
    (lon + 180).rem_euclid(360) - 180
}

/// Cells that may hold points within `radius` of `center`, or `None` when the whole
/// grid has to be scanned.
fn candidate_cells(center: GeoPoint, radius_meters: f64) -> Option<HashSet<Cell>> {
    let angle = radius_meters / EARTH_RADIUS_METERS;
    if angle >= FRAC_PI_2 {
        return None;
    }
    // One cell of margin on every side absorbs rounding at cell borders.
    let angle_deg = angle.to_degrees();
    let lat_lo = center.latitude - angle_deg - 1.0;
    let lat_hi = center.latitude + angle_deg + 1.0;
    let lat_cells = (lat_lo.max(-90.0).floor() as i32)..=(lat_hi.min(89.0).floor() as i32);

    let touches_pole = lat_lo <= -90.0 || lat_hi >= 90.0;
    let lon_cells: Vec<i32> = if touches_pole {
        (-180..180).collect()
    } else {
        let ratio = angle.sin() / center.latitude.to_radians().cos();
        if !(ratio < 1.0) {
            (-180..180).collect()
        } else {
            let dlon = ratio.asin().to_degrees() + 1.0;
            if dlon >= 179.0 {
                (-180..180).collect()
            } else {
                let lo = (center.longitude - dlon).floor() as i32;
                let hi = (center.longitude + dlon).floor() as i32;
                (lo..=hi).map(wrap_lon_cell).collect()
            }
        }
    };

    let mut cells = HashSet::new();
    for lat in lat_cells {
        for lon in &lon_cells {
            cells.insert((*lon, lat));
        }
    }
    Some(cells)
}

#[derive(Default)]
struct Grid {
    cells: HashMap<Cell, HashMap<CatchId, GeoPoint>>,
    positions: HashMap<CatchId, GeoPoint>,
}

impl Grid {
    fn remove(&mut self, catch_id: CatchId) -> bool {
        let Some(point) = self.positions.remove(&catch_id) else {
            return false;
        };
        let cell = cell_of(point);
        if let Some(members) = self.cells.get_mut(&cell) {
            members.remove(&catch_id);
            if members.is_empty() {
                self.cells.remove(&cell);
            }
        }
        true
    }
}

/// Concurrent spatial index. Writers take the lock briefly; queries copy what they need
/// and release it before the caller iterates.
#[derive(Default)]
pub struct GeoIndex {
    grid: RwLock<Grid>,
}

impl GeoIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Grid>> {
        self.grid
            .read()
            .map_err(|_| CoreError::Storage("geo index lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Grid>> {
        self.grid
            .write()
            .map_err(|_| CoreError::Storage("geo index lock poisoned".to_string()))
    }

    /// Inserts or moves a catch.
    pub fn insert(&self, catch_id: CatchId, longitude: f64, latitude: f64) -> Result<()> {
        let point = GeoPoint::new(longitude, latitude)?;
        let mut grid = self.write()?;
        grid.remove(catch_id);
        grid.cells.entry(cell_of(point)).or_default().insert(catch_id, point);
        grid.positions.insert(catch_id, point);
        Ok(())
    }

    /// Returns whether the catch was indexed.
    pub fn remove(&self, catch_id: CatchId) -> Result<bool> {
        Ok(self.write()?.remove(catch_id))
    }

    pub fn contains(&self, catch_id: CatchId) -> Result<bool> {
        Ok(self.read()?.positions.contains_key(&catch_id))
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.positions.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every catch within `radius_meters` of the center, as a lazy ordered scan.
    pub fn scan(&self, center_lon: f64, center_lat: f64, radius_meters: f64) -> Result<GeoScan> {
        let center = GeoPoint::new(center_lon, center_lat)?;
        if !radius_meters.is_finite() || radius_meters < 0.0 {
            return Err(CoreError::InvalidInput(format!("radius must be a non-negative number, got {}", radius_meters)));
        }

        let grid = self.read()?;
        let mut hits = Vec::new();
        let mut visit = |members: &HashMap<CatchId, GeoPoint>| {
            for (id, point) in members {
                let distance = haversine_meters(center, *point);
                if distance <= radius_meters {
                    hits.push(GeoHit {
                        catch_id: *id,
                        distance_meters: distance,
                    });
                }
            }
        };
        match candidate_cells(center, radius_meters) {
            Some(cells) if cells.len() < grid.cells.len() => {
                for cell in &cells {
                    if let Some(members) = grid.cells.get(cell) {
                        visit(members);
                    }
                }
            }
            _ => grid.cells.values().for_each(&mut visit),
        }
        drop(grid);

        Ok(GeoScan::new(hits))
    }

    /// The first `limit` catches by ascending distance, ties broken by catch id.
    pub fn query(&self, center_lon: f64, center_lat: f64, radius_meters: f64, limit: usize) -> Result<Vec<GeoHit>> {
        Ok(self.scan(center_lon, center_lat, radius_meters)?.take(limit).collect())
    }

    /// Continues a query after the last hit of a previous page.
    pub fn query_after(
        &self,
        center_lon: f64,
        center_lat: f64,
        radius_meters: f64,
        after: Option<GeoCursor>,
        limit: usize,
    ) -> Result<Vec<GeoHit>> {
        let scan = self.scan(center_lon, center_lat, radius_meters)?;
        let scan = match after {
            Some(cursor) => scan.resume_after(cursor),
            None => scan,
        };
        Ok(scan.take(limit).collect())
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    fn point(lon: f64, lat: f64) -> GeoPoint {
        GeoPoint::new(lon, lat).unwrap()
    }

    #[test]
    fn haversine_is_symmetric() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let a = point(rng.gen_range(-180.0..=180.0), rng.gen_range(-90.0..=90.0));
            let b = point(rng.gen_range(-180.0..=180.0), rng.gen_range(-90.0..=90.0));
            assert_eq!(haversine_meters(a, b), haversine_meters(b, a));
        }
    }

    #[test]
    fn haversine_known_distance() {
        // Paris to London, roughly 343.5 km.
        let d = haversine_meters(point(2.3522, 48.8566), point(-0.1276, 51.5072));
        assert!((d - 343_500.0).abs() < 2_000.0, "got {}", d);
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        let index = GeoIndex::new();
        assert!(matches!(index.insert(CatchId::new(), 180.5, 0.0), Err(CoreError::InvalidLocation { .. })));
        assert!(matches!(index.insert(CatchId::new(), 0.0, -90.1), Err(CoreError::InvalidLocation { .. })));
        assert!(matches!(index.insert(CatchId::new(), f64::NAN, 0.0), Err(CoreError::InvalidLocation { .. })));
        assert!(index.is_empty().unwrap());
    }

    #[test]
    fn zero_radius_finds_exact_point() {
        let mut rng = StdRng::seed_from_u64(11);
        let index = GeoIndex::new();
        for _ in 0..200 {
            let lon = rng.gen_range(-180.0..=180.0);
            let lat = rng.gen_range(-90.0..=90.0);
            let id = CatchId::new();
            index.insert(id, lon, lat).unwrap();
            let hits = index.query(lon, lat, 0.0, 1).unwrap();
            assert_eq!(hits.first().map(|h| h.catch_id), Some(id), "at {}, {}", lon, lat);
        }
    }

    #[test]
    fn finds_across_the_antimeridian() {
        let index = GeoIndex::new();
        let east = CatchId::new();
        let west = CatchId::new();
        index.insert(east, 179.95, 10.0).unwrap();
        index.insert(west, -179.95, 10.0).unwrap();
        let hits = index.query(179.99, 10.0, 20_000.0, 10).unwrap();
        let ids: Vec<_> = hits.iter().map(|h| h.catch_id).collect();
        assert_eq!(ids, vec![east, west]);
    }

    #[test]
    fn finds_around_the_pole() {
        let index = GeoIndex::new();
        let a = CatchId::new();
        let b = CatchId::new();
        index.insert(a, 0.0, 89.9).unwrap();
        index.insert(b, 180.0, 89.9).unwrap();
        // The two points are about 22 km apart over the pole.
        let hits = index.query(90.0, 90.0, 12_000.0, 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn ties_break_on_catch_id() {
        let index = GeoIndex::new();
        let mut ids: Vec<CatchId> = (0..5).map(|_| CatchId::new()).collect();
        for id in &ids {
            index.insert(*id, -71.06, 42.36).unwrap();
        }
        ids.sort();
        let hits: Vec<_> = index.query(-71.0, 42.3, 50_000.0, 10).unwrap().into_iter().map(|h| h.catch_id).collect();
        assert_eq!(hits, ids);
    }

    #[test]
    fn scan_matches_brute_force() {
        let mut rng = StdRng::seed_from_u64(42);
        let index = GeoIndex::new();
        let mut points = Vec::new();
        for _ in 0..400 {
            let p = point(rng.gen_range(-10.0..10.0), rng.gen_range(40.0..55.0));
            let id = CatchId::new();
            index.insert(id, p.longitude, p.latitude).unwrap();
            points.push((id, p));
        }
        let center = point(1.0, 47.0);
        let radius = 400_000.0;
        let mut expected: Vec<GeoHit> = points
            .iter()
            .map(|(id, p)| GeoHit { catch_id: *id, distance_meters: haversine_meters(center, *p) })
            .filter(|h| h.distance_meters <= radius)
            .collect();
        expected.sort();
        let got: Vec<GeoHit> = index.scan(center.longitude, center.latitude, radius).unwrap().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn resumes_after_cursor_without_duplicates() {
        let index = GeoIndex::new();
        for i in 0..10 {
            index.insert(CatchId::new(), i as f64 * 0.01, 0.0).unwrap();
        }
        let first = index.query_after(0.0, 0.0, 100_000.0, None, 4).unwrap();
        let cursor = GeoCursor::from(*first.last().unwrap());

        // A closer catch arriving between pages must not shift the second page.
        index.insert(CatchId::new(), 0.0, 0.0).unwrap();

        let second = index.query_after(0.0, 0.0, 100_000.0, Some(cursor), 4).unwrap();
        assert_eq!(second.len(), 4);
        assert!(second.iter().all(|h| h.distance_meters > cursor.distance_meters));
        assert!(second.iter().all(|h| first.iter().all(|f| f.catch_id != h.catch_id)));
    }

    #[test]
    fn moving_and_removing() {
        let index = GeoIndex::new();
        let id = CatchId::new();
        index.insert(id, 10.0, 10.0).unwrap();
        index.insert(id, -20.0, -20.0).unwrap();
        assert_eq!(index.len().unwrap(), 1);
        assert!(index.query(10.0, 10.0, 1000.0, 10).unwrap().is_empty());
        assert!(index.remove(id).unwrap());
        assert!(!index.remove(id).unwrap());
        assert!(index.query(-20.0, -20.0, 1000.0, 10).unwrap().is_empty());
    }
}
