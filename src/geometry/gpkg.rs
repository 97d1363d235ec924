//! GeoPackage polygon reading: GeoPackage binary header, then WKB.

use std::path::Path;

use geo::{Coord, LineString, MultiPolygon, Polygon};
use geo_traits::{
    CoordTrait, GeometryTrait, GeometryType, LineStringTrait, MultiPolygonTrait, PolygonTrait,
};
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::{debug, warn};
use wkb::reader::read_wkb;

use crate::models::Crs;

/// Polygons of the first feature table plus its CRS when declared as EPSG
pub fn read_polygons(path: &Path) -> Result<(Vec<Polygon<f64>>, Option<Crs>, usize), String> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| e.to_string())?;

    let (table, column, srs_id): (String, String, i64) = conn
        .query_row(
            "SELECT table_name, column_name, srs_id FROM gpkg_geometry_columns ORDER BY table_name LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| format!("no feature table found: {}", e))?;

    debug!("Reading GeoPackage table '{}' column '{}'", table, column);

    let crs = conn
        .query_row(
            "SELECT organization, organization_coordsys_id FROM gpkg_spatial_ref_sys WHERE srs_id = ?1",
            [srs_id],
            |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
        )
        .optional()
        .map_err(|e| e.to_string())?
        .and_then(|(org, code)| {
            if org.eq_ignore_ascii_case("EPSG") && code > 0 {
                Some(Crs::from_wkid(code as u32))
            } else {
                None
            }
        });

    let sql = format!(
        "SELECT \"{}\" FROM \"{}\"",
        column.replace('"', "\"\""),
        table.replace('"', "\"\"")
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| e.to_string())?;
    let blobs = stmt
        .query_map([], |row| row.get::<_, Option<Vec<u8>>>(0))
        .map_err(|e| e.to_string())?;

    let mut polygons = Vec::new();
    let mut skipped = 0;
    for blob in blobs {
        let Some(blob) = blob.map_err(|e| e.to_string())? else {
            skipped += 1;
            continue;
        };
        match decode_gpkg_geometry(&blob) {
            Ok(Some(mp)) => polygons.extend(mp.0),
            Ok(None) => skipped += 1,
            Err(e) => {
                warn!("Skipping unreadable geometry in '{}': {}", table, e);
                skipped += 1;
            }
        }
    }

    Ok((polygons, crs, skipped))
}

/// Decode a GeoPackage geometry blob. Non-polygonal and empty geometries
/// yield `None`.
pub fn decode_gpkg_geometry(blob: &[u8]) -> Result<Option<MultiPolygon<f64>>, String> {
    if blob.len() < 8 || &blob[0..2] != b"GP" {
        return Err("missing GeoPackage header".to_string());
    }
    let flags = blob[3];
    let empty = flags & 0b0001_0000 != 0;
    let envelope_len = match (flags >> 1) & 0b111 {
        0 => 0,
        1 => 32,
        2 | 3 => 48,
        4 => 64,
        other => return Err(format!("invalid envelope indicator {}", other)),
    };
    if empty {
        return Ok(None);
    }

    let start = 8 + envelope_len;
    if blob.len() < start {
        return Err("truncated GeoPackage header".to_string());
    }

    let wkb = read_wkb(&blob[start..]).map_err(|e| e.to_string())?;
    let polygons: Vec<Polygon<f64>> = match wkb.as_type() {
        GeometryType::Polygon(p) => to_polygon(p).into_iter().collect(),
        GeometryType::MultiPolygon(mp) => mp.polygons().filter_map(|p| to_polygon(&p)).collect(),
        _ => return Ok(None),
    };

    Ok((!polygons.is_empty()).then(|| MultiPolygon::new(polygons)))
}

fn to_ring<L: LineStringTrait<T = f64>>(ring: &L) -> LineString<f64> {
    ring.coords().map(|c| Coord { x: c.x(), y: c.y() }).collect()
}

/// Z and M ordinates are dropped
fn to_polygon<P: PolygonTrait<T = f64>>(polygon: &P) -> Option<Polygon<f64>> {
    let exterior = to_ring(&polygon.exterior()?);
    if exterior.0.is_empty() {
        return None;
    }
    let interiors = polygon.interiors().map(|r| to_ring(&r)).collect();
    Some(Polygon::new(exterior, interiors))
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::Area;

    const WKB_POLYGON: u32 = 3;
    const WKB_MULTIPOLYGON: u32 = 6;

    fn wkb_square_le() -> Vec<u8> {
        let mut wkb = vec![1u8];
        wkb.extend(WKB_POLYGON.to_le_bytes());
        wkb.extend(1u32.to_le_bytes());
        wkb.extend(5u32.to_le_bytes());
        for (x, y) in [(0.0f64, 0.0f64), (2.0, 0.0), (2.0, 2.0), (0.0, 2.0), (0.0, 0.0)] {
            wkb.extend(x.to_le_bytes());
            wkb.extend(y.to_le_bytes());
        }
        wkb
    }

    fn gpkg_blob(wkb: &[u8], flags: u8, envelope: usize) -> Vec<u8> {
        let mut blob = vec![b'G', b'P', 0, flags];
        blob.extend(4326i32.to_le_bytes());
        blob.extend(vec![0u8; envelope]);
        blob.extend_from_slice(wkb);
        blob
    }

    #[test]
    fn test_decode_polygon_without_envelope() {
        let blob = gpkg_blob(&wkb_square_le(), 0b0000_0001, 0);
        let mp = decode_gpkg_geometry(&blob).unwrap().unwrap();
        assert_eq!(mp.unsigned_area(), 4.0);
    }

    #[test]
    fn test_decode_with_xy_envelope() {
        let blob = gpkg_blob(&wkb_square_le(), 0b0000_0011, 32);
        assert!(decode_gpkg_geometry(&blob).unwrap().is_some());
    }

    #[test]
    fn test_decode_big_endian_multipolygon() {
        let mut wkb = vec![0u8];
        wkb.extend(WKB_MULTIPOLYGON.to_be_bytes());
        wkb.extend(1u32.to_be_bytes());
        wkb.push(0);
        wkb.extend(WKB_POLYGON.to_be_bytes());
        wkb.extend(1u32.to_be_bytes());
        wkb.extend(4u32.to_be_bytes());
        for (x, y) in [(0.0f64, 0.0f64), (3.0, 0.0), (0.0, 3.0), (0.0, 0.0)] {
            wkb.extend(x.to_be_bytes());
            wkb.extend(y.to_be_bytes());
        }

        let mp = decode_gpkg_geometry(&gpkg_blob(&wkb, 0, 0)).unwrap().unwrap();
        assert_eq!(mp.0.len(), 1);
        assert_eq!(mp.unsigned_area(), 4.5);
    }

    #[test]
    fn test_point_is_skipped() {
        let mut wkb = vec![1u8];
        wkb.extend(1u32.to_le_bytes());
        wkb.extend(1.0f64.to_le_bytes());
        wkb.extend(2.0f64.to_le_bytes());
        assert_eq!(decode_gpkg_geometry(&gpkg_blob(&wkb, 1, 0)).unwrap(), None);
    }

    #[test]
    fn test_decode_polygon_z_drops_height() {
        let mut wkb = vec![1u8];
        wkb.extend(1003u32.to_le_bytes());
        wkb.extend(1u32.to_le_bytes());
        wkb.extend(4u32.to_le_bytes());
        for (x, y) in [(0.0f64, 0.0f64), (4.0, 0.0), (0.0, 4.0), (0.0, 0.0)] {
            wkb.extend(x.to_le_bytes());
            wkb.extend(y.to_le_bytes());
            wkb.extend(12.5f64.to_le_bytes());
        }

        let mp = decode_gpkg_geometry(&gpkg_blob(&wkb, 1, 0)).unwrap().unwrap();
        assert_eq!(mp.unsigned_area(), 8.0);
        assert_eq!(mp.0[0].exterior().0[1], Coord { x: 4.0, y: 0.0 });
    }

    #[test]
    fn test_truncated_wkb_is_an_error() {
        let wkb = wkb_square_le();
        let blob = gpkg_blob(&wkb[..wkb.len() - 8], 1, 0);
        assert!(decode_gpkg_geometry(&blob).is_err());
    }

    #[test]
    fn test_read_geopackage_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boundary.gpkg");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE gpkg_spatial_ref_sys (srs_name TEXT, srs_id INTEGER PRIMARY KEY, organization TEXT, organization_coordsys_id INTEGER, definition TEXT);
             INSERT INTO gpkg_spatial_ref_sys VALUES ('GDA94 / MGA zone 56', 28356, 'EPSG', 28356, '');
             CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT, geometry_type_name TEXT, srs_id INTEGER, z INTEGER, m INTEGER);
             INSERT INTO gpkg_geometry_columns VALUES ('lga', 'geom', 'POLYGON', 28356, 0, 0);
             CREATE TABLE lga (fid INTEGER PRIMARY KEY, geom BLOB);",
        )
        .unwrap();
        conn.execute(
            "INSERT INTO lga (geom) VALUES (?1)",
            [gpkg_blob(&wkb_square_le(), 1, 0)],
        )
        .unwrap();
        drop(conn);

        let (polygons, crs, skipped) = read_polygons(&path).unwrap();
        assert_eq!(polygons.len(), 1);
        assert_eq!(crs, Some(Crs(28356)));
        assert_eq!(skipped, 0);
    }
}
