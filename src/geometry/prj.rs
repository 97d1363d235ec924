//! CRS detection from ESRI/OGC WKT (`.prj` sidecar files).

use std::sync::OnceLock;

use regex::Regex;

use crate::models::Crs;

fn authority_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"AUTHORITY\s*\[\s*"EPSG"\s*,\s*"?(\d+)"?\s*\]"#).unwrap())
}

fn mga_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)MGA[_ ]*(?:zone[_ ]*)?(\d{2})").unwrap())
}

fn utm_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)UTM[_ ]*zone[_ ]*(\d{1,2})\s*([NS])").unwrap())
}

/// Best-effort CRS from WKT text.
///
/// The outermost `AUTHORITY["EPSG", ...]` wins (WKT1 places it last).
/// ESRI-flavoured WKT carries no authority, so well-known names are matched.
pub fn crs_from_wkt(wkt: &str) -> Option<Crs> {
    if let Some(code) = authority_regex()
        .captures_iter(wkt)
        .last()
        .and_then(|c| c[1].parse::<u32>().ok())
    {
        return Some(Crs::from_wkid(code));
    }

    let upper = wkt.to_ascii_uppercase();
    let projected = upper.trim_start().starts_with("PROJCS") || upper.contains("PROJCRS");

    if projected {
        if upper.contains("MERCATOR_AUXILIARY_SPHERE")
            || upper.contains("PSEUDO-MERCATOR")
            || upper.contains("PSEUDO_MERCATOR")
            || upper.contains("WEB_MERCATOR")
        {
            return Some(Crs(3857));
        }

        if let Some(zone) = mga_regex()
            .captures(&upper)
            .and_then(|c| c[1].parse::<u32>().ok())
        {
            let base = if upper.contains("GDA2020") { 7800 } else { 28300 };
            return Some(Crs(base + zone));
        }

        if upper.contains("WGS") {
            if let Some(caps) = utm_regex().captures(&upper) {
                let zone: u32 = caps[1].parse().ok()?;
                let base = if &caps[2] == "S" { 32700 } else { 32600 };
                return Some(Crs(base + zone));
            }
        }

        return None;
    }

    if upper.contains("GDA2020") {
        Some(Crs(7844))
    } else if upper.contains("GDA94") || upper.contains("GDA_1994") {
        Some(Crs(4283))
    } else if upper.contains("NAD83") || upper.contains("NORTH_AMERICAN_1983") {
        Some(Crs(4269))
    } else if upper.contains("ETRS89") || upper.contains("ETRS_1989") {
        Some(Crs(4258))
    } else if upper.contains("WGS_1984") || upper.contains("WGS 84") || upper.contains("WGS84") {
        Some(Crs(4326))
    } else {
        None
    }
}
