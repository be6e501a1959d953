use anyhow::{Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::time::Duration;
use uuid::Uuid;

use crate::error::WarpError;
use crate::services::geotransform::{BoundingBox, ControlPair, FitKind, PolynomialFit};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum GcpKind {
    /// Confirmed by a user.
    #[default]
    Hard,
    /// Suggested automatically.
    Soft,
}

impl GcpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            GcpKind::Hard => "hard",
            GcpKind::Soft => "soft",
        }
    }

    pub fn from_db(value: &str) -> Self {
        if value.eq_ignore_ascii_case("soft") {
            GcpKind::Soft
        } else {
            GcpKind::Hard
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct Gcp {
    pub id: Uuid,
    pub pixel_x: f64,
    pub pixel_y: f64,
    pub geo_x: f64,
    pub geo_y: f64,
    pub kind: GcpKind,
}

impl Gcp {
    fn pair(&self) -> ControlPair {
        ControlPair {
            pixel: [self.pixel_x, self.pixel_y],
            geo: [self.geo_x, self.geo_y],
        }
    }
}

#[derive(Debug, Clone, Deserialize, utoipa::ToSchema)]
pub struct GcpDraft {
    pub pixel_x: f64,
    pub pixel_y: f64,
    pub geo_x: f64,
    pub geo_y: f64,
    #[serde(default)]
    pub kind: Option<GcpKind>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct GcpWithError {
    #[serde(flatten)]
    pub gcp: Gcp,
    /// Distance between the observed and fitted geo coordinate. `None` when
    /// the hard points cannot be fitted. Under a thin plate spline hard points
    /// score zero and soft points are always `None`.
    pub error: Option<f64>,
}

#[derive(Debug, Clone, Serialize, utoipa::ToSchema)]
pub struct ResidualReport {
    pub fit: String,
    pub items: Vec<GcpWithError>,
    pub rms: Option<f64>,
}

/// Polynomial order used when the map asks for `auto`.
pub fn auto_order(hard_count: usize) -> u8 {
    if hard_count < 6 {
        1
    } else if hard_count < 10 {
        2
    } else {
        3
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GcpStore {
    points: Vec<Gcp>,
}

impl GcpStore {
    pub fn from_points(points: Vec<Gcp>) -> Self {
        Self { points }
    }

    pub fn points(&self) -> &[Gcp] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn hard_count(&self) -> usize {
        self.points.iter().filter(|p| p.kind == GcpKind::Hard).count()
    }

    pub fn hard_points(&self) -> impl Iterator<Item = &Gcp> {
        self.points.iter().filter(|p| p.kind == GcpKind::Hard)
    }

    /// Inserts a new point, or replaces the point with `id` in place.
    pub fn add_or_update(
        &mut self,
        id: Option<Uuid>,
        draft: &GcpDraft,
        width: u32,
        height: u32,
    ) -> Result<Gcp, WarpError> {
        let coords = [draft.pixel_x, draft.pixel_y, draft.geo_x, draft.geo_y];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(WarpError::invalid("control point coordinates must be finite"));
        }
        if draft.pixel_x < 0.0
            || draft.pixel_y < 0.0
            || draft.pixel_x > f64::from(width)
            || draft.pixel_y > f64::from(height)
        {
            return Err(WarpError::invalid(format!(
                "pixel ({}, {}) lies outside the {width}x{height} raster",
                draft.pixel_x, draft.pixel_y
            )));
        }

        match id {
            Some(id) => {
                let existing = self
                    .points
                    .iter_mut()
                    .find(|p| p.id == id)
                    .ok_or_else(|| WarpError::not_found(format!("gcp {id}")))?;
                existing.pixel_x = draft.pixel_x;
                existing.pixel_y = draft.pixel_y;
                existing.geo_x = draft.geo_x;
                existing.geo_y = draft.geo_y;
                if let Some(kind) = draft.kind {
                    existing.kind = kind;
                }
                Ok(existing.clone())
            }
            None => {
                let gcp = Gcp {
                    id: Uuid::new_v4(),
                    pixel_x: draft.pixel_x,
                    pixel_y: draft.pixel_y,
                    geo_x: draft.geo_x,
                    geo_y: draft.geo_y,
                    kind: draft.kind.unwrap_or_default(),
                };
                self.points.push(gcp.clone());
                Ok(gcp)
            }
        }
    }

    pub fn remove(&mut self, id: Uuid) -> Result<Gcp, WarpError> {
        let index = self
            .points
            .iter()
            .position(|p| p.id == id)
            .ok_or_else(|| WarpError::not_found(format!("gcp {id}")))?;
        Ok(self.points.remove(index))
    }

    pub fn clear(&mut self) {
        self.points.clear();
    }

    pub fn replace_all(&mut self, points: Vec<Gcp>) {
        self.points = points;
    }

    pub fn extend(&mut self, points: Vec<Gcp>) {
        self.points.extend(points);
    }

    /// Scores each point against a fit of the hard points. Display only.
    pub fn with_residual_error(&self, fit: FitKind, include_soft: bool) -> ResidualReport {
        let visible: Vec<&Gcp> = self
            .points
            .iter()
            .filter(|p| include_soft || p.kind == GcpKind::Hard)
            .collect();

        let (label, items): (String, Vec<GcpWithError>) = match fit {
            FitKind::ThinPlateSpline => {
                // The spline passes through every hard point.
                let items = visible
                    .into_iter()
                    .map(|gcp| GcpWithError {
                        error: (gcp.kind == GcpKind::Hard).then_some(0.0),
                        gcp: gcp.clone(),
                    })
                    .collect();
                ("tps".to_string(), items)
            }
            FitKind::Polynomial(order) => {
                let pairs: Vec<ControlPair> = self.hard_points().map(Gcp::pair).collect();
                let fitted = PolynomialFit::fit(order, &pairs);
                let items = visible
                    .into_iter()
                    .map(|gcp| GcpWithError {
                        error: fitted.as_ref().map(|f| {
                            let [x, y] = f.evaluate([gcp.pixel_x, gcp.pixel_y]);
                            (x - gcp.geo_x).hypot(y - gcp.geo_y)
                        }),
                        gcp: gcp.clone(),
                    })
                    .collect();
                (format!("p{order}"), items)
            }
        };

        let errors: Vec<f64> = items.iter().filter_map(|i| i.error).collect();
        let rms = (!errors.is_empty())
            .then(|| (errors.iter().map(|e| e * e).sum::<f64>() / errors.len() as f64).sqrt());

        ResidualReport {
            fit: label,
            items,
            rms,
        }
    }
}

/// Soft points pinning the raster corners and centre onto `extent`.
pub fn placements_for_extent(extent: &BoundingBox, width: u32, height: u32) -> Vec<Gcp> {
    let w = f64::from(width);
    let h = f64::from(height);
    let corners = [
        (0.0, 0.0, extent.min_x, extent.max_y),
        (w, 0.0, extent.max_x, extent.max_y),
        (0.0, h, extent.min_x, extent.min_y),
        (w, h, extent.max_x, extent.min_y),
        (
            w / 2.0,
            h / 2.0,
            (extent.min_x + extent.max_x) / 2.0,
            (extent.min_y + extent.max_y) / 2.0,
        ),
    ];
    corners
        .into_iter()
        .map(|(pixel_x, pixel_y, geo_x, geo_y)| Gcp {
            id: Uuid::new_v4(),
            pixel_x,
            pixel_y,
            geo_x,
            geo_y,
            kind: GcpKind::Soft,
        })
        .collect()
}

/// Reads the first result of a Nominatim-style search response as a WGS84 box.
pub fn parse_nominatim(body: &JsonValue) -> Option<BoundingBox> {
    let first = body.as_array()?.first()?;
    if let Some(raw) = first.get("boundingbox").and_then(JsonValue::as_array) {
        let values: Option<Vec<f64>> = raw
            .iter()
            .map(|v| match v {
                JsonValue::String(s) => s.trim().parse().ok(),
                other => other.as_f64(),
            })
            .collect();
        if let Some(&[south, north, west, east]) = values.as_deref() {
            let bbox = BoundingBox::new(west, south, east, north);
            if bbox.is_valid() {
                return Some(bbox);
            }
        }
    }

    let coord = |key: &str| -> Option<f64> {
        match first.get(key)? {
            JsonValue::String(s) => s.trim().parse().ok(),
            other => other.as_f64(),
        }
    };
    let (lat, lon) = (coord("lat")?, coord("lon")?);
    let pad = 0.05;
    Some(BoundingBox::new(lon - pad, lat - pad, lon + pad, lat + pad))
}

async fn geocode(http: &Client, geocoder_url: &str, query: &str) -> Result<Option<BoundingBox>> {
    let url = url::Url::parse_with_params(
        geocoder_url,
        &[("q", query), ("format", "json"), ("limit", "1")],
    )
    .context("invalid geocoder url")?;
    let body = http
        .get(url)
        .timeout(Duration::from_secs(10))
        .send()
        .await?
        .error_for_status()?
        .json::<JsonValue>()
        .await?;
    Ok(parse_nominatim(&body))
}

/// Best-effort soft points from geocoding the map's title and description.
/// Never fails; problems are logged and yield an empty list.
pub async fn suggest_initial_placements(
    http: &Client,
    geocoder_url: Option<&str>,
    gcps: &GcpStore,
    title: &str,
    description: Option<&str>,
    width: u32,
    height: u32,
) -> Vec<Gcp> {
    if gcps.hard_count() > 0 {
        return Vec::new();
    }
    let Some(geocoder_url) = geocoder_url else {
        return Vec::new();
    };
    let query = [Some(title), description]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    if query.is_empty() {
        return Vec::new();
    }

    match geocode(http, geocoder_url, &query).await {
        Ok(Some(extent)) => placements_for_extent(&extent, width, height),
        Ok(None) => Vec::new(),
        Err(err) => {
            tracing::warn!(error = %err, query = %query, "geocoding for gcp suggestions failed");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn draft(px: f64, py: f64, gx: f64, gy: f64) -> GcpDraft {
        GcpDraft {
            pixel_x: px,
            pixel_y: py,
            geo_x: gx,
            geo_y: gy,
            kind: None,
        }
    }

    #[test]
    fn add_validates_pixel_bounds() {
        let mut store = GcpStore::default();
        assert!(store.add_or_update(None, &draft(10.0, 10.0, 1.0, 2.0), 100, 100).is_ok());
        assert!(store.add_or_update(None, &draft(100.0, 100.0, 1.0, 2.0), 100, 100).is_ok());
        assert!(matches!(
            store.add_or_update(None, &draft(101.0, 5.0, 1.0, 2.0), 100, 100),
            Err(WarpError::InvalidInput(_))
        ));
        assert!(store.add_or_update(None, &draft(-1.0, 5.0, 1.0, 2.0), 100, 100).is_err());
        assert!(store.add_or_update(None, &draft(5.0, 5.0, f64::NAN, 2.0), 100, 100).is_err());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn update_and_remove_by_id() {
        let mut store = GcpStore::default();
        let gcp = store.add_or_update(None, &draft(1.0, 1.0, 1.0, 1.0), 10, 10).unwrap();
        let mut soft = draft(2.0, 2.0, 3.0, 3.0);
        soft.kind = Some(GcpKind::Soft);
        let updated = store.add_or_update(Some(gcp.id), &soft, 10, 10).unwrap();
        assert_eq!(updated.id, gcp.id);
        assert_eq!(updated.kind, GcpKind::Soft);
        assert_eq!(store.hard_count(), 0);

        assert!(matches!(
            store.add_or_update(Some(Uuid::new_v4()), &soft, 10, 10),
            Err(WarpError::NotFound(_))
        ));
        store.remove(gcp.id).unwrap();
        assert!(store.is_empty());
        assert!(store.remove(gcp.id).is_err());
    }

    #[test]
    fn residuals_measure_distance_from_fit() {
        let mut store = GcpStore::default();
        for (px, py) in [(0.0, 0.0), (100.0, 0.0), (0.0, 100.0), (100.0, 100.0)] {
            store
                .add_or_update(None, &draft(px, py, px / 10.0, -py / 10.0), 100, 100)
                .unwrap();
        }
        let report = store.with_residual_error(FitKind::Polynomial(1), false);
        assert_eq!(report.fit, "p1");
        assert_eq!(report.items.len(), 4);
        for item in &report.items {
            assert!(item.error.unwrap() < 1e-9);
        }
        assert!(report.rms.unwrap() < 1e-9);

        // An outlier pulls the fit and gets the largest residual.
        store.add_or_update(None, &draft(50.0, 50.0, 9.0, -5.0), 100, 100).unwrap();
        let report = store.with_residual_error(FitKind::Polynomial(1), false);
        let worst = report
            .items
            .iter()
            .max_by(|a, b| a.error.partial_cmp(&b.error).unwrap())
            .unwrap();
        assert_eq!(worst.gcp.pixel_x, 50.0);
    }

    #[test]
    fn residuals_are_empty_when_fit_is_underdetermined() {
        let mut store = GcpStore::default();
        store.add_or_update(None, &draft(0.0, 0.0, 0.0, 0.0), 10, 10).unwrap();
        store.add_or_update(None, &draft(5.0, 5.0, 1.0, 1.0), 10, 10).unwrap();
        let report = store.with_residual_error(FitKind::Polynomial(1), true);
        assert!(report.items.iter().all(|i| i.error.is_none()));
        assert!(report.rms.is_none());

        let tps = store.with_residual_error(FitKind::ThinPlateSpline, true);
        assert!(tps.items.iter().all(|i| i.error == Some(0.0)));
    }

    #[test]
    fn spline_residuals_score_only_hard_points() {
        let mut store = GcpStore::default();
        for (px, py) in [(0.0, 0.0), (100.0, 0.0), (0.0, 100.0)] {
            store
                .add_or_update(None, &draft(px, py, px / 10.0, -py / 10.0), 100, 100)
                .unwrap();
        }
        let mut soft = draft(50.0, 50.0, 5.0, -5.0);
        soft.kind = Some(GcpKind::Soft);
        store.add_or_update(None, &soft, 100, 100).unwrap();

        let report = store.with_residual_error(FitKind::ThinPlateSpline, true);
        assert_eq!(report.fit, "tps");
        assert_eq!(report.items.len(), 4);
        for item in &report.items {
            match item.gcp.kind {
                GcpKind::Hard => assert_eq!(item.error, Some(0.0)),
                GcpKind::Soft => assert_eq!(item.error, None),
            }
        }
        assert_eq!(report.rms, Some(0.0));

        // A polynomial fit of the same points does score the soft one.
        let poly = store.with_residual_error(FitKind::Polynomial(1), true);
        assert!(poly.items.iter().all(|i| i.error.is_some()));
    }

    #[test]
    fn auto_order_grows_with_hard_points() {
        assert_eq!(auto_order(3), 1);
        assert_eq!(auto_order(6), 2);
        assert_eq!(auto_order(12), 3);
    }

    #[test]
    fn nominatim_bounding_box_becomes_soft_corners() {
        let body = json!([{
            "boundingbox": ["51.28", "51.69", "-0.51", "0.33"],
            "lat": "51.5",
            "lon": "-0.1"
        }]);
        let extent = parse_nominatim(&body).unwrap();
        assert_eq!(extent, BoundingBox::new(-0.51, 51.28, 0.33, 51.69));

        let gcps = placements_for_extent(&extent, 2000, 1000);
        assert_eq!(gcps.len(), 5);
        assert!(gcps.iter().all(|g| g.kind == GcpKind::Soft));
        assert_eq!((gcps[0].geo_x, gcps[0].geo_y), (-0.51, 51.69));
        assert_eq!((gcps[3].pixel_x, gcps[3].pixel_y), (2000.0, 1000.0));

        assert!(parse_nominatim(&json!([])).is_none());
        let point_only = parse_nominatim(&json!([{ "lat": 10.0, "lon": 20.0 }])).unwrap();
        assert!(point_only.is_valid());
    }

    #[tokio::test]
    async fn suggestions_are_skipped_without_geocoder_or_with_hard_points() {
        let http = Client::new();
        let mut store = GcpStore::default();
        assert!(suggest_initial_placements(&http, None, &store, "London", None, 10, 10)
            .await
            .is_empty());

        store.add_or_update(None, &draft(1.0, 1.0, 1.0, 1.0), 10, 10).unwrap();
        let suggestions = suggest_initial_placements(
            &http,
            Some("http://127.0.0.1:9/search"),
            &store,
            "London",
            None,
            10,
            10,
        )
        .await;
        assert!(suggestions.is_empty());
    }

    #[tokio::test]
    async fn geocoder_failures_are_swallowed() {
        let http = Client::new();
        let store = GcpStore::default();
        let suggestions = suggest_initial_placements(
            &http,
            Some("http://127.0.0.1:9/search"),
            &store,
            "Nowhere",
            Some("1850 survey"),
            10,
            10,
        )
        .await;
        assert!(suggestions.is_empty());
    }
}
