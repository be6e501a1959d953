//! OWS/WMS request normalisation and rendering for a single map.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use crate::error::WarpError;
use crate::services::geotransform::{BoundingBox, TileCoord, TILE_SIZE};
use crate::services::maps::MapRecord;
use crate::services::tools::{ImageFormat, RasterTools, RenderRequest};

/// Parameters passed through to the renderer; anything else is dropped.
pub const RECOGNISED_PARAMS: [&str; 9] = [
    "REQUEST",
    "VERSION",
    "TRANSPARENCY",
    "SERVICE",
    "SRS",
    "WIDTH",
    "HEIGHT",
    "BBOX",
    "FORMAT",
];

pub const WMS_VERSION: &str = "1.1.1";
pub const LAYER_NAME: &str = "image";
pub const TILE_SRS: &str = "EPSG:900913";
const MAX_IMAGE_SIZE: u32 = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusFilter {
    Warped,
    Unwarped,
}

impl StatusFilter {
    pub fn from_param(value: Option<&str>) -> Self {
        match value {
            Some(v) if v.trim().eq_ignore_ascii_case("warped") => StatusFilter::Warped,
            _ => StatusFilter::Unwarped,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OwsRequest {
    params: BTreeMap<String, String>,
}

impl OwsRequest {
    /// Normalises names to upper case, keeps the recognised ones and pins the
    /// protocol version, styles and layer identifiers.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut params = BTreeMap::new();
        for (key, value) in pairs {
            let key = key.as_ref().trim().to_ascii_uppercase();
            if RECOGNISED_PARAMS.contains(&key.as_str()) {
                params.insert(key, value.as_ref().to_string());
            }
        }
        params.insert("VERSION".to_string(), WMS_VERSION.to_string());
        params.insert("STYLES".to_string(), String::new());
        params.insert("LAYERS".to_string(), LAYER_NAME.to_string());
        params.insert("COVERAGE".to_string(), LAYER_NAME.to_string());
        Self { params }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    fn required(&self, key: &str) -> Result<&str, WarpError> {
        self.get(key)
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| WarpError::invalid(format!("missing WMS parameter {key}")))
    }

    fn dimension(&self, key: &str) -> Result<u32, WarpError> {
        let raw = self.required(key)?;
        let value: u32 = raw
            .parse()
            .map_err(|_| WarpError::invalid(format!("invalid {key}: {raw}")))?;
        if value == 0 || value > MAX_IMAGE_SIZE {
            return Err(WarpError::invalid(format!(
                "{key} must be between 1 and {MAX_IMAGE_SIZE}"
            )));
        }
        Ok(value)
    }

    pub fn query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.params.iter())
            .finish()
    }
}

/// Turns a Google/OSM tile address into a 256x256 PNG GetMap request over
/// spherical Mercator.
pub fn tile_to_query(x: u32, y: u32, z: u32) -> Result<OwsRequest, WarpError> {
    let bbox = TileCoord::new(z, x, y)?.mercator_bounds();
    let size = TILE_SIZE.to_string();
    Ok(OwsRequest::from_pairs([
        ("bbox", bbox.to_param()),
        ("format", "image/png".to_string()),
        ("service", "WMS".to_string()),
        ("request", "GetMap".to_string()),
        ("srs", TILE_SRS.to_string()),
        ("width", size.clone()),
        ("height", size),
    ]))
}

#[derive(Debug, Clone, PartialEq)]
pub struct WmsResponse {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

type CacheKey = (Uuid, i64, StatusFilter, String);

struct ResponseCache {
    capacity: usize,
    order: VecDeque<CacheKey>,
    entries: HashMap<CacheKey, WmsResponse>,
}

impl ResponseCache {
    fn get(&self, key: &CacheKey) -> Option<WmsResponse> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: CacheKey, value: WmsResponse) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(key, value);
    }
}

#[derive(Clone)]
pub struct WmsDispatcher {
    tools: Arc<dyn RasterTools>,
    work_dir: PathBuf,
    cache: Arc<Mutex<ResponseCache>>,
}

impl WmsDispatcher {
    pub fn new(tools: Arc<dyn RasterTools>, work_dir: PathBuf, cache_entries: usize) -> Self {
        Self {
            tools,
            work_dir,
            cache: Arc::new(Mutex::new(ResponseCache {
                capacity: cache_entries,
                order: VecDeque::new(),
                entries: HashMap::new(),
            })),
        }
    }

    fn cache_lock(&self) -> MutexGuard<'_, ResponseCache> {
        match self.cache.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::warn!("Recovering WMS cache from poisoned lock");
                poisoned.into_inner()
            }
        }
    }

    pub async fn dispatch(
        &self,
        map: &MapRecord,
        ows: &OwsRequest,
        filter: StatusFilter,
    ) -> Result<WmsResponse, WarpError> {
        if let Some(service) = ows.get("SERVICE").map(str::trim) {
            if !service.is_empty() && !service.eq_ignore_ascii_case("WMS") {
                return Err(WarpError::invalid(format!("unsupported SERVICE: {service}")));
            }
        }
        let request = ows.required("REQUEST")?;
        if request.eq_ignore_ascii_case("GetCapabilities") {
            return Ok(WmsResponse {
                bytes: capabilities_xml(map, filter).into_bytes(),
                content_type: "application/vnd.ogc.wms_xml",
            });
        }
        if !request.eq_ignore_ascii_case("GetMap") {
            return Err(WarpError::invalid(format!("unsupported REQUEST: {request}")));
        }

        let key: CacheKey = (map.id, map.revision, filter, ows.query_string());
        let cached = self.cache_lock().get(&key);
        if let Some(hit) = cached {
            return Ok(hit);
        }

        let render = self.render_request(map, ows, filter)?;
        let bytes = self.tools.render(&render).await?;
        let response = WmsResponse {
            bytes,
            content_type: render.format.mime(),
        };
        self.cache_lock().insert(key, response.clone());
        Ok(response)
    }

    pub async fn tile(&self, map: &MapRecord, x: u32, y: u32, z: u32) -> Result<WmsResponse, WarpError> {
        let query = tile_to_query(x, y, z)?;
        self.dispatch(map, &query, StatusFilter::Warped).await
    }

    fn render_request(
        &self,
        map: &MapRecord,
        ows: &OwsRequest,
        filter: StatusFilter,
    ) -> Result<RenderRequest, WarpError> {
        let width = ows.dimension("WIDTH")?;
        let height = ows.dimension("HEIGHT")?;
        let mut bbox = BoundingBox::parse_param(ows.required("BBOX")?)?;
        let format = ImageFormat::from_mime(ows.get("FORMAT"));
        let transparent = ows
            .get("TRANSPARENCY")
            .map(|v| !v.trim().eq_ignore_ascii_case("false"))
            .unwrap_or(true);
        let srs = ows
            .get("SRS")
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or("EPSG:4326")
            .to_string();

        let (source, georeferenced) = match filter {
            StatusFilter::Warped => {
                let warped = map
                    .warped
                    .as_ref()
                    .filter(|_| map.status.has_bbox())
                    .ok_or(WarpError::Unavailable { status: map.status })?;
                (warped.raster.clone(), true)
            }
            StatusFilter::Unwarped => {
                let upload = map
                    .upload
                    .as_ref()
                    .filter(|_| map.status.is_ready())
                    .ok_or(WarpError::Unavailable { status: map.status })?;
                // Viewers address unwarped rasters with y growing upward from the top edge.
                if bbox.max_y <= 0.0 {
                    bbox = BoundingBox::new(bbox.min_x, -bbox.max_y, bbox.max_x, -bbox.min_y);
                }
                (upload.path.clone(), false)
            }
        };

        Ok(RenderRequest {
            source,
            georeferenced,
            srs,
            bbox,
            width,
            height,
            format,
            transparent,
            work_dir: self.work_dir.clone(),
        })
    }
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn capabilities_xml(map: &MapRecord, filter: StatusFilter) -> String {
    let extent = match filter {
        StatusFilter::Warped => map.bbox.map(|b| b.bbox),
        StatusFilter::Unwarped => map.upload.as_ref().map(|u| {
            BoundingBox::new(0.0, -f64::from(u.height), f64::from(u.width), 0.0)
        }),
    };
    let bbox_xml = extent
        .map(|b| {
            format!(
                r#"<LatLonBoundingBox minx="{}" miny="{}" maxx="{}" maxy="{}"/>"#,
                b.min_x, b.min_y, b.max_x, b.max_y
            )
        })
        .unwrap_or_default();
    let title = xml_escape(&map.title);
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<WMT_MS_Capabilities version="{WMS_VERSION}">
  <Service>
    <Name>OGC:WMS</Name>
    <Title>{title}</Title>
  </Service>
  <Capability>
    <Request>
      <GetCapabilities><Format>application/vnd.ogc.wms_xml</Format></GetCapabilities>
      <GetMap><Format>image/png</Format><Format>image/jpeg</Format></GetMap>
    </Request>
    <Layer>
      <Title>{title}</Title>
      <SRS>EPSG:4326</SRS>
      <SRS>EPSG:900913</SRS>
      <SRS>EPSG:3857</SRS>
      <Layer queryable="0" opaque="0">
        <Name>{LAYER_NAME}</Name>
        <Title>{title}</Title>
        {bbox_xml}
      </Layer>
    </Layer>
  </Capability>
</WMT_MS_Capabilities>
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::lifecycle::MapStatus;
    use crate::test_support::{register_map, test_state, warp_map};
    use std::sync::atomic::Ordering;

    #[test]
    fn params_are_normalised_and_pinned() {
        let ows = OwsRequest::from_pairs([
            ("request", "GetMap"),
            ("VeRsIoN", "1.3.0"),
            ("styles", "fancy"),
            ("layers", "other"),
            ("bogus", "1"),
            ("Bbox", "0,0,1,1"),
        ]);
        assert_eq!(ows.get("REQUEST"), Some("GetMap"));
        assert_eq!(ows.get("VERSION"), Some("1.1.1"));
        assert_eq!(ows.get("STYLES"), Some(""));
        assert_eq!(ows.get("LAYERS"), Some("image"));
        assert_eq!(ows.get("COVERAGE"), Some("image"));
        assert_eq!(ows.get("BBOX"), Some("0,0,1,1"));
        assert_eq!(ows.get("BOGUS"), None);
    }

    #[test]
    fn status_filter_defaults_to_unwarped() {
        assert_eq!(StatusFilter::from_param(Some("WARPED")), StatusFilter::Warped);
        assert_eq!(StatusFilter::from_param(Some("unwarped")), StatusFilter::Unwarped);
        assert_eq!(StatusFilter::from_param(None), StatusFilter::Unwarped);
    }

    #[test]
    fn origin_tile_query_covers_the_world() {
        let query = tile_to_query(0, 0, 0).unwrap();
        let bbox = BoundingBox::parse_param(query.get("BBOX").unwrap()).unwrap();
        for (actual, expected) in [
            (bbox.min_x, -20_037_508.34),
            (bbox.min_y, -20_037_508.34),
            (bbox.max_x, 20_037_508.34),
            (bbox.max_y, 20_037_508.34),
        ] {
            assert!((actual - expected).abs() < 1e-2);
        }
        assert_eq!(query.get("SRS"), Some("EPSG:900913"));
        assert_eq!(query.get("WIDTH"), Some("256"));
        assert_eq!(query.get("FORMAT"), Some("image/png"));
        assert_eq!(query.get("REQUEST"), Some("GetMap"));
        assert!(tile_to_query(1, 0, 0).is_err());
    }

    #[tokio::test]
    async fn tiles_require_a_warped_raster() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        let record = state.maps.get(map_id).unwrap();
        assert!(matches!(
            state.wms.tile(&record, 0, 0, 0).await,
            Err(WarpError::Unavailable {
                status: MapStatus::Available
            })
        ));

        warp_map(&state, map_id).await;
        let record = state.maps.get(map_id).unwrap();
        let tile = state.wms.tile(&record, 0, 0, 0).await.unwrap();
        assert_eq!(tile.content_type, "image/png");
        assert!(!tile.bytes.is_empty());
    }

    #[tokio::test]
    async fn unwarped_requests_flip_negative_pixel_boxes() {
        let (state, tools) = test_state();
        let map_id = register_map(&state);
        let record = state.maps.get(map_id).unwrap();
        let ows = OwsRequest::from_pairs([
            ("REQUEST", "GetMap"),
            ("BBOX", "0,-400,500,0"),
            ("WIDTH", "100"),
            ("HEIGHT", "80"),
            ("FORMAT", "image/jpeg"),
        ]);
        let response = state
            .wms
            .dispatch(&record, &ows, StatusFilter::Unwarped)
            .await
            .unwrap();
        assert_eq!(response.content_type, "image/jpeg");
        let rendered = tools.last_render().unwrap();
        assert!(!rendered.georeferenced);
        assert_eq!(rendered.bbox, BoundingBox::new(0.0, 0.0, 500.0, 400.0));
    }

    #[tokio::test]
    async fn responses_are_cached_until_the_map_changes() {
        let (state, tools) = test_state();
        let map_id = register_map(&state);
        warp_map(&state, map_id).await;
        let record = state.maps.get(map_id).unwrap();

        state.wms.tile(&record, 0, 0, 0).await.unwrap();
        state.wms.tile(&record, 0, 0, 0).await.unwrap();
        assert_eq!(tools.render_calls.load(Ordering::SeqCst), 1);

        state
            .maps
            .update(map_id, |record| {
                record.title = "renamed".to_string();
                Ok(())
            })
            .unwrap();
        let record = state.maps.get(map_id).unwrap();
        state.wms.tile(&record, 0, 0, 0).await.unwrap();
        assert_eq!(tools.render_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn capabilities_describe_the_image_layer() {
        let (state, _tools) = test_state();
        let map_id = register_map(&state);
        let record = state.maps.get(map_id).unwrap();
        let ows = OwsRequest::from_pairs([("request", "GetCapabilities"), ("service", "wms")]);
        let response = state
            .wms
            .dispatch(&record, &ows, StatusFilter::Unwarped)
            .await
            .unwrap();
        let xml = String::from_utf8(response.bytes).unwrap();
        assert!(xml.contains("<Name>image</Name>"));
        assert!(xml.contains(r#"version="1.1.1""#));

        let bad = OwsRequest::from_pairs([("request", "GetMap"), ("service", "WFS")]);
        assert!(state
            .wms
            .dispatch(&record, &bad, StatusFilter::Unwarped)
            .await
            .is_err());
    }

    #[test]
    fn cache_evicts_oldest_entries() {
        let mut cache = ResponseCache {
            capacity: 2,
            order: VecDeque::new(),
            entries: HashMap::new(),
        };
        let response = WmsResponse {
            bytes: vec![1],
            content_type: "image/png",
        };
        let key = |n: i64| (Uuid::nil(), n, StatusFilter::Warped, String::new());
        cache.insert(key(1), response.clone());
        cache.insert(key(2), response.clone());
        cache.insert(key(3), response);
        assert!(cache.get(&key(1)).is_none());
        assert!(cache.get(&key(2)).is_some());
        assert!(cache.get(&key(3)).is_some());
    }
}
