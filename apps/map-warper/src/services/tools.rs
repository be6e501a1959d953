//! Raster operations backed by the GDAL command line tools.

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value as JsonValue;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WarpError;
use crate::services::gcps::Gcp;
use crate::services::geotransform::BoundingBox;
use crate::services::rectify::{ResampleSpec, TransformSpec};

/// Value burned into the RGB bands outside the mask polygon; the warp treats
/// it as nodata.
pub const MASK_BURN_VALUE: u8 = 17;
pub const WARP_TARGET_SRS: &str = "EPSG:4326";

#[derive(Debug, Clone)]
pub struct WarpRequest {
    pub map_id: Uuid,
    pub source: PathBuf,
    pub gcps: Vec<Gcp>,
    pub srs: String,
    pub transform: TransformSpec,
    pub resample: ResampleSpec,
    pub use_mask: bool,
    pub output: PathBuf,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct WarpOutput {
    pub raster: PathBuf,
    pub aux: Option<PathBuf>,
    pub bbox: BoundingBox,
    pub log: String,
}

#[derive(Debug, Clone)]
pub struct MaskRequest {
    pub raster: PathBuf,
    pub mask: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn from_mime(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "image/jpeg" || v == "image/jpg" || v == "jpeg" || v == "jpg" => {
                ImageFormat::Jpeg
            }
            _ => ImageFormat::Png,
        }
    }

    pub fn mime(self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
        }
    }

    fn driver(self) -> &'static str {
        match self {
            ImageFormat::Png => "PNG",
            ImageFormat::Jpeg => "JPEG",
        }
    }

    fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub source: PathBuf,
    /// `false` renders straight from raster pixel space.
    pub georeferenced: bool,
    pub srs: String,
    pub bbox: BoundingBox,
    pub width: u32,
    pub height: u32,
    pub format: ImageFormat,
    pub transparent: bool,
    pub work_dir: PathBuf,
}

pub trait RasterTools: Send + Sync {
    fn warp<'a>(
        &'a self,
        request: &'a WarpRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<WarpOutput, WarpError>>;

    /// Burns the area outside the mask polygon into `request.raster` in place.
    fn apply_mask<'a>(&'a self, request: &'a MaskRequest) -> BoxFuture<'a, Result<(), WarpError>>;

    fn render<'a>(&'a self, request: &'a RenderRequest) -> BoxFuture<'a, Result<Vec<u8>, WarpError>>;
}

#[derive(Debug, Clone)]
pub struct GdalTools {
    bin_dir: Option<PathBuf>,
    timeout: Duration,
    cancel: CancellationToken,
}

impl GdalTools {
    pub fn new(bin_dir: Option<PathBuf>, timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            bin_dir,
            timeout,
            cancel,
        }
    }

    fn tool_path(&self, tool: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    /// Runs one tool to completion. The child is killed if the timeout
    /// elapses or either cancellation token fires.
    async fn run_tool(
        &self,
        tool: &str,
        args: &[String],
        cancel: &CancellationToken,
    ) -> Result<String, WarpError> {
        let mut cmd = Command::new(self.tool_path(tool));
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tracing::debug!(tool, args = ?args, "running raster tool");

        let child = cmd
            .spawn()
            .map_err(|err| WarpError::tool(tool, format!("failed to start {tool}: {err}")))?;

        let output = tokio::select! {
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(err)) => return Err(WarpError::tool(tool, err.to_string())),
                Err(_) => {
                    tracing::warn!(tool, timeout_secs = self.timeout.as_secs(), "raster tool timed out");
                    return Err(WarpError::tool(
                        tool,
                        format!("{tool} timed out after {}s", self.timeout.as_secs()),
                    ));
                }
            },
            _ = cancel.cancelled() => {
                return Err(WarpError::tool(tool, format!("{tool} was cancelled")));
            }
            _ = self.cancel.cancelled() => {
                return Err(WarpError::tool(tool, format!("{tool} was cancelled")));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            let diagnostic = [stderr.trim(), stdout.trim()]
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("\n");
            tracing::warn!(tool, status = %output.status, "raster tool failed");
            return Err(WarpError::tool(
                tool,
                if diagnostic.is_empty() {
                    format!("{tool} exited with {}", output.status)
                } else {
                    diagnostic
                },
            ));
        }
        if !stderr.trim().is_empty() {
            tracing::debug!(tool, stderr = %stderr.trim(), "raster tool warnings");
        }
        Ok(stdout)
    }

    async fn warp_impl(
        &self,
        request: &WarpRequest,
        cancel: CancellationToken,
    ) -> Result<WarpOutput, WarpError> {
        let scratch = tempfile::Builder::new()
            .prefix("warp-")
            .tempdir_in(&request.work_dir)
            .map_err(|err| WarpError::Internal(err.into()))?;
        let vrt = scratch.path().join(format!("{}.vrt", request.map_id));

        let mut log = self
            .run_tool("gdal_translate", &translate_gcps_args(request, &vrt), &cancel)
            .await?;
        log.push_str(
            &self
                .run_tool("gdalwarp", &warp_args(request, &vrt), &cancel)
                .await?,
        );
        let info = self
            .run_tool("gdalinfo", &info_args(&request.output), &cancel)
            .await?;
        let bbox = parse_extent(&info)?;

        let aux_path = PathBuf::from(format!("{}.aux.xml", request.output.display()));
        let aux = aux_path.exists().then_some(aux_path);
        Ok(WarpOutput {
            raster: request.output.clone(),
            aux,
            bbox,
            log,
        })
    }

    async fn render_impl(&self, request: &RenderRequest) -> Result<Vec<u8>, WarpError> {
        let scratch = tempfile::Builder::new()
            .prefix("render-")
            .tempdir_in(&request.work_dir)
            .map_err(|err| WarpError::Internal(err.into()))?;
        let image = scratch
            .path()
            .join(format!("out.{}", request.format.extension()));
        let cancel = self.cancel.child_token();

        if request.georeferenced {
            let vrt = scratch.path().join("view.vrt");
            self.run_tool("gdalwarp", &render_warp_args(request, &vrt), &cancel)
                .await?;
            self.run_tool("gdal_translate", &encode_args(request, &vrt, &image), &cancel)
                .await?;
        } else {
            self.run_tool("gdal_translate", &pixel_window_args(request, &image), &cancel)
                .await?;
        }

        tokio::fs::read(&image)
            .await
            .map_err(|err| WarpError::tool("gdal_translate", format!("no image produced: {err}")))
    }
}

impl RasterTools for GdalTools {
    fn warp<'a>(
        &'a self,
        request: &'a WarpRequest,
        cancel: CancellationToken,
    ) -> BoxFuture<'a, Result<WarpOutput, WarpError>> {
        self.warp_impl(request, cancel).boxed()
    }

    fn apply_mask<'a>(&'a self, request: &'a MaskRequest) -> BoxFuture<'a, Result<(), WarpError>> {
        async move {
            let cancel = self.cancel.child_token();
            self.run_tool("gdal_rasterize", &rasterize_args(request), &cancel)
                .await
                .map(|_| ())
        }
        .boxed()
    }

    fn render<'a>(&'a self, request: &'a RenderRequest) -> BoxFuture<'a, Result<Vec<u8>, WarpError>> {
        self.render_impl(request).boxed()
    }
}

/// GDAL builds without the legacy Google code only know the EPSG alias.
pub fn gdal_srs(srs: &str) -> String {
    let trimmed = srs.trim();
    if trimmed.eq_ignore_ascii_case("EPSG:900913") || trimmed.eq_ignore_ascii_case("EPSG:3785") {
        "EPSG:3857".to_string()
    } else {
        trimmed.to_ascii_uppercase()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub fn translate_gcps_args(request: &WarpRequest, vrt: &Path) -> Vec<String> {
    let mut args = vec![
        "-of".to_string(),
        "VRT".to_string(),
        "-a_srs".to_string(),
        gdal_srs(&request.srs),
    ];
    for gcp in &request.gcps {
        args.push("-gcp".to_string());
        args.extend(
            [gcp.pixel_x, gcp.pixel_y, gcp.geo_x, gcp.geo_y]
                .iter()
                .map(|v| v.to_string()),
        );
    }
    args.push(path_arg(&request.source));
    args.push(path_arg(vrt));
    args
}

pub fn warp_args(request: &WarpRequest, vrt: &Path) -> Vec<String> {
    let mut args = vec!["-overwrite".to_string()];
    args.extend(request.transform.gdalwarp_args());
    args.push("-r".to_string());
    args.push(request.resample.gdal_kernel().to_string());
    args.push("-dstalpha".to_string());
    if request.use_mask {
        args.push("-srcnodata".to_string());
        args.push(format!(
            "{MASK_BURN_VALUE} {MASK_BURN_VALUE} {MASK_BURN_VALUE}"
        ));
    }
    args.extend([
        "-s_srs".to_string(),
        gdal_srs(&request.srs),
        "-t_srs".to_string(),
        WARP_TARGET_SRS.to_string(),
        "-co".to_string(),
        "TILED=YES".to_string(),
        "-co".to_string(),
        "COMPRESS=LZW".to_string(),
        path_arg(vrt),
        path_arg(&request.output),
    ]);
    args
}

pub fn info_args(raster: &Path) -> Vec<String> {
    vec!["-json".to_string(), path_arg(raster)]
}

pub fn rasterize_args(request: &MaskRequest) -> Vec<String> {
    let burn = MASK_BURN_VALUE.to_string();
    let mut args = vec!["-i".to_string()];
    for band in 1..=3 {
        args.extend([
            "-b".to_string(),
            band.to_string(),
            "-burn".to_string(),
            burn.clone(),
        ]);
    }
    args.extend([
        "-l".to_string(),
        "mask".to_string(),
        path_arg(&request.mask),
        path_arg(&request.raster),
    ]);
    args
}

fn render_warp_args(request: &RenderRequest, vrt: &Path) -> Vec<String> {
    let bbox = &request.bbox;
    let mut args = vec![
        "-overwrite".to_string(),
        "-of".to_string(),
        "VRT".to_string(),
        "-t_srs".to_string(),
        gdal_srs(&request.srs),
        "-te".to_string(),
        bbox.min_x.to_string(),
        bbox.min_y.to_string(),
        bbox.max_x.to_string(),
        bbox.max_y.to_string(),
        "-ts".to_string(),
        request.width.to_string(),
        request.height.to_string(),
        "-r".to_string(),
        "bilinear".to_string(),
    ];
    if request.format == ImageFormat::Png && request.transparent {
        args.push("-dstalpha".to_string());
    }
    args.push(path_arg(&request.source));
    args.push(path_arg(vrt));
    args
}

fn encode_args(request: &RenderRequest, vrt: &Path, image: &Path) -> Vec<String> {
    let mut args = vec!["-of".to_string(), request.format.driver().to_string()];
    if request.format == ImageFormat::Jpeg {
        args.extend(["-b", "1", "-b", "2", "-b", "3"].map(str::to_string));
    }
    args.push(path_arg(vrt));
    args.push(path_arg(image));
    args
}

/// Crops a window of the raw raster. `bbox` is in pixel units, y down.
pub fn pixel_window_args(request: &RenderRequest, image: &Path) -> Vec<String> {
    let bbox = &request.bbox;
    let mut args = vec!["-of".to_string(), request.format.driver().to_string()];
    if request.format == ImageFormat::Jpeg {
        args.extend(["-b", "1", "-b", "2", "-b", "3"].map(str::to_string));
    }
    args.extend([
        "-srcwin".to_string(),
        bbox.min_x.round().to_string(),
        bbox.min_y.round().to_string(),
        bbox.width().round().max(1.0).to_string(),
        bbox.height().round().max(1.0).to_string(),
        "-outsize".to_string(),
        request.width.to_string(),
        request.height.to_string(),
        path_arg(&request.source),
        path_arg(image),
    ]);
    args
}

/// Reads the WGS84 footprint from `gdalinfo -json` output.
pub fn parse_extent(info: &str) -> Result<BoundingBox, WarpError> {
    let malformed = |detail: &str| {
        WarpError::tool(
            "gdalinfo",
            format!("could not read raster extent: {detail}\n{info}"),
        )
    };
    let doc: JsonValue =
        serde_json::from_str(info).map_err(|err| malformed(&err.to_string()))?;

    let mut points: Vec<[f64; 2]> = Vec::new();
    if let Some(rings) = doc
        .pointer("/wgs84Extent/coordinates")
        .and_then(JsonValue::as_array)
    {
        for ring in rings.iter().filter_map(JsonValue::as_array) {
            points.extend(ring.iter().filter_map(point));
        }
    } else if let Some(corners) = doc.get("cornerCoordinates").and_then(JsonValue::as_object) {
        points.extend(corners.values().filter_map(point));
    }
    if points.is_empty() {
        return Err(malformed("no wgs84Extent or cornerCoordinates"));
    }

    let bbox = points.iter().fold(
        BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN),
        |acc, [x, y]| {
            BoundingBox::new(acc.min_x.min(*x), acc.min_y.min(*y), acc.max_x.max(*x), acc.max_y.max(*y))
        },
    );
    if !bbox.is_valid() {
        return Err(malformed("degenerate extent"));
    }
    Ok(bbox)
}

fn point(value: &JsonValue) -> Option<[f64; 2]> {
    let pair = value.as_array()?;
    Some([pair.first()?.as_f64()?, pair.get(1)?.as_f64()?])
}
