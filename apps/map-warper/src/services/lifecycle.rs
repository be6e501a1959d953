use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WarpError;
use crate::services::maps::{GeoBounds, MapRecord, WarpedArtifacts};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, utoipa::ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum MapStatus {
    #[default]
    Unloaded,
    Loading,
    Available,
    Warping,
    Warped,
    Publishing,
    Published,
    Failed,
}

impl MapStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            MapStatus::Unloaded => "unloaded",
            MapStatus::Loading => "loading",
            MapStatus::Available => "available",
            MapStatus::Warping => "warping",
            MapStatus::Warped => "warped",
            MapStatus::Publishing => "publishing",
            MapStatus::Published => "published",
            MapStatus::Failed => "failed",
        }
    }

    /// Stored values that are missing or unrecognised decode as `Unloaded`.
    pub fn from_db(value: Option<&str>) -> Self {
        value
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_default()
    }

    /// Text reported by the status probe. A map with no raster yet reads as `loading`.
    pub fn probe_text(self) -> &'static str {
        match self {
            MapStatus::Unloaded => "loading",
            other => other.as_str(),
        }
    }

    /// The raw raster is usable.
    pub fn is_ready(self) -> bool {
        !matches!(self, MapStatus::Unloaded | MapStatus::Loading)
    }

    pub fn has_bbox(self) -> bool {
        matches!(
            self,
            MapStatus::Warped | MapStatus::Publishing | MapStatus::Published
        )
    }

    pub fn is_locked(self) -> bool {
        matches!(self, MapStatus::Publishing | MapStatus::Published)
    }

    pub fn can_transition_to(self, next: MapStatus) -> bool {
        use MapStatus::*;
        if next == Unloaded {
            return true;
        }
        matches!(
            (self, next),
            (Unloaded, Loading)
                | (Unloaded, Available)
                | (Loading, Available)
                | (Loading, Failed)
                | (Available, Warping)
                | (Warped, Warping)
                | (Failed, Warping)
                | (Warping, Warped)
                | (Warping, Failed)
                | (Warped, Publishing)
                | (Publishing, Published)
                | (Publishing, Warped)
                | (Published, Warped)
        )
    }

    /// Guard shared by every operation that rewrites the map's inputs or raster.
    pub fn ensure_mutable(self) -> Result<(), WarpError> {
        match self {
            MapStatus::Unloaded | MapStatus::Loading => Err(WarpError::Unavailable { status: self }),
            MapStatus::Warping => Err(WarpError::Busy),
            MapStatus::Publishing | MapStatus::Published => {
                Err(WarpError::Locked { status: self })
            }
            MapStatus::Available | MapStatus::Warped | MapStatus::Failed => Ok(()),
        }
    }
}

impl fmt::Display for MapStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MapStatus {
    type Err = WarpError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "unloaded" => Ok(MapStatus::Unloaded),
            "loading" => Ok(MapStatus::Loading),
            "available" => Ok(MapStatus::Available),
            "warping" => Ok(MapStatus::Warping),
            "warped" => Ok(MapStatus::Warped),
            "publishing" => Ok(MapStatus::Publishing),
            "published" => Ok(MapStatus::Published),
            "failed" => Ok(MapStatus::Failed),
            other => Err(WarpError::invalid(format!("unknown map status: {other}"))),
        }
    }
}

impl MapRecord {
    /// Moves the record to `next`, keeping `bbox` consistent with the new state.
    pub fn transition_to(&mut self, next: MapStatus) -> Result<(), WarpError> {
        if !self.status.can_transition_to(next) {
            return Err(WarpError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next.has_bbox() && self.bbox.is_none() {
            return Err(WarpError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if !next.has_bbox() {
            self.bbox = None;
        }
        tracing::debug!(map_id = %self.id, from = %self.status, to = %next, "map status transition");
        self.status = next;
        Ok(())
    }

    pub fn mark_warped(
        &mut self,
        bbox: GeoBounds,
        artifacts: WarpedArtifacts,
    ) -> Result<(), WarpError> {
        if self.status != MapStatus::Warping {
            return Err(WarpError::InvalidTransition {
                from: self.status,
                to: MapStatus::Warped,
            });
        }
        self.bbox = Some(bbox);
        self.warped = Some(artifacts);
        self.transition_to(MapStatus::Warped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::geotransform::BoundingBox;
    use std::path::PathBuf;

    fn bounds() -> GeoBounds {
        GeoBounds {
            bbox: BoundingBox::new(-1.0, 50.0, 1.0, 52.0),
            srid: 4326,
        }
    }

    fn artifacts() -> WarpedArtifacts {
        WarpedArtifacts {
            raster: PathBuf::from("/tmp/warped.tif"),
            aux: None,
        }
    }

    #[test]
    fn null_or_unknown_status_decodes_as_unloaded() {
        assert_eq!(MapStatus::from_db(None), MapStatus::Unloaded);
        assert_eq!(MapStatus::from_db(Some("bogus")), MapStatus::Unloaded);
        assert_eq!(MapStatus::from_db(Some("Warped")), MapStatus::Warped);
        assert_eq!(MapStatus::Unloaded.probe_text(), "loading");
        assert_eq!(MapStatus::Published.probe_text(), "published");
    }

    #[test]
    fn allowed_transitions_follow_lifecycle() {
        use MapStatus::*;
        assert!(Available.can_transition_to(Warping));
        assert!(Warping.can_transition_to(Warped));
        assert!(Warping.can_transition_to(Failed));
        assert!(Warped.can_transition_to(Publishing));
        assert!(Publishing.can_transition_to(Warped));
        assert!(Published.can_transition_to(Warped));
        assert!(Published.can_transition_to(Unloaded));

        assert!(!Available.can_transition_to(Publishing));
        assert!(!Published.can_transition_to(Warping));
        assert!(!Warping.can_transition_to(Warping));
    }

    #[test]
    fn guard_rejects_busy_and_locked_maps() {
        assert!(matches!(
            MapStatus::Warping.ensure_mutable(),
            Err(WarpError::Busy)
        ));
        assert!(matches!(
            MapStatus::Publishing.ensure_mutable(),
            Err(WarpError::Locked { .. })
        ));
        assert!(matches!(
            MapStatus::Loading.ensure_mutable(),
            Err(WarpError::Unavailable { .. })
        ));
        assert!(MapStatus::Failed.ensure_mutable().is_ok());
    }

    #[test]
    fn bbox_tracks_warped_states() {
        let mut record = MapRecord::new_for_test(MapStatus::Available);
        record.transition_to(MapStatus::Warping).unwrap();
        assert!(record.transition_to(MapStatus::Warped).is_err());

        record.mark_warped(bounds(), artifacts()).unwrap();
        assert_eq!(record.status, MapStatus::Warped);
        assert!(record.bbox.is_some());

        record.transition_to(MapStatus::Publishing).unwrap();
        assert!(record.bbox.is_some());
        record.transition_to(MapStatus::Warped).unwrap();
        assert!(record.bbox.is_some());

        record.transition_to(MapStatus::Warping).unwrap();
        assert!(record.bbox.is_none());
    }
}
