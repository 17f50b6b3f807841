//! REST client for the annotation persistence service.
//!
//! Wraps the per-frame endpoints (points, masks, label clearing and
//! the frame image) of one project using [`reqwest`].

use segmark_core::annotation::Point;
use segmark_core::types::{FrameNumber, LabelId, ProjectId};

use crate::models::{
    ClearLabelsResponse, FrameImage, MaskCreate, PointCreate, SaveMaskRequest, SavePointsRequest,
    StoredMask,
};
use crate::AnnotationPersistence;

/// HTTP client scoped to one project.
#[derive(Debug, Clone)]
pub struct PersistenceApi {
    client: reqwest::Client,
    base_url: String,
    project_id: ProjectId,
}

/// Errors from the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Persistence API error ({status}): {body}")]
    Api {
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    #[error("Frame {0} not found")]
    FrameNotFound(FrameNumber),

    #[error("Failed to decode frame image: {0}")]
    Decode(#[from] image::ImageError),
}

impl PersistenceApi {
    /// * `base_url`   - API root including its prefix, e.g. `http://host:8000/api/v1`.
    /// * `project_id` - project every request is scoped to.
    pub fn new(base_url: impl Into<String>, project_id: ProjectId) -> Self {
        Self::with_client(reqwest::Client::new(), base_url, project_id)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        project_id: ProjectId,
    ) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            project_id,
        }
    }

    pub fn project_id(&self) -> ProjectId {
        self.project_id
    }

    /// `{base}/projects/{project}/frames/{frame}`
    pub fn frame_url(&self, frame_number: FrameNumber) -> String {
        format!(
            "{}/projects/{}/frames/{}",
            self.base_url, self.project_id, frame_number
        )
    }

    fn frame_resource_url(&self, frame_number: FrameNumber, resource: &str) -> String {
        format!("{}/{resource}", self.frame_url(frame_number))
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or [`PersistenceError::Api`]
    /// carrying the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, PersistenceError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(PersistenceError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful JSON response body into the expected type.
    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PersistenceError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}

fn label_query(label_id: Option<LabelId>) -> Vec<(&'static str, String)> {
    label_id
        .map(|id| vec![("label_id", id.to_string())])
        .unwrap_or_default()
}

impl AnnotationPersistence for PersistenceApi {
    async fn load_frame(&self, frame_number: FrameNumber) -> Result<FrameImage, PersistenceError> {
        let response = self.client.get(self.frame_url(frame_number)).send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(PersistenceError::FrameNotFound(frame_number));
        }
        let bytes = Self::ensure_success(response).await?.bytes().await?;
        let image = image::load_from_memory(&bytes)?;

        tracing::debug!(
            project_id = %self.project_id,
            frame_number,
            width = image.width(),
            height = image.height(),
            "Loaded frame image",
        );
        Ok(FrameImage {
            frame_number,
            image,
        })
    }

    async fn load_points(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> Result<Vec<Point>, PersistenceError> {
        let response = self
            .client
            .get(self.frame_resource_url(frame_number, "points"))
            .query(&label_query(label_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn save_points(
        &self,
        frame_number: FrameNumber,
        label_id: LabelId,
        points: Vec<Point>,
    ) -> Result<Vec<Point>, PersistenceError> {
        let body = SavePointsRequest {
            label_id,
            points: points.iter().map(PointCreate::from).collect(),
        };

        let response = self
            .client
            .post(self.frame_resource_url(frame_number, "points"))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn load_masks(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> Result<Vec<StoredMask>, PersistenceError> {
        let response = self
            .client
            .get(self.frame_resource_url(frame_number, "masks"))
            .query(&label_query(label_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn save_mask(
        &self,
        frame_number: FrameNumber,
        label_id: LabelId,
        mask: MaskCreate,
    ) -> Result<StoredMask, PersistenceError> {
        let body = SaveMaskRequest { label_id, mask };

        let response = self
            .client
            .post(self.frame_resource_url(frame_number, "masks"))
            .json(&body)
            .send()
            .await?;

        Self::parse_response(response).await
    }

    async fn clear_labels(
        &self,
        frame_number: FrameNumber,
        label_id: Option<LabelId>,
    ) -> Result<ClearLabelsResponse, PersistenceError> {
        let response = self
            .client
            .delete(self.frame_resource_url(frame_number, "labels"))
            .query(&label_query(label_id))
            .send()
            .await?;

        Self::parse_response(response).await
    }
}
