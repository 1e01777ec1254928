use reqwest::Url;

use crate::{
    media::{frame_source::FrameRequest, probe::VideoStreamInfo},
    server::{FrameQuery, FrameServerHandle, MetadataRequest},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request never produced an HTTP response.
    #[error("request to frame server failed: {0}")]
    Network(String),

    #[error("frame server answered {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid frame server response: {0}")]
    Invalid(String),
}

/// Client side of the frame server, used by render sessions.
#[derive(Clone, Debug)]
pub struct FrameClient {
    http: reqwest::Client,
    server: FrameServerHandle,
    render_id: u64,
}

impl FrameClient {
    pub fn new(http: reqwest::Client, server: FrameServerHandle, render_id: u64) -> Self {
        Self {
            http,
            server,
            render_id,
        }
    }

    pub async fn fetch_frame(&self, req: &FrameRequest) -> Result<Vec<u8>, FetchError> {
        let mut query = FrameQuery::from_request(req);
        query.render_id = Some(self.render_id);
        let mut url = self.url("/api/frame")?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs
                .append_pair("source", &query.source)
                .append_pair("fps", &query.fps.to_string())
                .append_pair("width", &query.width.to_string())
                .append_pair("height", &query.height.to_string())
                .append_pair("fileFps", &query.file_fps.to_string())
                .append_pair("scale", &query.scale.to_string())
                .append_pair("time", &query.time.to_string())
                .append_pair("streamIndex", &query.stream_index.to_string())
                .append_pair("outputFormat", query.output_format.as_str())
                .append_pair("quality", &query.quality.to_string())
                .append_pair("renderId", &self.render_id.to_string());
        }

        let res = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = res.status();
        let body = res
            .bytes()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        if !status.is_success() {
            return Err(FetchError::Rejected {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&body).into_owned(),
            });
        }
        Ok(body.to_vec())
    }

    pub async fn read_video_metadata(
        &self,
        path: &str,
        stream_index: u32,
    ) -> Result<VideoStreamInfo, FetchError> {
        let url = self.url("/api/read-video-metadata")?;
        let res = self
            .http
            .post(url)
            .json(&MetadataRequest {
                path: path.to_string(),
                stream_index,
            })
            .send()
            .await
            .map_err(|e| FetchError::Network(e.to_string()))?;
        let status = res.status();
        if !status.is_success() {
            let message = res.text().await.unwrap_or_default();
            return Err(FetchError::Rejected {
                status: status.as_u16(),
                message,
            });
        }
        res.json::<VideoStreamInfo>()
            .await
            .map_err(|e| FetchError::Invalid(e.to_string()))
    }

    fn url(&self, path: &str) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.server.base_url)
            .and_then(|base| base.join(path))
            .map_err(|e| FetchError::Invalid(format!("bad frame server url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("secret", &self.server.secret);
        Ok(url)
    }
}
