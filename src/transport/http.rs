use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    CreateStreamResponse, FinishStreamResponse, RemoveStreamResponse, StreamId, Transport,
    UploadChunkResponse,
};
use crate::error::TransportError;
use crate::hash::ContentHash;

/// Talks to the storage service over plain HTTP with JSON responses.
///
/// | call            | request                                    |
/// |-----------------|--------------------------------------------|
/// | `create_stream` | `POST {base}/streams`                      |
/// | `upload_chunk`  | `PUT {base}/streams/{id}/chunks/{hash}`    |
/// | `finish_stream` | `POST {base}/streams/{id}/finish`          |
/// | `remove_stream` | `DELETE {base}/streams/{id}`               |
#[derive(Debug, Clone)]
pub struct HttpTransport {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct CreateStreamRequest<'a> {
    extension: &'a str,
}

#[derive(Serialize)]
struct FinishStreamRequest {
    hash: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        let mut base_url: String = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self { base_url, client }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn stream_url(&self, stream_id: &StreamId) -> String {
        format!("{}/streams/{}", self.base_url, stream_id)
    }
}

async fn parse_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, TransportError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(TransportError::Status {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.json().await?)
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn create_stream(
        &self,
        extension: &str,
    ) -> Result<CreateStreamResponse, TransportError> {
        let url = format!("{}/streams", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&CreateStreamRequest { extension })
            .send()
            .await?;
        parse_response(response).await
    }

    async fn upload_chunk(
        &self,
        stream_id: &StreamId,
        hash: &ContentHash,
        chunk: Bytes,
    ) -> Result<UploadChunkResponse, TransportError> {
        let url = format!("{}/chunks/{hash}", self.stream_url(stream_id));
        let response = self.client.put(url).body(chunk).send().await?;
        parse_response(response).await
    }

    async fn finish_stream(
        &self,
        stream_id: &StreamId,
        file_hash: &ContentHash,
    ) -> Result<FinishStreamResponse, TransportError> {
        let url = format!("{}/finish", self.stream_url(stream_id));
        let response = self
            .client
            .post(url)
            .json(&FinishStreamRequest {
                hash: file_hash.to_hex(),
            })
            .send()
            .await?;
        parse_response(response).await
    }

    async fn remove_stream(
        &self,
        stream_id: &StreamId,
    ) -> Result<RemoveStreamResponse, TransportError> {
        let response = self.client.delete(self.stream_url(stream_id)).send().await?;
        parse_response(response).await
    }
}
