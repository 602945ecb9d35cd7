use super::HttpClientError;
use crate::error::{err, err_ctx};
use crate::prelude::*;
use crate::Result;
use async_trait::async_trait;
use easy_ext::ext;
use reqwest::Response;
use reqwest_middleware::RequestBuilder;

#[ext(RequestBuilderBasicExt)]
#[async_trait]
pub(crate) impl RequestBuilder {
    /// Better version of [`RequestBuilder::send`] that returns an error
    /// if the error response status code is returned.
    async fn try_send(self) -> Result<Response> {
        let response = self
            .send()
            .await
            .map_err(err_ctx!(HttpClientError::Request))?;

        let status = response.status();

        if !status.is_client_error() && !status.is_server_error() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_else(|err| {
            format!(
                "Could not collect the error response body text: {}",
                err.display_chain()
            )
        });

        Err(err!(HttpClientError::BadResponseStatusCode { status, body }))
    }

    async fn read_bytes(self) -> Result<Vec<u8>> {
        let bytes = self
            .try_send()
            .await?
            .bytes()
            .await
            .map_err(err_ctx!(HttpClientError::ReadPayload))?;

        Ok(bytes.to_vec())
    }
}
