use std::time::Duration;

use async_trait::async_trait;
use fieldx::fxstruct;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use reqwest::header::AUTHORIZATION;
use reqwest::multipart::Form;
use reqwest::multipart::Part;
use reqwest::Method;
use reqwest::RequestBuilder;
use serde::de::DeserializeOwned;
use tracing::debug;
use tracing::instrument;

use crate::decode;
use crate::error::ApiError;
use crate::error::SyncError;
use crate::traits::RemoteApi;
use crate::types::FoodSpot;
use crate::types::Image;
use crate::types::ImageId;
use crate::types::ImageOwner;
use crate::types::ImageUpload;
use crate::types::LikeState;
use crate::types::Review;
use crate::types::ReviewDraft;
use crate::types::ReviewId;
use crate::types::SortOrder;
use crate::types::SpotId;
use crate::types::UserProfile;

/// Connection settings of [`HttpApi`].
#[derive(Clone)]
#[fxstruct(no_new, builder, get)]
pub struct HttpConfig {
    /// API root, e.g. `https://api.example.com/api`.
    #[fieldx(get(clone), builder(into))]
    base_url: String,
    /// Bearer token of the signed-in user.
    #[fieldx(get(clone), builder(into), default(None))]
    token:    Option<String>,
    /// Whole-request timeout. An expired timeout is reported as [`ApiError::Timeout`].
    #[fieldx(get(copy), default(Duration::from_secs(15)))]
    timeout:  Duration,
}

/// [`RemoteApi`] over REST/JSON.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client:   reqwest::Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(config: &HttpConfig) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = config.token() {
            let mut value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| SyncError::Config(format!("invalid token: {err}")))?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .default_headers(headers)
            .build()
            .map_err(|err| SyncError::Config(format!("cannot create HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url().trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{path}", self.base_url))
            .header(reqwest::header::ACCEPT, "application/json")
    }

    // Non-2xx responses become errors; the body of a successful one is returned as is.
    async fn send(&self, request: RequestBuilder) -> Result<Vec<u8>, ApiError> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            Ok(body.to_vec())
        }
        else {
            debug!("request failed with {status}");
            Err(decode::error(status.as_u16(), &body))
        }
    }

    async fn get_data<T>(&self, endpoint: &'static str, path: &str) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
    {
        let body = self.send(self.request(Method::GET, path)).await?;
        decode::data(endpoint, &body)
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    #[instrument(level = "trace", skip(self))]
    async fn food_spots(&self) -> Result<Vec<FoodSpot>, ApiError> {
        self.get_data("food_spots", "/food-spots").await
    }

    #[instrument(level = "trace", skip(self))]
    async fn food_spot(&self, id: SpotId) -> Result<FoodSpot, ApiError> {
        self.get_data("food_spot", &format!("/food-spots/{id}")).await
    }

    #[instrument(level = "trace", skip(self))]
    async fn reviews(&self, spot_id: SpotId, sort: SortOrder) -> Result<Vec<Review>, ApiError> {
        let body = self
            .send(
                self.request(Method::GET, &format!("/food-spots/{spot_id}/reviews"))
                    .query(&[("sort", sort.as_str())]),
            )
            .await?;
        decode::data("reviews", &body)
    }

    #[instrument(level = "trace", skip(self))]
    async fn favourites(&self) -> Result<Vec<FoodSpot>, ApiError> {
        self.get_data("favourites", "/favourites").await
    }

    #[instrument(level = "trace", skip(self))]
    async fn profile(&self) -> Result<UserProfile, ApiError> {
        self.get_data("profile", "/profile").await
    }

    #[instrument(level = "trace", skip(self, draft))]
    async fn create_review(&self, spot_id: SpotId, draft: &ReviewDraft) -> Result<Review, ApiError> {
        let body = self
            .send(
                self.request(Method::POST, &format!("/food-spots/{spot_id}/reviews"))
                    .json(draft),
            )
            .await?;
        decode::data("create_review", &body)
    }

    #[instrument(level = "trace", skip(self, draft))]
    async fn update_review(&self, spot_id: SpotId, review_id: ReviewId, draft: &ReviewDraft)
        -> Result<Review, ApiError> {
        let body = self
            .send(
                self.request(Method::PUT, &format!("/food-spots/{spot_id}/reviews/{review_id}"))
                    .json(draft),
            )
            .await?;
        decode::data("update_review", &body)
    }

    #[instrument(level = "trace", skip(self))]
    async fn delete_review(&self, spot_id: SpotId, review_id: ReviewId) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, &format!("/food-spots/{spot_id}/reviews/{review_id}")))
            .await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn toggle_like(&self, review_id: ReviewId) -> Result<LikeState, ApiError> {
        let body = self
            .send(self.request(Method::POST, &format!("/reviews/{review_id}/like")))
            .await?;
        decode::like(&body)
    }

    #[instrument(level = "trace", skip(self))]
    async fn add_favourite(&self, spot_id: SpotId) -> Result<(), ApiError> {
        self.send(self.request(Method::POST, &format!("/food-spots/{spot_id}/favourite")))
            .await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self))]
    async fn remove_favourite(&self, spot_id: SpotId) -> Result<(), ApiError> {
        self.send(self.request(Method::DELETE, &format!("/food-spots/{spot_id}/favourite")))
            .await?;
        Ok(())
    }

    #[instrument(level = "trace", skip(self, upload), fields(file = %upload.file_name))]
    async fn upload_image(&self, owner: ImageOwner, upload: &ImageUpload) -> Result<Image, ApiError> {
        let part = Part::bytes(upload.bytes.clone())
            .file_name(upload.file_name.clone())
            .mime_str(&upload.content_type)
            .map_err(ApiError::from)?;
        let form = Form::new().part("image", part);
        let path = format!("/images/{}/{}", owner.model_type(), owner.model_id());
        let body = self.send(self.request(Method::POST, &path).multipart(form)).await?;
        decode::data("upload_image", &body)
    }

    #[instrument(level = "trace", skip(self))]
    async fn delete_image(&self, owner: ImageOwner, image_id: ImageId) -> Result<(), ApiError> {
        let path = format!("/images/{}/{}/{image_id}", owner.model_type(), owner.model_id());
        self.send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_slash_is_dropped() {
        let config = HttpConfig::builder()
            .base_url("https://api.example.com/api/")
            .token("secret".to_string())
            .build()
            .expect("config");
        assert_eq!(config.timeout(), Duration::from_secs(15));
        let api = HttpApi::new(&config).expect("client");
        assert_eq!(api.base_url, "https://api.example.com/api");
    }

    #[test]
    fn bad_token_is_a_config_error() {
        let config = HttpConfig::builder()
            .base_url("https://api.example.com")
            .token("line\nbreak".to_string())
            .build()
            .expect("config");
        assert!(matches!(HttpApi::new(&config), Err(SyncError::Config(_))));
    }
}
