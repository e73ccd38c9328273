use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use crate::application::error::HttpError;
use crate::application::posts::CreatePostError;
use crate::domain::posts::Post;
use crate::domain::types::UserId;

use super::HttpState;

const FAN_OUT_FAILED: &str = "failed";

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    pub body: String,
}

/// Body of a `202 Accepted`: the post is stored but followers were not told.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DegradedPostResponse {
    pub post: Post,
    pub fan_out: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedResponse {
    pub user_id: UserId,
    pub posts: Vec<Post>,
}

pub async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

pub async fn create_post(
    State(state): State<HttpState>,
    Path(user_id): Path<UserId>,
    Json(request): Json<CreatePostRequest>,
) -> Result<Response, HttpError> {
    match state.posts.create_post(user_id, &request.body).await {
        Ok(post) => Ok((StatusCode::CREATED, Json(post)).into_response()),
        Err(CreatePostError::FanOut { post, .. }) => {
            let body = DegradedPostResponse {
                post: *post,
                fan_out: FAN_OUT_FAILED,
            };
            Ok((StatusCode::ACCEPTED, Json(body)).into_response())
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn get_feed(
    State(state): State<HttpState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<FeedResponse>, HttpError> {
    let feed = state.feeds.feed_for(user_id).await?;
    Ok(Json(FeedResponse {
        user_id,
        posts: feed.into_posts(),
    }))
}
