use std::net::IpAddr;
use std::sync::Arc;

use rocket::http::Status;
use rocket::response::stream::{Event, EventStream};
use rocket::serde::json::Json;
use rocket::tokio::select;
use rocket::{delete, get, post, Shutdown, State};
use rustrict::CensorStr;
use shared::models::*;
use shared::validation::{normalize_poll_request, validate_poll_request};
use tracing::{debug, info, instrument};

use crate::engine::VoteTallyEngine;
use crate::error::ApiError;
use crate::rate_limiter::RateLimiter;
use crate::reconciler::CycleReport;
use crate::utils::{client_key, parse_id};

pub struct AppState {
    pub engine: Arc<VoteTallyEngine>,
    pub vote_limiter: RateLimiter,
}

impl AppState {
    pub fn new(engine: Arc<VoteTallyEngine>, votes_per_minute: u32) -> Self {
        Self {
            engine,
            vote_limiter: RateLimiter::per_minute(votes_per_minute),
        }
    }
}

fn check_poll_for_profanity(request: &CreatePollRequest) -> Result<(), ApiError> {
    if request.question.is_inappropriate() {
        return Err(ApiError::Invalid(format!(
            "Possible profanity detected in question: {}",
            request.question
        )));
    }

    for option in &request.options {
        if option.is_inappropriate() {
            return Err(ApiError::Invalid(format!("Possible profanity detected in option: {}", option)));
        }
    }

    let combined = request.options.join("");
    if combined.is_inappropriate() {
        return Err(ApiError::Invalid(format!(
            "Inappropriate content detected across options: {}",
            request.options.join(", ")
        )));
    }

    Ok(())
}

#[get("/polls")]
pub async fn list_polls(state: &State<AppState>) -> Result<Json<Vec<PollTotals>>, ApiError> {
    Ok(Json(state.engine.get_all_poll_totals().await?))
}

#[instrument(skip(state, request))]
#[post("/polls", format = "json", data = "<request>")]
pub async fn create_poll(
    state: &State<AppState>,
    request: Json<CreatePollRequest>,
) -> Result<(Status, Json<Poll>), ApiError> {
    let request = normalize_poll_request(&request.into_inner());
    validate_poll_request(&request)?;
    check_poll_for_profanity(&request)?;

    let poll = state
        .engine
        .create_poll(Poll::new(request.question, request.options))
        .await?;

    info!("Created poll {} with {} options", poll.id, poll.options.len());
    Ok((Status::Created, Json(poll)))
}

#[get("/polls/<id>")]
pub async fn get_poll(state: &State<AppState>, id: &str) -> Result<Json<PollTotals>, ApiError> {
    let poll_id = parse_id(id)?;
    Ok(Json(state.engine.get_poll_totals(poll_id).await?))
}

#[instrument(skip(state))]
#[delete("/polls/<id>")]
pub async fn delete_poll(state: &State<AppState>, id: &str) -> Result<Status, ApiError> {
    let poll_id = parse_id(id)?;
    let option_ids = state.engine.delete_poll(poll_id).await?;
    info!("Deleted poll {} and {} options", poll_id, option_ids.len());
    Ok(Status::NoContent)
}

#[instrument(skip(state, ip), fields(option_id = %id))]
#[post("/options/<id>/vote")]
pub async fn cast_vote(
    state: &State<AppState>,
    id: &str,
    ip: Option<IpAddr>,
) -> Result<Json<VoteResponse>, ApiError> {
    let option_id = parse_id(id)?;
    state.vote_limiter.check(&client_key("vote", ip))?;

    let response = state.engine.record_vote(option_id).await?;
    debug!("Vote recorded, visible total {}", response.visible_total);
    Ok(Json(response))
}

#[get("/options/<id>")]
pub async fn get_option(state: &State<AppState>, id: &str) -> Result<Json<OptionTotal>, ApiError> {
    let option_id = parse_id(id)?;
    Ok(Json(state.engine.get_total(option_id).await?))
}

#[instrument(skip(state))]
#[delete("/options/<id>")]
pub async fn delete_option(state: &State<AppState>, id: &str) -> Result<Status, ApiError> {
    let option_id = parse_id(id)?;
    state.engine.delete_option(option_id).await?;
    Ok(Status::NoContent)
}

#[get("/totals")]
pub async fn grand_total(state: &State<AppState>) -> Result<Json<GrandTotal>, ApiError> {
    Ok(Json(state.engine.get_grand_total().await?))
}

#[post("/reconcile")]
pub async fn reconcile(state: &State<AppState>) -> Json<CycleReport> {
    Json(state.engine.reconcile_now().await)
}

#[get("/events")]
pub fn events(state: &State<AppState>, mut shutdown: Shutdown) -> EventStream![] {
    let mut subscription = state.engine.subscribe();
    debug!("Observer {} subscribed, {} connected", subscription.id(), state.engine.observer_count());

    EventStream! {
        loop {
            let event = select! {
                event = subscription.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
                _ = &mut shutdown => break,
            };

            yield Event::json(&*event).event(event.kind());
        }
    }
}

#[rocket::options("/<_..>")]
pub async fn all_options() -> Status {
    Status::Ok
}
