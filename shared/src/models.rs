use serde::{Serialize, Deserialize};
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: Uuid,
    pub question: String,
    pub options: Vec<PollOption>,
    pub created_at: OffsetDateTime,
}

/// An answer to a poll. `votes` holds the durable count when read from the
/// store and the visible total once merged with pending counters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub text: String,
    pub votes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    pub question: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollTotals {
    #[serde(flatten)]
    pub poll: Poll,
    /// Set when pending counters could not be read and totals are durable only.
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptionTotal {
    pub option_id: Uuid,
    pub poll_id: Uuid,
    pub votes: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GrandTotal {
    pub votes: i64,
    pub stale: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoteResponse {
    pub option_id: Uuid,
    pub poll_id: Uuid,
    pub visible_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VoteUpdate {
    pub option_id: Uuid,
    pub poll_id: Uuid,
    pub votes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PollDeleted {
    pub poll_id: Uuid,
}

/// Live event pushed to observers, serialized as `{"type": ..., "payload": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum TallyEvent {
    PollCreated(Poll),
    VoteUpdate(VoteUpdate),
    PollDeleted(PollDeleted),
}

impl TallyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TallyEvent::PollCreated(_) => "PollCreated",
            TallyEvent::VoteUpdate(_) => "VoteUpdate",
            TallyEvent::PollDeleted(_) => "PollDeleted",
        }
    }
}

impl Poll {
    pub fn new(question: impl Into<String>, options: Vec<String>) -> Self {
        let id = Uuid::new_v4();
        let options = options
            .into_iter()
            .map(|text| PollOption {
                id: Uuid::new_v4(),
                poll_id: id,
                text,
                votes: 0,
            })
            .collect();

        Self {
            id,
            question: question.into(),
            options,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn option_ids(&self) -> Vec<Uuid> {
        self.options.iter().map(|o| o.id).collect()
    }

    pub fn total_votes(&self) -> i64 {
        self.options.iter().map(|o| o.votes).sum()
    }
}
