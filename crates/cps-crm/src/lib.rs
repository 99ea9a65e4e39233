//! Remote CRM client: bearer-authenticated, paginated access to the Leads
//! and Events modules, with transient-failure retry.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "cps-crm";

/// Records requested per page; the remote caps at 200.
pub const PAGE_SIZE: u32 = 200;

/// Hard bound on pages fetched per scope, against runaway pagination.
pub const MAX_PAGES: u32 = 50;

/// A returned token is treated as expired this long before its stated expiry.
pub const TOKEN_EXPIRY_MARGIN_SECS: i64 = 60;

const LEAD_FIELDS: &str = "id,First_Name,Last_Name,Email,Phone,Mobile,Lead_Status,Tier_Level,\
Language,Other_spoken_language_s,Candidate_Recruitment_Owner,Language_Assessment,BGV_Passed,\
Systems_Check_Approved,Offer_Accepted,Last_Activity_Time,Modified_Time,Created_Time";

const EVENT_FIELDS: &str = "id,Event_Title,Subject,Start_DateTime,End_DateTime,What_Id,Owner,\
Participants,Check_In_Status,Description,Created_Time,Modified_Time";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token refresh request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("token refresh rejected: {0}")]
    Refresh(String),
}

#[derive(Debug, Error)]
pub enum CrmError {
    #[error("authentication failed: {0}")]
    Auth(#[from] TokenError),
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl CrmError {
    /// Authentication errors are terminal for a whole sync scope; everything
    /// else is a page-level failure.
    pub fn is_auth(&self) -> bool {
        matches!(self, CrmError::Auth(_))
    }
}

/// Supplies a bearer token with at least [`TOKEN_EXPIRY_MARGIN_SECS`] of
/// remaining validity, refreshing transparently when needed.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn get_valid_token(&self) -> Result<String, TokenError>;
}

/// Fixed-token provider for tests and local development.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_valid_token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default)]
struct CachedToken {
    access_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

/// OAuth refresh-token grant provider with an in-memory token cache.
///
/// Refreshes are serialized behind a mutex; the expiry check repeats after
/// acquisition so concurrent callers refresh at most once.
pub struct OAuthTokenProvider {
    accounts_base_url: String,
    client_id: String,
    client_secret: String,
    refresh_token: String,
    http: reqwest::Client,
    cached: Mutex<CachedToken>,
}

impl OAuthTokenProvider {
    pub fn new(
        accounts_base_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        refresh_token: impl Into<String>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            accounts_base_url: accounts_base_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: refresh_token.into(),
            http,
            cached: Mutex::new(CachedToken::default()),
        }
    }

    fn still_valid(cached: &CachedToken, now: DateTime<Utc>) -> Option<String> {
        let token = cached.access_token.as_ref()?;
        let expires_at = cached.expires_at?;
        if now < expires_at - chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS) {
            Some(token.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn get_valid_token(&self) -> Result<String, TokenError> {
        let mut cached = self.cached.lock().await;
        if let Some(token) = Self::still_valid(&cached, Utc::now()) {
            return Ok(token);
        }

        debug!("refreshing access token");
        let response = self
            .http
            .post(format!("{}/oauth/v2/token", self.accounts_base_url))
            .form(&[
                ("refresh_token", self.refresh_token.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?
            .error_for_status()?;

        let body: TokenResponse = response.json().await?;
        let token = match (body.access_token, body.error) {
            (Some(token), _) => token,
            (None, Some(err)) => return Err(TokenError::Refresh(err)),
            (None, None) => return Err(TokenError::Refresh("no access_token in response".into())),
        };

        let lifetime = body.expires_in.unwrap_or(3600);
        cached.access_token = Some(token.clone());
        cached.expires_at = Some(Utc::now() + chrono::Duration::seconds(lifetime));
        Ok(token)
    }
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// Remote record shapes
// ---------------------------------------------------------------------------

/// Owner / related-record references arrive either as `{id, name}` objects
/// or as bare strings depending on the module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameRef {
    Record {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        name: Option<String>,
    },
    Text(String),
}

impl NameRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            NameRef::Record { id, .. } => id.as_deref(),
            NameRef::Text(_) => None,
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            NameRef::Record { name, .. } => name.as_deref(),
            NameRef::Text(text) => Some(text.as_str()),
        }
    }

    /// Record id, treating a bare-string reference as the id itself (the
    /// remote sends `What_Id` both ways).
    pub fn id_or_text(&self) -> Option<&str> {
        match self {
            NameRef::Record { id, .. } => id.as_deref(),
            NameRef::Text(text) => Some(text.as_str()),
        }
    }
}

/// Booleans arrive as JSON bools, "true"/"yes"/"1" strings, or numbers.
fn de_flex_bool<'de, D: Deserializer<'de>>(de: D) -> Result<Option<bool>, D::Error> {
    let value = Option::<serde_json::Value>::deserialize(de)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::Bool(b)) => Some(b),
        Some(serde_json::Value::String(s)) => {
            Some(matches!(s.to_lowercase().as_str(), "true" | "yes" | "1"))
        }
        Some(serde_json::Value::Number(n)) => Some(n.as_i64().unwrap_or(0) != 0),
        Some(_) => None,
    })
}

/// Timestamps arrive as RFC 3339 with offset; anything unparseable is None.
fn de_flex_datetime<'de, D: Deserializer<'de>>(de: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    let value = Option::<String>::deserialize(de)?;
    Ok(value.as_deref().and_then(parse_remote_datetime))
}

pub fn parse_remote_datetime(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// One Leads-module record, as requested by [`LEAD_FIELDS`]. Unknown remote
/// fields are ignored; absent ones default to None.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadRecord {
    pub id: Option<String>,
    #[serde(rename = "First_Name", default)]
    pub first_name: Option<String>,
    #[serde(rename = "Last_Name", default)]
    pub last_name: Option<String>,
    #[serde(rename = "Email", default)]
    pub email: Option<String>,
    #[serde(rename = "Phone", default)]
    pub phone: Option<String>,
    #[serde(rename = "Mobile", default)]
    pub mobile: Option<String>,
    #[serde(rename = "Lead_Status", default)]
    pub lead_status: Option<String>,
    #[serde(rename = "Tier_Level", default)]
    pub tier_level: Option<String>,
    #[serde(rename = "Language", default)]
    pub language: Option<String>,
    #[serde(rename = "Other_spoken_language_s", default)]
    pub other_languages: Option<String>,
    #[serde(rename = "Candidate_Recruitment_Owner", default)]
    pub recruitment_owner: Option<NameRef>,
    #[serde(rename = "Language_Assessment", default, deserialize_with = "de_flex_bool")]
    pub assessment_passed: Option<bool>,
    #[serde(rename = "BGV_Passed", default, deserialize_with = "de_flex_bool")]
    pub background_check_passed: Option<bool>,
    #[serde(rename = "Systems_Check_Approved", default, deserialize_with = "de_flex_bool")]
    pub specs_approved: Option<bool>,
    #[serde(rename = "Offer_Accepted", default, deserialize_with = "de_flex_bool")]
    pub offer_accepted: Option<bool>,
    #[serde(rename = "Last_Activity_Time", default, deserialize_with = "de_flex_datetime")]
    pub last_activity_time: Option<DateTime<Utc>>,
    #[serde(rename = "Modified_Time", default, deserialize_with = "de_flex_datetime")]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(rename = "Created_Time", default, deserialize_with = "de_flex_datetime")]
    pub created_time: Option<DateTime<Utc>>,
}

/// One Events-module record, as requested by [`EVENT_FIELDS`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Option<String>,
    #[serde(rename = "Event_Title", default)]
    pub event_title: Option<String>,
    #[serde(rename = "Subject", default)]
    pub subject: Option<String>,
    #[serde(rename = "Start_DateTime", default, deserialize_with = "de_flex_datetime")]
    pub start_at: Option<DateTime<Utc>>,
    #[serde(rename = "End_DateTime", default, deserialize_with = "de_flex_datetime")]
    pub end_at: Option<DateTime<Utc>>,
    #[serde(rename = "What_Id", default)]
    pub related_record: Option<NameRef>,
    #[serde(rename = "Owner", default)]
    pub owner: Option<NameRef>,
    #[serde(rename = "Participants", default)]
    pub participants: Vec<EventParticipant>,
    #[serde(rename = "Check_In_Status", default)]
    pub check_in_status: Option<String>,
    #[serde(rename = "Description", default)]
    pub description: Option<String>,
}

/// One entry of the Participants list; only the contact email matters here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventParticipant {
    #[serde(rename = "Email", default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl EventRecord {
    /// Display title; the Subject field backfills an empty Event_Title.
    pub fn title(&self) -> &str {
        self.event_title
            .as_deref()
            .filter(|t| !t.is_empty())
            .or(self.subject.as_deref())
            .unwrap_or("")
    }

    /// First participant email, for candidate resolution when the related
    /// record reference is missing.
    pub fn participant_email(&self) -> Option<&str> {
        self.participants
            .iter()
            .filter_map(|p| p.email.as_deref())
            .find(|email| !email.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct RecordPage<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
    #[serde(default)]
    info: PageInfo,
}

#[derive(Debug, Default, Deserialize)]
struct PageInfo {
    #[serde(default)]
    more_records: bool,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CrmConfig {
    pub api_base_url: String,
    pub accounts_base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    pub http_timeout_secs: u64,
}

impl CrmConfig {
    pub fn from_env() -> Self {
        Self {
            api_base_url: std::env::var("CPS_CRM_API_URL")
                .unwrap_or_else(|_| "https://crm.example.com/api/v2".to_string()),
            accounts_base_url: std::env::var("CPS_CRM_ACCOUNTS_URL")
                .unwrap_or_else(|_| "https://accounts.example.com".to_string()),
            client_id: std::env::var("CPS_CRM_CLIENT_ID").unwrap_or_default(),
            client_secret: std::env::var("CPS_CRM_CLIENT_SECRET").unwrap_or_default(),
            refresh_token: std::env::var("CPS_CRM_REFRESH_TOKEN").unwrap_or_default(),
            http_timeout_secs: std::env::var("CPS_CRM_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }
}

/// Authenticated accessor for the remote Leads and Events modules.
///
/// Network I/O only; never touches local state. Each call obtains a fresh
/// bearer token from the provider and retries transient failures per
/// [`BackoffPolicy`] before surfacing a page-level error.
pub struct CrmClient {
    api_base_url: String,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    backoff: BackoffPolicy,
}

impl CrmClient {
    pub fn new(
        config: &CrmConfig,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        Ok(Self {
            api_base_url: config.api_base_url.clone(),
            http,
            tokens,
            backoff: BackoffPolicy::default(),
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build an OAuth-backed client from config.
    pub fn from_config(config: &CrmConfig) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()?;
        let tokens = Arc::new(OAuthTokenProvider::new(
            config.accounts_base_url.clone(),
            config.client_id.clone(),
            config.client_secret.clone(),
            config.refresh_token.clone(),
            http,
        ));
        Self::new(config, tokens)
    }

    /// Fetch one page of the Leads module. Returns the records and whether
    /// more pages remain.
    pub async fn fetch_leads(&self, page: u32) -> Result<(Vec<LeadRecord>, bool), CrmError> {
        self.get_records("Leads", page, LEAD_FIELDS)
            .instrument(info_span!("fetch_leads", page))
            .await
    }

    /// Fetch one page of the Events module.
    pub async fn fetch_events(&self, page: u32) -> Result<(Vec<EventRecord>, bool), CrmError> {
        self.get_records("Events", page, EVENT_FIELDS)
            .instrument(info_span!("fetch_events", page))
            .await
    }

    async fn get_records<T: DeserializeOwned>(
        &self,
        module: &str,
        page: u32,
        fields: &str,
    ) -> Result<(Vec<T>, bool), CrmError> {
        let url = format!("{}/{}", self.api_base_url, module);
        let page_param = page.to_string();
        let per_page = PAGE_SIZE.to_string();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            // Token first: auth failures are terminal, not retried here.
            let token = self.tokens.get_valid_token().await?;

            let result = self
                .http
                .get(&url)
                .bearer_auth(&token)
                .query(&[
                    ("page", page_param.as_str()),
                    ("per_page", per_page.as_str()),
                    ("fields", fields),
                ])
                .send()
                .await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    // 204: no records in this module, pagination is done.
                    if status == StatusCode::NO_CONTENT {
                        return Ok((Vec::new(), false));
                    }
                    if status.is_success() {
                        let body: RecordPage<T> = resp.json().await?;
                        return Ok((body.data, body.info.more_records));
                    }
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(CrmError::HttpStatus {
                        status: status.as_u16(),
                        url: url.clone(),
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(CrmError::Request(err));
                }
            }
        }

        Err(CrmError::Request(
            last_request_error.expect("retry loop captures a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn retryable_status_classification() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }

    #[test]
    fn lead_record_tolerates_flexible_types() {
        let raw = serde_json::json!({
            "id": "4876000001",
            "First_Name": "Maria",
            "Last_Name": "Santos",
            "Lead_Status": "Tier 2",
            "Tier_Level": "Tier 2",
            "BGV_Passed": "yes",
            "Offer_Accepted": true,
            "Systems_Check_Approved": null,
            "Candidate_Recruitment_Owner": {"id": "99", "name": "A. Recruiter"},
            "Created_Time": "2026-08-01T09:30:00+00:00",
            "Modified_Time": "not a date",
            "Unmodeled_Field": 42
        });
        let lead: LeadRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(lead.id.as_deref(), Some("4876000001"));
        assert_eq!(lead.background_check_passed, Some(true));
        assert_eq!(lead.offer_accepted, Some(true));
        assert_eq!(lead.specs_approved, None);
        assert_eq!(lead.recruitment_owner.as_ref().unwrap().name(), Some("A. Recruiter"));
        assert!(lead.created_time.is_some());
        assert!(lead.modified_time.is_none());
    }

    #[test]
    fn event_title_falls_back_to_subject() {
        let raw = serde_json::json!({
            "id": "evt-1",
            "Subject": "Phone Screen - J. Doe",
            "What_Id": "4876000001",
            "Start_DateTime": "2026-08-20T15:00:00Z"
        });
        let event: EventRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(event.title(), "Phone Screen - J. Doe");
        // bare-string What_Id: no structured id, but the text is the id
        assert_eq!(event.related_record.as_ref().unwrap().id(), None);
        assert_eq!(
            event.related_record.as_ref().unwrap().id_or_text(),
            Some("4876000001")
        );
        assert!(event.start_at.is_some());
    }

    #[test]
    fn participant_email_skips_blank_entries() {
        let raw = serde_json::json!({
            "id": "evt-2",
            "Event_Title": "Interview - M. Santos",
            "Participants": [
                {"name": "M. Santos", "Email": ""},
                {"name": "M. Santos", "Email": "m.santos@example.com"}
            ]
        });
        let event: EventRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(event.participant_email(), Some("m.santos@example.com"));
        assert_eq!(EventRecord::default().participant_email(), None);
    }

    #[test]
    fn record_page_defaults_to_no_more_records() {
        let page: RecordPage<LeadRecord> = serde_json::from_str("{\"data\": []}").unwrap();
        assert!(page.data.is_empty());
        assert!(!page.info.more_records);
    }

    #[tokio::test]
    async fn static_token_provider_returns_token() {
        let provider = StaticTokenProvider::new("tok");
        assert_eq!(provider.get_valid_token().await.unwrap(), "tok");
    }

    #[test]
    fn cached_token_expiry_margin() {
        let now = Utc::now();
        let cached = CachedToken {
            access_token: Some("tok".into()),
            expires_at: Some(now + chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS - 5)),
        };
        assert!(OAuthTokenProvider::still_valid(&cached, now).is_none());

        let cached = CachedToken {
            access_token: Some("tok".into()),
            expires_at: Some(now + chrono::Duration::seconds(TOKEN_EXPIRY_MARGIN_SECS + 60)),
        };
        assert_eq!(OAuthTokenProvider::still_valid(&cached, now).as_deref(), Some("tok"));
    }
}
