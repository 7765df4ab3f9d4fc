use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace};

use crate::error::RemoteError;
use crate::logger::{MessageLogMode, MessageLogger};
use crate::protocol::{
    ac_state_body, api_url, error_message, parse_result, pod_path, property_body,
    sync_power_body, timer_body, timer_state, toggle_body, ApiVersion, CAPABILITY_FIELDS,
    DEFAULT_BASE_URL, FLEET_FIELDS, LISTING_FIELDS, MAX_TIMER_MINUTES, SNAPSHOT_FIELDS,
    TIMER_FIELDS,
};
use crate::types::*;
use crate::{Error, Result};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct SensiboClientBuilder {
    api_key: String,
    base_url: String,
    timeout: Duration,
    log_mode: Option<MessageLogMode>,
    log_path: Option<PathBuf>,
}

impl SensiboClientBuilder {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout: DEFAULT_TIMEOUT,
            log_mode: None,
            log_path: None,
        }
    }

    /// Root of the API, without the version segment.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn message_log(mut self, mode: MessageLogMode, path: impl Into<PathBuf>) -> Self {
        self.log_mode = Some(mode);
        self.log_path = Some(path.into());
        self
    }

    pub fn build(self) -> Result<SensiboClient> {
        let http = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()?;

        let logger = match (self.log_mode, self.log_path) {
            (Some(mode), Some(path)) => Some(Arc::new(Mutex::new(MessageLogger::new(mode, path)?))),
            _ => None,
        };

        Ok(SensiboClient {
            http,
            base_url: self.base_url,
            api_key: self.api_key,
            logger,
        })
    }
}

/// Stateless façade over the Sensibo cloud API for one account.
///
/// Cheap to clone; clones share the connection pool and the wire log.
/// Nothing is retried here, retry policy belongs to the scheduler.
#[derive(Clone)]
pub struct SensiboClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    logger: Option<Arc<Mutex<MessageLogger>>>,
}

impl fmt::Debug for SensiboClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensiboClient")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TimerEnvelope {
    #[serde(default)]
    timer: Option<TimerDescriptor>,
}

impl SensiboClient {
    pub fn builder(api_key: impl Into<String>) -> SensiboClientBuilder {
        SensiboClientBuilder::new(api_key)
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Pods of the account with room and product model, used for discovery.
    pub async fn list_devices(&self) -> Result<Vec<PodSummary>> {
        self.get(ApiVersion::V2, "/users/me/pods", Some(LISTING_FIELDS), None)
            .await
    }

    pub async fn fetch_capabilities(&self, device_id: &str) -> Result<CapabilityReport> {
        self.get(ApiVersion::V2, &pod_path(device_id), Some(CAPABILITY_FIELDS), None)
            .await
    }

    pub async fn fetch_snapshot(&self, device_id: &str) -> Result<DeviceSnapshot> {
        let mut snapshot: DeviceSnapshot = self
            .get(
                ApiVersion::V2,
                &pod_path(device_id),
                Some(SNAPSHOT_FIELDS),
                Some(device_id),
            )
            .await?;
        if snapshot.id.is_empty() {
            snapshot.id = device_id.to_string();
        }
        Ok(snapshot)
    }

    /// Every pod under this account in one request.
    pub async fn fetch_fleet_snapshot(&self) -> Result<Vec<DeviceSnapshot>> {
        self.get(ApiVersion::V2, "/users/me/pods", Some(FLEET_FIELDS), Some("fleet"))
            .await
    }

    pub async fn fetch_timer(&self, device_id: &str) -> Result<Option<TimerDescriptor>> {
        let envelope: TimerEnvelope = self
            .get(ApiVersion::V1, &pod_path(device_id), Some(TIMER_FIELDS), None)
            .await?;
        Ok(envelope.timer)
    }

    /// Merge `partial` into `last_known` and send the full result. The merged
    /// state is returned so the caller can commit it once the call succeeded.
    pub async fn push_ac_state(
        &self,
        device_id: &str,
        last_known: &AcState,
        partial: &AcState,
    ) -> Result<AcState> {
        let state = last_known.merged(partial);
        let path = format!("{}/acStates", pod_path(device_id));
        self.send(
            Method::POST,
            ApiVersion::V2,
            &path,
            Some(ac_state_body(&state)),
            "push_ac_state",
            device_id,
        )
        .await?;
        Ok(state)
    }

    pub async fn push_ac_property(&self, device_id: &str, property: &str, value: Value) -> Result<()> {
        let path = format!("{}/acStates/{property}", pod_path(device_id));
        self.send(
            Method::PATCH,
            ApiVersion::V2,
            &path,
            Some(property_body(&value)),
            "push_ac_property",
            device_id,
        )
        .await
        .map(drop)
    }

    /// Correct the remote's idea of the power state without sending IR.
    pub async fn sync_power_state(&self, device_id: &str, on: bool) -> Result<()> {
        let path = format!("{}/acStates/on", pod_path(device_id));
        self.send(
            Method::PATCH,
            ApiVersion::V2,
            &path,
            Some(sync_power_body(on)),
            "sync_power_state",
            device_id,
        )
        .await
        .map(drop)
    }

    pub async fn set_scheduled_action(
        &self,
        device_id: &str,
        minutes_from_now: i64,
        partial: &AcState,
        last_known: &AcState,
    ) -> Result<TimerState> {
        validate_timer_request(minutes_from_now, partial)?;
        let state = timer_state(partial, last_known);
        let path = format!("{}/timer", pod_path(device_id));
        self.send(
            Method::PUT,
            ApiVersion::V1,
            &path,
            Some(timer_body(minutes_from_now, &state)),
            "set_timer",
            device_id,
        )
        .await?;
        Ok(TimerState::armed())
    }

    /// Succeeds when no timer exists.
    pub async fn clear_scheduled_action(&self, device_id: &str) -> Result<()> {
        let path = format!("{}/timer", pod_path(device_id));
        match self
            .send(Method::DELETE, ApiVersion::V1, &path, None, "clear_timer", device_id)
            .await
        {
            Ok(_) => Ok(()),
            Err(Error::Remote(e)) if e.status == Some(404) => {
                debug!(device = %device_id, "no timer to clear");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Newest first.
    pub async fn fetch_action_history(&self, device_id: &str, limit: u32) -> Result<Vec<HistoricalAction>> {
        let path = format!("{}/acStates", pod_path(device_id));
        let url = api_url(&self.base_url, ApiVersion::V2, &path);
        debug!(device = %device_id, limit, "fetching action history");
        self.log_request("GET", &path, None);
        let resp = self
            .http
            .get(&url)
            .query(&[("limit", limit.to_string())])
            .query(&[("apiKey", &self.api_key)])
            .send()
            .await?;
        let body = check(resp).await?;
        Ok(parse_result(&body)?)
    }

    pub async fn get_climate_react_settings(&self, device_id: &str) -> Result<SmartMode> {
        let path = format!("{}/smartmode", pod_path(device_id));
        self.get(ApiVersion::V2, &path, None, None).await
    }

    pub async fn set_climate_react_enabled(&self, device_id: &str, enabled: bool) -> Result<()> {
        let path = format!("{}/smartmode", pod_path(device_id));
        self.send(
            Method::PUT,
            ApiVersion::V2,
            &path,
            Some(toggle_body(enabled)),
            "set_climate_react",
            device_id,
        )
        .await
        .map(drop)
    }

    pub async fn set_pure_boost_enabled(&self, device_id: &str, enabled: bool) -> Result<()> {
        let path = format!("{}/pureboost", pod_path(device_id));
        self.send(
            Method::PUT,
            ApiVersion::V2,
            &path,
            Some(toggle_body(enabled)),
            "set_pure_boost",
            device_id,
        )
        .await
        .map(drop)
    }

    pub async fn reset_filter_indicator(&self, device_id: &str) -> Result<()> {
        let path = format!("{}/cleanFiltersNotification", pod_path(device_id));
        self.send(
            Method::DELETE,
            ApiVersion::V2,
            &path,
            None,
            "reset_filter_indicator",
            device_id,
        )
        .await
        .map(drop)
    }

    // -- Helpers --

    async fn get<T: DeserializeOwned>(
        &self,
        version: ApiVersion,
        path: &str,
        fields: Option<&str>,
        poll_key: Option<&str>,
    ) -> Result<T> {
        let url = api_url(&self.base_url, version, path);
        debug!(path = %path, fields = fields.unwrap_or(""), "GET");
        self.log_request("GET", path, None);

        let mut req = self.http.get(&url);
        if let Some(fields) = fields {
            req = req.query(&[("fields", fields)]);
        }
        let resp = req.query(&[("apiKey", &self.api_key)]).send().await?;
        let status = resp.status().as_u16();
        let body = check(resp).await?;

        if let (Some(key), Some(logger)) = (poll_key, &self.logger) {
            let json = serde_json::from_str(&body).unwrap_or(Value::Null);
            logger.lock().log_poll(key, status, &json);
        }

        trace!(path = %path, bytes = body.len(), "response received");
        Ok(parse_result(&body)?)
    }

    async fn send(
        &self,
        method: Method,
        version: ApiVersion,
        path: &str,
        body: Option<Value>,
        action: &str,
        device_id: &str,
    ) -> Result<String> {
        let url = api_url(&self.base_url, version, path);
        debug!(device = %device_id, action, method = %method, path = %path, "sending command");

        if let Some(ref logger) = self.logger {
            logger
                .lock()
                .log_command(action, device_id, body.as_ref().unwrap_or(&Value::Null));
        }

        let mut req = self
            .http
            .request(method, &url)
            .query(&[("apiKey", &self.api_key)]);
        if let Some(ref body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        Ok(check(resp).await?)
    }

    fn log_request(&self, method: &str, path: &str, body: Option<&Value>) {
        if let Some(ref logger) = self.logger {
            logger.lock().log_request(method, path, body);
        }
    }
}

/// Turn a non-2xx response into a [`RemoteError`] carrying status and message.
async fn check(resp: reqwest::Response) -> std::result::Result<String, RemoteError> {
    let status = resp.status();
    let body = resp.text().await?;
    if status.is_success() {
        return Ok(body);
    }
    let message = error_message(&body)
        .or_else(|| status.canonical_reason().map(str::to_string))
        .unwrap_or_else(|| "request failed".to_string());
    Err(RemoteError::from_status(status.as_u16(), message))
}

pub(crate) fn validate_timer_request(minutes_from_now: i64, partial: &AcState) -> Result<()> {
    if minutes_from_now <= 0 {
        return Err(Error::Validation(
            "minutes from now must be specified".to_string(),
        ));
    }
    if minutes_from_now > MAX_TIMER_MINUTES {
        return Err(Error::Validation(format!(
            "minutes from now cannot be larger than {MAX_TIMER_MINUTES}"
        )));
    }
    if partial.is_empty() {
        return Err(Error::Validation(
            "at least one parameter must be specified".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn partial() -> AcState {
        AcState {
            on: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn timer_minutes_bounds() {
        assert!(matches!(validate_timer_request(0, &partial()), Err(Error::Validation(_))));
        assert!(matches!(validate_timer_request(-5, &partial()), Err(Error::Validation(_))));
        assert!(matches!(validate_timer_request(1441, &partial()), Err(Error::Validation(_))));
        assert!(validate_timer_request(1, &partial()).is_ok());
        assert!(validate_timer_request(1440, &partial()).is_ok());
    }

    #[test]
    fn timer_requires_a_property() {
        let err = validate_timer_request(30, &AcState::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn debug_redacts_api_key() {
        let client = SensiboClient::builder("secret-key").build().unwrap();
        let printed = format!("{client:?}");
        assert!(!printed.contains("secret-key"));
        assert!(printed.contains("redacted"));
    }
}
