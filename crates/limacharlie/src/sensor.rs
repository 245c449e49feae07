//! Per-sensor operations: tasking, tracked requests, tags and history.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{OnceCell, oneshot};
use tracing::debug;

use crate::api::params::Params;
use crate::api::tracking::generate_tracking_id;
use crate::compression::inflate_field;
use crate::error::{ApiError, Result};
use crate::manager::Session;
use crate::{CallOptions, Method};

const PLATFORM_WINDOWS: u32 = 0x1000_0000;
const PLATFORM_LINUX: u32 = 0x2000_0000;
const PLATFORM_MACOS: u32 = 0x3000_0000;
const PLATFORM_ANDROID: u32 = 0x5000_0000;
const ARCH_CHROME: u32 = 0x0000_0006;

const SPECIFIC_EVENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Sensor metadata as returned by `GET /<sid>`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SensorInfo {
    pub oid: String,
    pub iid: String,
    pub sid: String,
    pub plat: u32,
    pub arch: u32,
    pub hostname: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl SensorInfo {
    /// `oid.iid.sid.<plat hex>.arch`
    pub fn aid(&self) -> String {
        format!(
            "{}.{}.{}.{:x}.{}",
            self.oid, self.iid, self.sid, self.plat, self.arch
        )
    }

    pub fn platform(&self) -> Platform {
        if self.arch == ARCH_CHROME {
            return Platform::Chrome;
        }
        match self.plat {
            PLATFORM_WINDOWS => Platform::Windows,
            PLATFORM_LINUX => Platform::Linux,
            PLATFORM_MACOS => Platform::MacOs,
            PLATFORM_ANDROID => Platform::Android,
            other => Platform::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Linux,
    MacOs,
    Android,
    /// ChromeOS, identified by architecture rather than platform.
    Chrome,
    Other(u32),
}

/// Handle to one sensor of the manager's org.
pub struct Sensor {
    session: Arc<Session>,
    sid: String,
    investigation_id: Option<String>,
    info: OnceCell<SensorInfo>,
}

impl Sensor {
    pub(crate) fn new(session: Arc<Session>, sid: String, investigation_id: Option<String>) -> Self {
        Self {
            session,
            sid,
            investigation_id,
            info: OnceCell::new(),
        }
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn investigation_id(&self) -> Option<&str> {
        self.investigation_id.as_deref()
    }

    pub fn set_investigation_id(&mut self, inv_id: impl Into<String>) {
        self.investigation_id = Some(inv_id.into());
    }

    /// Send one or more commands to the sensor.
    ///
    /// `inv_id` tags the responses; it defaults to this handle's
    /// investigation.
    pub async fn task<I, S>(&self, tasks: I, inv_id: Option<&str>) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let params = Params::new()
            .with_all("tasks", tasks)
            .with_opt("investigation_id", inv_id.or(self.investigation_id.as_deref()));
        self.session
            .client
            .execute(&self.sid, Method::POST, &params, &CallOptions::default())
            .await
    }

    /// Task the sensor and route the correlated response to `handler`.
    ///
    /// The handler fires at most once, and never if no response arrives
    /// within the feed's callback TTL. Requires an interactive manager.
    pub async fn request<I, S>(
        &self,
        tasks: I,
        handler: impl FnOnce(Value) + Send + 'static,
    ) -> Result<Value>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let (feed, inv_id) = match (&self.session.feed, &self.session.investigation_id) {
            (Some(feed), Some(inv_id)) => (feed, inv_id),
            _ => {
                return Err(ApiError::Configuration(
                    "manager is not interactive, cannot track responses".to_string(),
                ));
            }
        };
        let tracking_id = generate_tracking_id(inv_id);
        debug!("Tracking request to {} as {tracking_id}", self.sid);
        feed.register_specific_callback(tracking_id.clone(), feed.callback_ttl(), handler);
        self.task(tasks, Some(&tracking_id)).await
    }

    /// Like [`request`](Self::request), but hands the response back through
    /// a channel. The receiver errors if the registration expires first.
    pub async fn request_response<I, S>(&self, tasks: I) -> Result<oneshot::Receiver<Value>>
    where
        I: IntoIterator<Item = S>,
        S: ToString,
    {
        let (tx, rx) = oneshot::channel();
        self.request(tasks, move |event| {
            let _ = tx.send(event);
        })
        .await?;
        Ok(rx)
    }

    /// Apply `tag`, optionally expiring after `ttl`.
    pub async fn tag(&self, tag: &str, ttl: Option<Duration>) -> Result<Value> {
        let params = Params::new()
            .with("tags", tag)
            .with_opt("ttl", ttl.map(|t| t.as_secs()));
        self.session
            .client
            .post(&format!("{}/tags", self.sid), &params)
            .await
    }

    pub async fn untag(&self, tag: &str) -> Result<Value> {
        let params = Params::new().with("tag", tag);
        self.session
            .client
            .delete(&format!("{}/tags", self.sid), &params)
            .await
    }

    /// Tags currently applied to the sensor.
    pub async fn tags(&self) -> Result<Vec<String>> {
        let data = self
            .session
            .client
            .get(&format!("{}/tags", self.sid), &Params::new())
            .await?;
        let tags = data
            .get("tags")
            .and_then(|t| t.get(&self.sid))
            .and_then(Value::as_object)
            .ok_or_else(|| ApiError::MalformedResponse("tag listing missing sensor".into()))?;
        Ok(tags.keys().cloned().collect())
    }

    /// Sensor metadata, fetched on first use and cached on this handle.
    pub async fn info(&self) -> Result<&SensorInfo> {
        self.info
            .get_or_try_init(|| async {
                let data = self.session.client.get(&self.sid, &Params::new()).await?;
                let info = data
                    .get("info")
                    .cloned()
                    .ok_or_else(|| ApiError::MalformedResponse("sensor record missing `info`".into()))?;
                let info: SensorInfo = serde_json::from_value(info)?;
                Ok::<_, ApiError>(info)
            })
            .await
    }

    pub async fn hostname(&self) -> Result<Option<String>> {
        Ok(self.info().await?.hostname.clone())
    }

    pub async fn platform(&self) -> Result<Platform> {
        Ok(self.info().await?.platform())
    }

    pub async fn is_windows(&self) -> Result<bool> {
        Ok(self.info().await?.plat == PLATFORM_WINDOWS)
    }

    pub async fn is_linux(&self) -> Result<bool> {
        Ok(self.info().await?.plat == PLATFORM_LINUX)
    }

    pub async fn is_mac(&self) -> Result<bool> {
        Ok(self.info().await?.plat == PLATFORM_MACOS)
    }

    pub async fn is_android(&self) -> Result<bool> {
        Ok(self.info().await?.plat == PLATFORM_ANDROID)
    }

    pub async fn is_chrome(&self) -> Result<bool> {
        Ok(self.info().await?.arch == ARCH_CHROME)
    }

    pub async fn as_aid(&self) -> Result<String> {
        Ok(self.info().await?.aid())
    }

    /// Whether the sensor is connected right now. Always asks the service.
    pub async fn is_online(&self) -> Result<bool> {
        let data = self.session.client.get(&self.sid, &Params::new()).await?;
        Ok(match data.get("online") {
            Some(Value::Object(online)) => !online.contains_key("error"),
            Some(Value::Null) | Some(Value::Bool(false)) | None => false,
            Some(_) => true,
        })
    }

    /// Stored events for this sensor. `params` usually carries `start` and
    /// `end` (epoch seconds); the compressed `events` field comes back
    /// decoded.
    pub async fn historic_events(&self, mut params: Params) -> Result<Value> {
        params.set("is_compressed", "true");
        let mut data = self.session.client.get(&self.insight_path(""), &params).await?;
        inflate_field(&mut data, "events")?;
        Ok(data)
    }

    /// [`historic_events`](Self::historic_events) over a time window.
    pub async fn historic_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Value> {
        let params = Params::new()
            .with("start", start.timestamp())
            .with("end", end.timestamp());
        self.historic_events(params).await
    }

    /// One stored event by atom. `before` bounds the search (epoch seconds).
    pub async fn specific_event(&self, atom: &str, before: Option<i64>) -> Result<Value> {
        let params = Params::new().with_opt("before", before);
        let options = CallOptions::default().timeout(SPECIFIC_EVENT_TIMEOUT);
        self.session
            .client
            .execute(&self.insight_path(atom), Method::GET, &params, &options)
            .await
    }

    /// Event counts over time for this sensor.
    pub async fn historic_overview(&self, params: Params) -> Result<Value> {
        let data = self
            .session
            .client
            .get(&self.insight_path("overview"), &params)
            .await?;
        Ok(data.get("overview").cloned().unwrap_or(Value::Null))
    }

    fn insight_path(&self, suffix: &str) -> String {
        let base = format!("insight/{}/{}", self.session.org_id(), self.sid);
        if suffix.is_empty() {
            base
        } else {
            format!("{base}/{suffix}")
        }
    }
}

impl std::fmt::Debug for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sensor")
            .field("sid", &self.sid)
            .field("investigation_id", &self.investigation_id)
            .field("info", &self.info.get())
            .finish()
    }
}
