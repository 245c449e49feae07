//! Org-level entry point: owns the REST client and, in interactive mode, the
//! event feed that carries tracked command responses.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tracing::{debug, info};

use crate::Client;
use crate::api::params::Params;
use crate::api::streaming::{ConnectionFilter, Feed, GeneralHandler};
use crate::config::{ClientConfig, FeedConfig};
use crate::credentials::{Credentials, TokenRenewal};
use crate::error::{ApiError, Result};
use crate::events::ErrorObserver;
use crate::resources::{Incident, Job, Payloads};
use crate::sensor::Sensor;

/// Everything a [`Manager`] is built from.
pub struct ManagerConfig {
    pub credentials: Credentials,
    /// Default investigation id for tasking; required in interactive mode.
    pub investigation_id: Option<String>,
    /// Open an event feed so [`Sensor::request`] can track responses.
    pub interactive: bool,
    pub client: ClientConfig,
    pub feed: FeedConfig,
    pub observer: Option<Arc<dyn ErrorObserver>>,
    /// Receives feed events that no tracked request claimed.
    pub event_handler: Option<GeneralHandler>,
}

impl ManagerConfig {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            investigation_id: None,
            interactive: false,
            client: ClientConfig::default(),
            feed: FeedConfig::default(),
            observer: None,
            event_handler: None,
        }
    }

    /// Credentials from `LC_OID` / `LC_API_KEY` / `LC_JWT`, plus an optional
    /// default investigation from `LC_INV_ID`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(Credentials::from_env()?);
        config.investigation_id = std::env::var("LC_INV_ID").ok().filter(|v| !v.is_empty());
        Ok(config)
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.credentials = self.credentials.and_api_key(api_key);
        self
    }

    pub fn with_renewal(mut self, renewal: Arc<dyn TokenRenewal>) -> Self {
        self.credentials = self.credentials.and_renewal(renewal);
        self
    }

    pub fn with_investigation(mut self, inv_id: impl Into<String>) -> Self {
        self.investigation_id = Some(inv_id.into());
        self
    }

    /// Enable the event feed for tracked requests under `inv_id`.
    pub fn interactive(mut self, inv_id: impl Into<String>) -> Self {
        self.interactive = true;
        self.investigation_id = Some(inv_id.into());
        self
    }

    pub fn with_client_config(mut self, client: ClientConfig) -> Self {
        self.client = client;
        self
    }

    pub fn with_feed_config(mut self, feed: FeedConfig) -> Self {
        self.feed = feed;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn ErrorObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_event_handler(mut self, handler: impl Fn(Value) + Send + Sync + 'static) -> Self {
        self.event_handler = Some(Arc::new(handler));
        self
    }
}

impl std::fmt::Debug for ManagerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerConfig")
            .field("credentials", &self.credentials)
            .field("investigation_id", &self.investigation_id)
            .field("interactive", &self.interactive)
            .field("client", &self.client)
            .field("feed", &self.feed)
            .finish_non_exhaustive()
    }
}

/// State shared by a [`Manager`] and every handle it hands out.
pub(crate) struct Session {
    pub(crate) client: Client,
    pub(crate) investigation_id: Option<String>,
    pub(crate) feed: Option<Feed>,
    continuation: Mutex<Option<String>>,
}

impl Session {
    pub(crate) fn org_id(&self) -> &str {
        self.client.credentials().org_id()
    }
}

/// Client for one org.
///
/// Cloning is cheap; clones share the client, the credential and the feed.
#[derive(Clone)]
pub struct Manager {
    session: Arc<Session>,
}

impl Manager {
    /// Build the client and, when interactive, start the event feed.
    ///
    /// Interactive mode spawns tasks and so must run inside a tokio runtime.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        if config.interactive && config.investigation_id.is_none() {
            return Err(ApiError::Configuration(
                "interactive mode requires an investigation id".to_string(),
            ));
        }

        let credentials = Arc::new(config.credentials);
        let mut client = Client::with_config(credentials.clone(), config.client)?;
        if let Some(observer) = &config.observer {
            client = client.with_observer(observer.clone());
        }

        let feed = match (&config.investigation_id, config.interactive) {
            (Some(inv_id), true) => {
                let filter = ConnectionFilter::new("event").investigation(inv_id);
                let mut builder = Feed::builder(filter).config(config.feed);
                if let Some(observer) = config.observer {
                    builder = builder.observer(observer);
                }
                if let Some(handler) = config.event_handler {
                    builder = builder.handler(move |event| handler(event));
                }
                info!("Starting interactive event feed for investigation {inv_id}");
                Some(builder.start(credentials)?)
            }
            _ => None,
        };

        Ok(Self {
            session: Arc::new(Session {
                client,
                investigation_id: config.investigation_id,
                feed,
                continuation: Mutex::new(None),
            }),
        })
    }

    pub fn org_id(&self) -> &str {
        self.session.org_id()
    }

    pub fn client(&self) -> &Client {
        &self.session.client
    }

    /// The interactive event feed, if any.
    pub fn feed(&self) -> Option<&Feed> {
        self.session.feed.as_ref()
    }

    pub fn investigation_id(&self) -> Option<&str> {
        self.session.investigation_id.as_deref()
    }

    pub fn is_interactive(&self) -> bool {
        self.session.feed.is_some()
    }

    /// Force a token renewal; `true` when the credential is good.
    pub async fn test_auth(&self) -> bool {
        self.session.client.refresh_token().await
    }

    /// Handle to one sensor. `inv_id` overrides the manager's default
    /// investigation for its tasking.
    pub fn sensor(&self, sid: impl Into<String>, inv_id: Option<&str>) -> Sensor {
        let inv_id = inv_id
            .map(str::to_owned)
            .or_else(|| self.session.investigation_id.clone());
        Sensor::new(self.session.clone(), sid.into(), inv_id)
    }

    /// List the org's sensors, one page at a time.
    ///
    /// With `is_next` the page after the previous call is fetched; once the
    /// listing is exhausted this returns an empty list without a request.
    pub async fn sensors(&self, inv_id: Option<&str>, is_next: bool) -> Result<Vec<Sensor>> {
        let mut params = Params::new();
        if is_next {
            let token = self
                .session
                .continuation
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            match token {
                Some(token) => params.push("continuation_token", token),
                None => return Ok(Vec::new()),
            }
        }

        let path = format!("sensors/{}", self.org_id());
        let data = self.session.client.get(&path, &params).await?;

        let next = data
            .get("continuation_token")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(str::to_owned);
        debug!("Sensor page fetched, more available: {}", next.is_some());
        *self
            .session
            .continuation
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = next;

        let sensors = data
            .get("sensors")
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::MalformedResponse("sensor list missing `sensors`".into()))?;
        Ok(sensors
            .iter()
            .filter_map(|s| s.get("sid").and_then(Value::as_str))
            .map(|sid| self.sensor(sid, inv_id))
            .collect())
    }

    pub fn payloads(&self) -> Payloads {
        Payloads::new(self.session.clone())
    }

    /// Wrap a job record (must carry `job_id`).
    pub fn job(&self, data: Value) -> Job {
        Job::new(self.session.clone(), data)
    }

    /// Wrap an incident record (must carry `incident_id`).
    pub fn incident(&self, data: Value) -> Incident {
        Incident::new(self.session.clone(), data)
    }

    /// Stop the event feed. Safe to call repeatedly or when not interactive.
    pub fn shutdown(&self) {
        if let Some(feed) = &self.session.feed {
            feed.shutdown();
        }
    }
}

impl std::fmt::Debug for Manager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("client", &self.session.client)
            .field("investigation_id", &self.session.investigation_id)
            .field("feed", &self.session.feed)
            .finish()
    }
}
