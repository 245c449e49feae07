//! Org resources addressed by name or id: payloads, jobs and incidents.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::api::params::Params;
use crate::api::retry;
use crate::compression::inflate_field;
use crate::error::{ApiError, Result};
use crate::manager::Session;
use crate::{classify_transport, remote_message};

const PAYLOAD_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Files stored in the org for sensors to fetch.
pub struct Payloads {
    session: Arc<Session>,
}

impl Payloads {
    pub(crate) fn new(session: Arc<Session>) -> Self {
        Self { session }
    }

    fn path(&self, name: Option<&str>) -> String {
        match name {
            Some(name) => format!("payload/{}/{name}", self.session.org_id()),
            None => format!("payload/{}", self.session.org_id()),
        }
    }

    pub async fn list(&self) -> Result<Value> {
        self.session.client.get(&self.path(None), &Params::new()).await
    }

    /// Download a payload's content through its signed URL. `None` when the
    /// service returns no URL.
    pub async fn get(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let data = self
            .session
            .client
            .get(&self.path(Some(name)), &Params::new())
            .await?;
        let Some(url) = data.get("get_url").and_then(Value::as_str) else {
            return Ok(None);
        };

        debug!("Downloading payload {name}");
        let resp = self
            .session
            .client
            .http()
            .get(url)
            .timeout(PAYLOAD_DOWNLOAD_TIMEOUT)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(retry::classify_status(
                status.as_u16(),
                remote_message(&text, status),
            ));
        }
        let bytes = resp.bytes().await.map_err(|e| classify_transport(&e))?;
        Ok(Some(bytes.to_vec()))
    }

    /// Register a payload name; returns the signed URL to upload to.
    pub async fn create(&self, name: &str) -> Result<Option<String>> {
        let data = self
            .session
            .client
            .post(&self.path(Some(name)), &Params::new())
            .await?;
        Ok(data.get("put_url").and_then(Value::as_str).map(str::to_owned))
    }

    pub async fn delete(&self, name: &str) -> Result<Value> {
        self.session
            .client
            .delete(&self.path(Some(name)), &Params::new())
            .await
    }
}

/// Fetch `<kind>/<oid>/<id>` compressed and replace `record` with the
/// decoded `field`.
async fn reload_record(
    session: &Session,
    kind: &str,
    id: &str,
    field: &str,
    with_data: bool,
) -> Result<Value> {
    let params = Params::new()
        .with("is_compressed", "true")
        .with("with_data", with_data);
    let path = format!("{kind}/{}/{id}", session.org_id());
    let mut data = session.client.get(&path, &params).await?;
    inflate_field(&mut data, field)?;
    match data.get_mut(field).map(Value::take) {
        Some(record) if !record.is_null() => Ok(record),
        _ => Err(ApiError::MalformedResponse(format!(
            "{kind} response missing `{field}`"
        ))),
    }
}

fn record_id<'a>(data: &'a Value, key: &str) -> Result<&'a str> {
    data.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ApiError::Configuration(format!("record has no `{key}`")))
}

/// A service-side job (e.g. a Service run across sensors).
#[derive(Clone)]
pub struct Job {
    session: Arc<Session>,
    pub data: Value,
}

impl Job {
    pub(crate) fn new(session: Arc<Session>, data: Value) -> Self {
        Self { session, data }
    }

    pub fn id(&self) -> Result<&str> {
        record_id(&self.data, "job_id")
    }

    /// Refresh `data` from the service, optionally with the job's output.
    pub async fn reload(&mut self, with_data: bool) -> Result<()> {
        let id = self.id()?.to_owned();
        self.data = reload_record(&self.session, "job", &id, "job", with_data).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<Value> {
        let path = format!("job/{}/{}", self.session.org_id(), self.id()?);
        self.session.client.delete(&path, &Params::new()).await
    }
}

/// An incident raised in the org.
#[derive(Clone)]
pub struct Incident {
    session: Arc<Session>,
    pub data: Value,
}

impl Incident {
    pub(crate) fn new(session: Arc<Session>, data: Value) -> Self {
        Self { session, data }
    }

    pub fn id(&self) -> Result<&str> {
        record_id(&self.data, "incident_id")
    }

    /// Change the incident's DEFCON level, then reload it.
    pub async fn set_defcon(&mut self, defcon: u8) -> Result<Value> {
        let path = format!("incident/{}/{}", self.session.org_id(), self.id()?);
        let params = Params::new().with("defcon", defcon);
        let response = self.session.client.post(&path, &params).await?;
        self.data["defcon"] = Value::from(defcon);
        let with_data = self.data.get("record").is_some_and(|r| !r.is_null());
        self.reload(with_data).await?;
        Ok(response)
    }

    pub async fn reload(&mut self, with_data: bool) -> Result<()> {
        let id = self.id()?.to_owned();
        self.data = reload_record(&self.session, "incident", &id, "incident", with_data).await?;
        Ok(())
    }

    pub async fn delete(&self) -> Result<Value> {
        let path = format!("incident/{}/{}", self.session.org_id(), self.id()?);
        self.session.client.delete(&path, &Params::new()).await
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job").field("data", &self.data).finish()
    }
}

impl std::fmt::Debug for Incident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Incident").field("data", &self.data).finish()
    }
}
