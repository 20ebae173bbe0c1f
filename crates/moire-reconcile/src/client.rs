//! [`SnapshotQuery`] over HTTP: `POST <base>/api/sql`.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::query::{QueryResponse, SnapshotQuery, SqlQuery, SqlRequest};

#[derive(Clone)]
pub struct HttpSnapshotQuery {
    base_url: String,
    agent: ureq::Agent,
}

impl HttpSnapshotQuery {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeouts(base_url, Duration::from_secs(2), Duration::from_secs(30))
    }

    pub fn with_timeouts(base_url: impl Into<String>, connect: Duration, read: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect)
            .timeout_read(read)
            .build();
        Self {
            base_url: base_url.into(),
            agent,
        }
    }

    pub fn sql_url(&self) -> String {
        format!("{}/api/sql", self.base_url.trim_end_matches('/'))
    }
}

impl std::fmt::Debug for HttpSnapshotQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSnapshotQuery")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SnapshotQuery for HttpSnapshotQuery {
    async fn query(&self, snapshot_id: i64, query: &SqlQuery) -> Result<QueryResponse, QueryError> {
        let body = serde_json::to_string(&SqlRequest {
            snapshot_id,
            sql: &query.sql,
            params: &query.params,
        })
        .map_err(|e| QueryError::Decode(format!("encode sql request: {e}")))?;
        let url = self.sql_url();
        let agent = self.agent.clone();
        debug!(snapshot_id, %url, param_count = query.params.len(), "posting sql query");

        let result = tokio::task::spawn_blocking(move || post_sql(&agent, &url, &body)).await?;
        match &result {
            Ok(response) if response.truncated => {
                warn!(snapshot_id, rows = response.rows.len(), "sql response truncated");
            }
            Ok(_) => {}
            Err(err) => warn!(snapshot_id, %err, "sql query failed"),
        }
        result
    }
}

fn post_sql(agent: &ureq::Agent, url: &str, body: &str) -> Result<QueryResponse, QueryError> {
    let response = match agent
        .post(url)
        .set("content-type", "application/json")
        .send_string(body)
    {
        Ok(response) => response,
        Err(ureq::Error::Status(status, response)) => {
            let text = response.into_string().unwrap_or_default();
            return Err(QueryError::from_status(status, &text));
        }
        Err(ureq::Error::Transport(error)) => {
            return Err(QueryError::Transport {
                url: url.to_string(),
                message: error.to_string(),
            });
        }
    };
    let text = response.into_string().map_err(|e| QueryError::Transport {
        url: url.to_string(),
        message: format!("read response body: {e}"),
    })?;
    serde_json::from_str::<QueryResponse>(&text)
        .map_err(|e| QueryError::Decode(format!("decode sql response: {e}")))
}
