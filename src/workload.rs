//! Smoke probe for the workload under test
//!
//! The workload serves `GET /ping` and `GET /cpu-intensive-task`; both must
//! answer 200 with a `"status": "success"` body before a load test is worth
//! running.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::common::{Error, Result};
use crate::poll::{poll_until, PollPolicy, Readiness};

pub const PING_PATH: &str = "/ping";
pub const CPU_TASK_PATH: &str = "/cpu-intensive-task";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct TaskBody {
    status: String,
    result: Option<String>,
}

/// What a successful probe observed
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    /// `result` exactly as served
    pub result: String,
    /// `result` parsed as a number
    pub value: f64,
}

/// HTTP client bound to one workload endpoint
#[derive(Debug, Clone)]
pub struct WorkloadProbe {
    client: reqwest::Client,
    base_url: String,
}

impl WorkloadProbe {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let url = self.url(path);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        let body = response.text().await?;
        debug!(%url, %status, %body, "workload response");

        if status != reqwest::StatusCode::OK {
            return Err(Error::probe_failed(&url, format!("HTTP {status}: {body}")));
        }
        serde_json::from_str(&body)
            .map_err(|e| Error::probe_failed(&url, format!("invalid JSON body {body:?}: {e}")))
    }

    /// `GET /ping` must return exactly `{"status":"success"}`
    pub async fn ping(&self) -> Result<()> {
        let body = self.get_json(PING_PATH).await?;
        if body != json!({"status": "success"}) {
            return Err(Error::probe_failed(
                &self.url(PING_PATH),
                format!("unexpected body {body}"),
            ));
        }
        Ok(())
    }

    /// `GET /cpu-intensive-task` must succeed with a numeric `result`
    pub async fn cpu_intensive_task(&self) -> Result<ProbeReport> {
        let url = self.url(CPU_TASK_PATH);
        let body = self.get_json(CPU_TASK_PATH).await?;
        let task: TaskBody = serde_json::from_value(body.clone())
            .map_err(|e| Error::probe_failed(&url, format!("unexpected body {body}: {e}")))?;

        if task.status != "success" {
            return Err(Error::probe_failed(&url, format!("status is {:?}", task.status)));
        }
        let result = task
            .result
            .ok_or_else(|| Error::probe_failed(&url, "response has no result"))?;
        let value = result
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| Error::probe_failed(&url, format!("result {result:?} is not a number")))?;
        Ok(ProbeReport { result, value })
    }

    /// Both endpoints, in order
    pub async fn probe(&self) -> Result<ProbeReport> {
        self.ping().await?;
        let report = self.cpu_intensive_task().await?;
        info!(url = %self.base_url, result = %report.result, "Workload answered");
        Ok(report)
    }

    /// Poll `/ping` until the workload accepts connections
    pub async fn wait_ready(&self, policy: &PollPolicy) -> Result<()> {
        let stage = format!("workload at {}", self.base_url);
        poll_until(&stage, policy, move || async move {
            Ok(match self.ping().await {
                Ok(()) => Readiness::Ready,
                Err(e) => Readiness::NotReady(e.to_string()),
            })
        })
        .await?
        .into_result(&stage)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve `responses` as (path, status, body) until the test ends
    async fn serve(responses: Vec<(&'static str, u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let mut request = vec![0u8; 4096];
                let read = socket.read(&mut request).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&request[..read]).to_string();
                let path = request.split_whitespace().nth(1).unwrap_or("/").to_string();
                let (status, body) = responses
                    .iter()
                    .find(|(p, _, _)| *p == path)
                    .map(|(_, s, b)| (*s, *b))
                    .unwrap_or((404, "{}"));
                let response = format!(
                    "HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_probe_healthy_workload() {
        let url = serve(vec![
            ("/ping", 200, r#"{"status":"success"}"#),
            ("/cpu-intensive-task", 200, r#"{"status":"success","result":"-253290.33"}"#),
        ])
        .await;
        let report = WorkloadProbe::new(url).unwrap().probe().await.unwrap();
        assert_eq!(report.result, "-253290.33");
        assert_eq!(report.value, -253290.33);
    }

    #[tokio::test]
    async fn test_ping_rejects_extra_fields() {
        let url = serve(vec![("/ping", 200, r#"{"status":"success","extra":1}"#)]).await;
        let err = WorkloadProbe::new(url).unwrap().ping().await.unwrap_err();
        assert!(matches!(err, Error::WorkloadProbe { .. }));
    }

    #[tokio::test]
    async fn test_non_numeric_result() {
        let url = serve(vec![(
            "/cpu-intensive-task",
            200,
            r#"{"status":"success","result":"NaN-ish"}"#,
        )])
        .await;
        let err = WorkloadProbe::new(url)
            .unwrap()
            .cpu_intensive_task()
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not a number"));
    }

    #[tokio::test]
    async fn test_http_error_status() {
        let url = serve(vec![("/ping", 503, r#"{"status":"starting"}"#)]).await;
        let err = WorkloadProbe::new(url).unwrap().ping().await.unwrap_err();
        assert!(err.to_string().contains("HTTP 503"));
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let url = serve(vec![]).await;
        let probe = WorkloadProbe::new(url).unwrap();
        let err = probe
            .wait_ready(&PollPolicy::new(2, Duration::from_millis(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SetupTimeout { attempts: 2, .. }));
    }
}
