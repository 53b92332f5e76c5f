//! minimal admin API over tiny_http

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use derive_more::{Display, Error, From};
use serde_derive::Deserialize;
use tiny_http::{Method, Request, Response, ResponseBox, Server};

use crate::monitor::Monitor;
use crate::offload::maps::{RuntimeConfigMap, RUNTIME_CONFIG_DRYRUN};
use crate::receiver::watcher::MetricsStore;
use crate::shutdown::ShutdownToken;

const API_PREFIX: &str = "/api/v1.0";

#[derive(Debug, Display, From, Error)]
pub enum WebError {
    Io(std::io::Error),
    Json(serde_json::Error),
    Map(crate::offload::maps::MapError),
    #[display(fmt = "not found")]
    NotFound,
}

type Result<T> = std::result::Result<T, WebError>;

/// Body of `POST /offloader/control/bpf`: either the dry-run shortcut,
/// one explicit slot write, or a full slot vector starting at zero.
#[derive(Debug, Default, Deserialize)]
pub struct ControlBpfRequest {
    pub dryrun: Option<bool>,
    pub option: Option<u32>,
    pub value: Option<u32>,
    #[serde(default)]
    pub values: Vec<u32>,
}

pub struct WebServer {
    listen: String,
    store: Arc<MetricsStore>,
    monitor: Arc<Monitor>,
    pin_path: PathBuf,
}

impl WebServer {
    pub fn new(
        listen: &str,
        store: Arc<MetricsStore>,
        monitor: Arc<Monitor>,
        pin_path: PathBuf,
    ) -> WebServer {
        WebServer {
            listen: listen.to_string(),
            store,
            monitor,
            pin_path,
        }
    }

    /// Serve until shutdown. Binding failures only log; the admin
    /// surface is not load bearing for the pipeline.
    pub fn run(&self, shutdown: ShutdownToken) {
        let id = "(api) (server)";

        let server = match Server::http(&self.listen) {
            Ok(server) => server,
            Err(e) => {
                log::error!("{} failed to bind '{}': {}", id, self.listen, e);
                return;
            }
        };

        log::info!("{} listening on '{}'", id, self.listen);

        loop {
            if shutdown.is_shutdown() {
                log::debug!("{} context stop on api server", id);
                return;
            }

            let request = match server.recv_timeout(Duration::from_millis(500)) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("{} recv error: {}", id, e);
                    continue;
                }
            };

            self.handle(request);
        }
    }

    fn handle(&self, mut request: Request) {
        let id = "(api) (request)";

        let response = match self.route(&mut request) {
            Ok(response) => response,
            Err(WebError::NotFound) => json_response(404, "{\"error\":\"not found\"}"),
            Err(e) => {
                log::error!("{} error handling '{}': {}", id, request.url(), e);
                json_response(500, &format!("{{\"error\":\"{}\"}}", e))
            }
        };

        if let Err(e) = request.respond(response) {
            log::debug!("{} error sending response: {}", id, e);
        }
    }

    fn route(&self, request: &mut Request) -> Result<ResponseBox> {
        let url = request.url().to_string();
        let path = url.split('?').next().unwrap_or_default();

        let suffix = path.strip_prefix(API_PREFIX).ok_or(WebError::NotFound)?;
        let segments: Vec<&str> = suffix.split('/').filter(|s| !s.is_empty()).collect();

        match (request.method(), segments.as_slice()) {
            (Method::Get, ["ping"]) => Ok(json_response(200, "{\"status\":\"ok\"}")),

            (Method::Get, ["receiver", "metrics"]) => {
                Ok(json_response(200, &self.store.as_json()))
            }

            (Method::Get, ["metrics"]) => Ok(Response::from_string(crate::metrics::gather())
                .with_status_code(200)
                .boxed()),

            (Method::Get, ["monitor"]) => {
                let body = serde_json::to_string_pretty(&self.monitor.all())?;
                Ok(json_response(200, &body))
            }

            (Method::Get, ["monitor", check_id]) => match self.monitor.get(check_id) {
                Some(check) => {
                    let body = serde_json::to_string_pretty(&check)?;
                    Ok(json_response(200, &body))
                }
                None => Err(WebError::NotFound),
            },

            (Method::Post, ["offloader", "control", "bpf"]) => {
                let mut body = String::new();
                request.as_reader().read_to_string(&mut body)?;
                let control: ControlBpfRequest = serde_json::from_str(&body)?;
                self.control_bpf(&control)?;
                Ok(json_response(200, "{\"status\":\"ok\"}"))
            }

            _ => Err(WebError::NotFound),
        }
    }

    fn control_bpf(&self, control: &ControlBpfRequest) -> Result<()> {
        let id = "(api) (control) (bpf)";

        let mut runtime = RuntimeConfigMap::open_pinned(&self.pin_path)?;

        if let Some(dryrun) = control.dryrun {
            log::info!("{} setting dryrun to '{}'", id, dryrun);
            runtime.write_slot(RUNTIME_CONFIG_DRYRUN, dryrun as u32)?;
        }

        if let (Some(option), Some(value)) = (control.option, control.value) {
            log::info!("{} setting slot '{}' to '{}'", id, option, value);
            runtime.write_slot(option, value)?;
        }

        for (slot, value) in control.values.iter().enumerate() {
            runtime.write_slot(slot as u32, *value)?;
        }

        Ok(())
    }
}

fn json_response(status: u16, body: &str) -> ResponseBox {
    Response::from_string(body)
        .with_status_code(status)
        .with_header::<tiny_http::Header>("Content-Type: application/json".parse().unwrap())
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_body_parses_all_shapes() {
        let control: ControlBpfRequest = serde_json::from_str("{\"dryrun\":true}").unwrap();
        assert_eq!(control.dryrun, Some(true));
        assert!(control.values.is_empty());

        let control: ControlBpfRequest =
            serde_json::from_str("{\"option\":2,\"value\":7}").unwrap();
        assert_eq!(control.option, Some(2));
        assert_eq!(control.value, Some(7));

        let control: ControlBpfRequest = serde_json::from_str("{\"values\":[1,0,3]}").unwrap();
        assert_eq!(control.values, vec![1, 0, 3]);
    }
}
