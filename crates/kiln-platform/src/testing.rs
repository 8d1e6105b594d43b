//! Test doubles for the loader contract.
//!
//! [`EchoLoader`] stands in for the real runtime in tests: every `get`
//! runs the cold start, records the descriptor it produced, and returns a
//! stub whose fetcher answers from the entry module's text. Two source
//! idioms are recognized so scenarios can script responses:
//!
//! - `new Response('body')` — respond 200 with `body`;
//! - `throw new Error('msg')` — respond 500 with an `x-worker-error`
//!   header, the shape the platform detects worker failures by.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use kiln_core::{Error, GatewayRequest, GatewayResponse, Result};

use crate::loader::{ColdStart, Fetcher, Loader, Stub, WorkerDescriptor};

/// Loader double that cold-starts on every `get`.
#[derive(Default)]
pub struct EchoLoader {
    cold_starts: AtomicUsize,
    last_descriptor: Mutex<Option<WorkerDescriptor>>,
    last_name: Mutex<Option<String>>,
}

impl EchoLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many cold starts have run.
    pub fn cold_starts(&self) -> usize {
        self.cold_starts.load(Ordering::SeqCst)
    }

    /// The descriptor produced by the most recent cold start.
    pub fn last_descriptor(&self) -> Option<WorkerDescriptor> {
        self.last_descriptor.lock().unwrap().clone()
    }

    /// The loader name passed to the most recent `get`.
    pub fn last_name(&self) -> Option<String> {
        self.last_name.lock().unwrap().clone()
    }
}

#[async_trait]
impl Loader for EchoLoader {
    async fn get(&self, name: &str, cold_start: Box<dyn ColdStart>) -> Result<Arc<dyn Stub>> {
        let descriptor = cold_start.prepare().await?;
        self.cold_starts.fetch_add(1, Ordering::SeqCst);
        *self.last_descriptor.lock().unwrap() = Some(descriptor.clone());
        *self.last_name.lock().unwrap() = Some(name.to_string());
        Ok(Arc::new(EchoStub {
            name: name.to_string(),
            descriptor,
        }))
    }
}

struct EchoStub {
    name: String,
    descriptor: WorkerDescriptor,
}

impl Stub for EchoStub {
    fn get_entrypoint(&self, name: Option<&str>) -> Result<Box<dyn Fetcher>> {
        Ok(Box::new(EchoFetcher {
            loader_name: self.name.clone(),
            entrypoint: name.map(str::to_string),
            descriptor: self.descriptor.clone(),
        }))
    }
}

struct EchoFetcher {
    loader_name: String,
    entrypoint: Option<String>,
    descriptor: WorkerDescriptor,
}

#[async_trait]
impl Fetcher for EchoFetcher {
    async fn dispatch(&self, _req: GatewayRequest) -> Result<GatewayResponse> {
        let main = self
            .descriptor
            .modules
            .get(&self.descriptor.main_module)
            .ok_or_else(|| Error::Loader("entry module missing from descriptor".to_string()))?;

        let mut response = if let Some(message) = extract_between(main, "throw new Error('", "')")
        {
            let mut response = GatewayResponse {
                status: 500,
                headers: Default::default(),
                body: Some(format!("Error: {message}")),
            };
            response
                .headers
                .insert("x-worker-error".to_string(), message.to_string());
            response
        } else if let Some(body) = extract_between(main, "new Response('", "')") {
            GatewayResponse::ok(body)
        } else {
            GatewayResponse::ok(main.clone())
        };

        response
            .headers
            .insert("x-loader-name".to_string(), self.loader_name.clone());
        if let Some(entrypoint) = &self.entrypoint {
            response
                .headers
                .insert("x-entrypoint".to_string(), entrypoint.clone());
        }
        Ok(response)
    }
}

fn extract_between<'a>(haystack: &'a str, start: &str, end: &str) -> Option<&'a str> {
    let from = haystack.find(start)? + start.len();
    let len = haystack[from..].find(end)?;
    Some(&haystack[from..from + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn descriptor(main: &str) -> WorkerDescriptor {
        WorkerDescriptor {
            main_module: "index.ts".to_string(),
            modules: BTreeMap::from([("index.ts".to_string(), main.to_string())]),
            compatibility_date: "2026-01-24".to_string(),
            compatibility_flags: Vec::new(),
            env: BTreeMap::new(),
            limits: None,
            global_outbound: None,
            tails: Vec::new(),
        }
    }

    struct FixedColdStart(WorkerDescriptor);

    #[async_trait]
    impl ColdStart for FixedColdStart {
        async fn prepare(&self) -> Result<WorkerDescriptor> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn echoes_scripted_response_bodies() {
        let loader = EchoLoader::new();
        let stub = loader
            .get(
                "acme:api:v1",
                Box::new(FixedColdStart(descriptor(
                    "export default{fetch(){return new Response('hi')}}",
                ))),
            )
            .await
            .unwrap();

        let response = stub
            .get_entrypoint(None)
            .unwrap()
            .dispatch(GatewayRequest::get("/"))
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body.as_deref(), Some("hi"));
        assert_eq!(loader.cold_starts(), 1);
        assert_eq!(loader.last_name().as_deref(), Some("acme:api:v1"));
    }

    #[tokio::test]
    async fn scripted_throw_becomes_worker_error() {
        let loader = EchoLoader::new();
        let stub = loader
            .get(
                "acme:api:v1",
                Box::new(FixedColdStart(descriptor("throw new Error('boom')"))),
            )
            .await
            .unwrap();

        let response = stub
            .get_entrypoint(None)
            .unwrap()
            .dispatch(GatewayRequest::get("/"))
            .await
            .unwrap();
        assert_eq!(response.status, 500);
        assert_eq!(
            response.headers.get("x-worker-error").map(String::as_str),
            Some("boom")
        );
    }
}
