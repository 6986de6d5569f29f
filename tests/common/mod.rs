//! Shared test doubles: an in-memory registry and a scripted round-tripper.
#![allow(dead_code)]

use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};
use portico::ports::{
    http_client::{HttpClient, HttpClientResult},
    registry::{
        Registry, RegistryError, RegistryNode, RegistryResponse, RegistryResult, RegistryWatcher,
        SetOptions,
    },
};

/// In-memory registry holding leaf keys. Reads reconstruct the directory
/// tree on demand; writes are recorded for assertions.
#[derive(Default)]
pub struct MockRegistry {
    leaves: Mutex<BTreeMap<String, String>>,
    index: AtomicU64,
    pub get_calls: Mutex<Vec<String>>,
    pub set_calls: Mutex<Vec<(String, String)>>,
}

impl MockRegistry {
    pub fn new() -> Self {
        Self {
            index: AtomicU64::new(10),
            ..Self::default()
        }
    }

    /// Seed or replace a leaf key.
    pub fn put(&self, key: &str, value: &str) {
        self.leaves
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
    }

    /// Drop a leaf key.
    pub fn delete(&self, key: &str) {
        self.leaves.lock().unwrap().remove(key);
    }

    pub fn reset_counters(&self) {
        self.get_calls.lock().unwrap().clear();
        self.set_calls.lock().unwrap().clear();
    }

    fn build_node(prefix: &str, leaves: &BTreeMap<String, String>) -> RegistryNode {
        let child_prefix = format!("{prefix}/");
        let mut segments: Vec<String> = Vec::new();
        for key in leaves.keys() {
            if let Some(rest) = key.strip_prefix(&child_prefix) {
                let segment = rest.split('/').next().unwrap_or("").to_string();
                if !segment.is_empty() && !segments.contains(&segment) {
                    segments.push(segment);
                }
            }
        }

        if segments.is_empty() {
            RegistryNode {
                key: prefix.to_string(),
                value: leaves.get(prefix).cloned(),
                dir: false,
                nodes: Vec::new(),
                modified_index: 1,
                created_index: 1,
            }
        } else {
            RegistryNode {
                key: prefix.to_string(),
                value: None,
                dir: true,
                nodes: segments
                    .iter()
                    .map(|segment| Self::build_node(&format!("{prefix}/{segment}"), leaves))
                    .collect(),
                modified_index: 1,
                created_index: 1,
            }
        }
    }
}

#[async_trait]
impl Registry for MockRegistry {
    async fn get(&self, key: &str, _recursive: bool) -> RegistryResult<RegistryResponse> {
        self.get_calls.lock().unwrap().push(key.to_string());
        let leaves = self.leaves.lock().unwrap();
        let child_prefix = format!("{key}/");
        let exists = leaves.contains_key(key) || leaves.keys().any(|k| k.starts_with(&child_prefix));
        if !exists {
            return Err(RegistryError::KeyNotFound(key.to_string()));
        }
        Ok(RegistryResponse {
            node: Self::build_node(key, &leaves),
            index: self.index.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        _options: SetOptions,
    ) -> RegistryResult<RegistryResponse> {
        self.set_calls
            .lock()
            .unwrap()
            .push((key.to_string(), value.to_string()));
        self.put(key, value);
        Ok(RegistryResponse {
            node: RegistryNode {
                key: key.to_string(),
                value: Some(value.to_string()),
                ..RegistryNode::default()
            },
            index: self.index.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn watch(
        &self,
        _key: &str,
        _after_index: u64,
    ) -> RegistryResult<Box<dyn RegistryWatcher>> {
        Err(RegistryError::Cluster(
            "mock registry does not stream events".to_string(),
        ))
    }
}

/// Round-tripper that records outbound requests and answers from a script.
pub struct ScriptedClient {
    pub seen: Mutex<Vec<Request<Body>>>,
    reply: Box<dyn Fn() -> HttpClientResult<Response<Body>> + Send + Sync>,
}

impl ScriptedClient {
    pub fn replying(
        reply: impl Fn() -> HttpClientResult<Response<Body>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            seen: Mutex::new(Vec::new()),
            reply: Box::new(reply),
        }
    }

    /// Authorities (`host:port`) of every request seen so far.
    pub fn seen_authorities(&self) -> Vec<String> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|req| {
                req.uri()
                    .authority()
                    .map(|a| a.to_string())
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[async_trait]
impl HttpClient for ScriptedClient {
    async fn round_trip(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        self.seen.lock().unwrap().push(req);
        (self.reply)()
    }
}
