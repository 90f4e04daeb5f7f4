//! Dynamic fan-in broker: named child inputs added and removed at runtime.
//!
//! Children are constructed through an injected builder so that the broker
//! stays agnostic of connector wiring. Management handlers are registered
//! against the endpoint registry; the serving mux lives outside the engine.

use crate::endpoints::{EndpointRegistry, EndpointResponse};
use crate::error::{Error, Result};
use crate::input::StreamedInput;
use crate::shutdown::Signaller;
use crate::transaction::{transaction_channel, TransactionRx, TransactionTx};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Builds a child input from its name and raw configuration body.
pub type InputBuilder = Arc<dyn Fn(&str, &str) -> Result<Box<dyn StreamedInput>> + Send + Sync>;

const REMOVE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Fan-in broker whose children can change while the stream runs.
pub struct DynamicFanIn {
    transactions: Option<TransactionRx>,
    ctrl: Arc<DynCtrl>,
    shut_sig: Signaller,
}

struct DynCtrl {
    builder: InputBuilder,
    out_tx: Mutex<Option<TransactionTx>>,
    children: Mutex<HashMap<String, ChildEntry>>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    sig: Signaller,
}

struct ChildEntry {
    input: Arc<dyn StreamedInput>,
    conf: String,
}

impl DynamicFanIn {
    /// Create an empty broker. Children arrive through [`set_input`] or the
    /// registered management endpoints.
    ///
    /// [`set_input`]: DynamicFanIn::set_input
    pub fn new(builder: InputBuilder) -> Self {
        let (tx, rx) = transaction_channel();
        let shut_sig = Signaller::new();

        let ctrl = Arc::new(DynCtrl {
            builder,
            out_tx: Mutex::new(Some(tx)),
            children: Mutex::new(HashMap::new()),
            forwarders: Mutex::new(Vec::new()),
            sig: shut_sig.clone(),
        });

        let supervisor = Arc::clone(&ctrl);
        let sig = shut_sig.clone();
        tokio::spawn(async move {
            sig.closed_at_leisure().await;

            let children: Vec<Arc<dyn StreamedInput>> = supervisor
                .children
                .lock()
                .values()
                .map(|c| Arc::clone(&c.input))
                .collect();
            for child in &children {
                child.close_at_leisure();
            }

            // Forwarders terminate once their child channel closes, or at
            // close-now.
            let forwarders = std::mem::take(&mut *supervisor.forwarders.lock());
            for forwarder in forwarders {
                let _ = forwarder.await;
            }

            supervisor.out_tx.lock().take();
            sig.shutdown_complete();
        });

        Self {
            transactions: Some(rx),
            ctrl,
            shut_sig,
        }
    }

    /// Add or replace the child registered under `name`, built from the
    /// given raw configuration body.
    pub fn set_input(&self, name: &str, conf: &str) -> Result<()> {
        self.ctrl.set_input(name, conf)
    }

    /// Remove the child registered under `name`, draining it in the
    /// background. Returns false when no such child exists.
    pub fn remove_input(&self, name: &str) -> bool {
        self.ctrl.remove_input(name)
    }

    /// Names and configurations of the current children.
    pub fn list_inputs(&self) -> Vec<(String, String)> {
        self.ctrl.list_inputs()
    }

    /// Register the management endpoints (`/inputs`, `/inputs/{name}`).
    pub fn register_endpoints(&self, registry: &EndpointRegistry) {
        let ctrl = Arc::clone(&self.ctrl);
        registry.register(
            "/inputs",
            "Lists the currently active dynamic inputs as a JSON object.",
            Arc::new(move |req| {
                if req.method != "GET" {
                    return EndpointResponse::status(405, "method not allowed");
                }
                let listing: BTreeMap<String, String> = ctrl.list_inputs().into_iter().collect();
                match serde_json::to_vec(&listing) {
                    Ok(body) => EndpointResponse::ok(body),
                    Err(err) => EndpointResponse::status(500, err.to_string()),
                }
            }),
        );

        let ctrl = Arc::clone(&self.ctrl);
        registry.register(
            "/inputs/{name}",
            "GET returns an input configuration, POST creates or updates it, DELETE removes it.",
            Arc::new(move |req| {
                let Some(name) = req.path.rsplit('/').next().filter(|n| !n.is_empty()) else {
                    return EndpointResponse::status(400, "missing input name");
                };
                match req.method.as_str() {
                    "GET" => match ctrl.input_conf(name) {
                        Some(conf) => EndpointResponse::ok(conf),
                        None => EndpointResponse::status(404, "input not found"),
                    },
                    "POST" => {
                        let conf = match std::str::from_utf8(&req.body) {
                            Ok(conf) => conf,
                            Err(_) => {
                                return EndpointResponse::status(400, "body must be utf-8")
                            }
                        };
                        match ctrl.set_input(name, conf) {
                            Ok(()) => EndpointResponse::ok("OK"),
                            Err(err) => EndpointResponse::status(400, err.to_string()),
                        }
                    }
                    "DELETE" => {
                        if ctrl.remove_input(name) {
                            EndpointResponse::ok("OK")
                        } else {
                            EndpointResponse::status(404, "input not found")
                        }
                    }
                    _ => EndpointResponse::status(405, "method not allowed"),
                }
            }),
        );
    }
}

impl DynCtrl {
    fn set_input(&self, name: &str, conf: &str) -> Result<()> {
        if self.sig.should_close_at_leisure() {
            return Err(Error::TypeClosed);
        }

        let mut input = (self.builder)(name, conf)?;
        let mut child_rx = input.take_transactions().ok_or(Error::AlreadyConsuming)?;
        let input: Arc<dyn StreamedInput> = Arc::from(input);

        let tx = self
            .out_tx
            .lock()
            .clone()
            .ok_or(Error::TypeClosed)?;
        let sig = self.sig.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let tr = tokio::select! {
                    tr = child_rx.recv() => match tr {
                        Some(tr) => tr,
                        None => break,
                    },
                    _ = sig.closed_now() => break,
                };
                let sent = tokio::select! {
                    res = tx.send(tr) => res.is_ok(),
                    _ = sig.closed_now() => false,
                };
                if !sent {
                    break;
                }
            }
        });
        self.forwarders.lock().push(forwarder);

        let replaced = self.children.lock().insert(
            name.to_string(),
            ChildEntry {
                input,
                conf: conf.to_string(),
            },
        );
        if let Some(old) = replaced {
            drain_detached(old.input, name.to_string());
        }

        info!(input = %name, "Dynamic input set");
        Ok(())
    }

    fn remove_input(&self, name: &str) -> bool {
        let Some(entry) = self.children.lock().remove(name) else {
            return false;
        };
        drain_detached(entry.input, name.to_string());
        info!(input = %name, "Dynamic input removed");
        true
    }

    fn list_inputs(&self) -> Vec<(String, String)> {
        self.children
            .lock()
            .iter()
            .map(|(name, entry)| (name.clone(), entry.conf.clone()))
            .collect()
    }

    fn input_conf(&self, name: &str) -> Option<String> {
        self.children.lock().get(name).map(|e| e.conf.clone())
    }
}

fn drain_detached(input: Arc<dyn StreamedInput>, name: String) {
    input.close_at_leisure();
    tokio::spawn(async move {
        if let Err(err) = input.wait_for_close(REMOVE_DRAIN_TIMEOUT).await {
            error!(input = %name, error = %err, "Dynamic input did not drain in time");
        }
    });
}

#[async_trait]
impl StreamedInput for DynamicFanIn {
    fn take_transactions(&mut self) -> Option<TransactionRx> {
        self.transactions.take()
    }

    fn connected(&self) -> bool {
        self.ctrl.children.lock().values().all(|c| c.input.connected())
    }

    fn close_at_leisure(&self) {
        self.shut_sig.close_at_leisure();
    }

    async fn wait_for_close(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let children: Vec<Arc<dyn StreamedInput>> = self
            .ctrl
            .children
            .lock()
            .values()
            .map(|c| Arc::clone(&c.input))
            .collect();
        for child in children {
            let remaining = timeout
                .checked_sub(started.elapsed())
                .ok_or(Error::Timeout)?;
            child.wait_for_close(remaining).await?;
        }
        let remaining = timeout
            .checked_sub(started.elapsed())
            .ok_or(Error::Timeout)?;
        self.shut_sig.wait_for_close(remaining).await
    }
}
