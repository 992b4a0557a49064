//! Scriptable transport double shared by the integration tests.

#![allow(dead_code)]

use chat_ws_adapter::events::ready_state;
use chat_ws_adapter::{
    AdapterConfig, AdapterError, CloseInfo, ConfigPatch, Connector, Transport, TransportEvents,
    WebSocketAdapter,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// One handle the adapter opened. Tests drive its lifecycle by hand.
#[derive(Clone)]
pub struct MockHandle {
    pub url: String,
    pub events: TransportEvents,
    pub sent: Arc<Mutex<Vec<String>>>,
    pub ready: Arc<AtomicU8>,
    pub close_requested: Arc<AtomicBool>,
    pub fail_sends: Arc<AtomicBool>,
}

impl MockHandle {
    pub fn open(&self) {
        self.ready.store(ready_state::OPEN, Ordering::SeqCst);
        self.events.opened();
    }

    pub fn receive(&self, text: &str) {
        self.events.message(text);
    }

    pub fn receive_json(&self, frame: Value) {
        self.events.message(&frame.to_string());
    }

    pub fn close(&self, code: u16) {
        self.ready.store(ready_state::CLOSED, Ordering::SeqCst);
        self.events.closed(CloseInfo {
            code,
            reason: String::new(),
            was_clean: code == 1000,
        });
    }

    pub fn error(&self, detail: &str) {
        self.events.error(detail);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_json(&self) -> Vec<Value> {
        self.sent().iter().map(|s| serde_json::from_str(s).unwrap()).collect()
    }
}

struct MockTransport {
    sent: Arc<Mutex<Vec<String>>>,
    ready: Arc<AtomicU8>,
    close_requested: Arc<AtomicBool>,
    fail_sends: Arc<AtomicBool>,
}

impl Transport for MockTransport {
    fn send(&self, text: String) -> Result<(), AdapterError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(AdapterError::Transport("scripted send failure".into()));
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    fn close(&self) {
        self.close_requested.store(true, Ordering::SeqCst);
        let _ = self.ready.compare_exchange(
            ready_state::OPEN,
            ready_state::CLOSING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn ready_state(&self) -> u8 {
        self.ready.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct MockConnector {
    handles: Mutex<Vec<MockHandle>>,
}

impl MockConnector {
    pub fn count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn handle(&self, index: usize) -> MockHandle {
        self.handles.lock().unwrap()[index].clone()
    }

    pub fn last(&self) -> MockHandle {
        self.handles.lock().unwrap().last().cloned().expect("nothing opened yet")
    }
}

impl Connector for MockConnector {
    fn open(&self, url: &url::Url, events: TransportEvents) -> Box<dyn Transport> {
        let handle = MockHandle {
            url: url.to_string(),
            events,
            sent: Arc::new(Mutex::new(Vec::new())),
            ready: Arc::new(AtomicU8::new(ready_state::CONNECTING)),
            close_requested: Arc::new(AtomicBool::new(false)),
            fail_sends: Arc::new(AtomicBool::new(false)),
        };
        let transport = MockTransport {
            sent: Arc::clone(&handle.sent),
            ready: Arc::clone(&handle.ready),
            close_requested: Arc::clone(&handle.close_requested),
            fail_sends: Arc::clone(&handle.fail_sends),
        };
        self.handles.lock().unwrap().push(handle);
        Box::new(transport)
    }
}

pub fn mock_adapter(patch: ConfigPatch) -> (WebSocketAdapter, Arc<MockConnector>) {
    let connector = Arc::new(MockConnector::default());
    let mut config = AdapterConfig::from_patch(
        ConfigPatch::default()
            .origin("http://chat.test:8080")
            .user_id("user_test")
            .username("tester"),
    );
    config.apply(patch);
    let dyn_connector: Arc<dyn Connector> = Arc::clone(&connector) as Arc<dyn Connector>;
    let adapter = WebSocketAdapter::with_connector(config, dyn_connector);
    (adapter, connector)
}

/// Adapter with an open connection on its first handle.
pub fn connected_adapter(
    patch: ConfigPatch,
) -> (WebSocketAdapter, Arc<MockConnector>, MockHandle) {
    let (adapter, connector) = mock_adapter(patch);
    adapter.connect().unwrap();
    let handle = connector.last();
    handle.open();
    (adapter, connector, handle)
}

/// Records every invocation of handlers made with [`Recorder::handler`].
#[derive(Clone, Default)]
pub struct Recorder {
    pub calls: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorder {
    pub fn handler(&self, label: &str) -> chat_ws_adapter::EventHandler {
        let calls = Arc::clone(&self.calls);
        let label = label.to_string();
        chat_ws_adapter::handler(move |data| {
            calls.lock().unwrap().push((label.clone(), data.clone()))
        })
    }

    pub fn labels(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(l, _)| l.clone()).collect()
    }

    pub fn count(&self, label: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(l, _)| l == label).count()
    }
}
