use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::{
    Client, Resource,
    runtime::events::{Event, EventType, Recorder, Reporter},
};
use tracing::*;

/// Where the controllers send their kubernetes events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: Event, reference: &ObjectReference);
}

/// EventSink backed by the kubernetes events API
pub struct KubeEvents {
    recorder: Recorder,
}

impl KubeEvents {
    #[must_use]
    pub fn new(client: Client, reporter: Reporter) -> KubeEvents {
        KubeEvents {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, event: Event, reference: &ObjectReference) {
        if let Err(e) = self.recorder.publish(&event, reference).await {
            // terminating namespaces refuse new events
            warn!("Ignoring {:?} while sending event {}", e, event.reason);
        }
    }
}

pub fn reference<K: Resource<DynamicType = ()>>(obj: &K) -> ObjectReference {
    obj.object_ref(&())
}

#[must_use]
pub fn normal(reason: &str, action: &str, note: String) -> Event {
    Event {
        type_: EventType::Normal,
        reason: reason.to_string(),
        note: Some(note),
        action: action.to_string(),
        secondary: None,
    }
}

#[must_use]
pub fn warning(reason: &str, action: &str, note: String) -> Event {
    Event {
        type_: EventType::Warning,
        reason: reason.to_string(),
        note: Some(note),
        action: action.to_string(),
        secondary: None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Keeps the events in memory: `(warning, reason, object name)`
    #[derive(Default)]
    pub struct CapturedEvents {
        events: Mutex<Vec<(bool, String, String)>>,
    }

    impl CapturedEvents {
        pub fn reasons(&self) -> Vec<String> {
            self.events.lock().unwrap().iter().map(|e| e.1.clone()).collect()
        }

        pub fn warnings(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.0)
                .map(|e| e.1.clone())
                .collect()
        }

        pub fn has(&self, reason: &str) -> bool {
            self.reasons().iter().any(|r| r == reason)
        }
    }

    #[async_trait]
    impl EventSink for CapturedEvents {
        async fn publish(&self, event: Event, reference: &ObjectReference) {
            self.events.lock().unwrap().push((
                matches!(event.type_, EventType::Warning),
                event.reason,
                reference.name.clone().unwrap_or_default(),
            ));
        }
    }

    #[test]
    fn test_event_builders() {
        let ev = warning("ResourceConflict", "Apply", "ConfigMap tenants/u1-cm is owned elsewhere".into());
        assert!(matches!(ev.type_, EventType::Warning));
        assert_eq!(ev.reason, "ResourceConflict");
        assert!(matches!(normal("NodeCreated", "Create", String::new()).type_, EventType::Normal));
    }
}
