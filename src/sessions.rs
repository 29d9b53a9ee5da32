use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::info;

use crate::llm::{ChatModel, ChatSession};

/// A chat session shared between the tasks handling one sender's messages.
/// The mutex keeps that sender's turns in order.
pub type SharedSession = Arc<Mutex<Box<dyn ChatSession>>>;

/// One conversation per sender, created on first contact and kept for the
/// lifetime of the process.
pub struct SessionStore {
    model: Arc<dyn ChatModel>,
    sessions: Mutex<HashMap<String, SharedSession>>,
}

impl SessionStore {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self {
            model,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Get the sender's session, starting one if this is the first message.
    /// Lookup and insert happen under the same lock, so concurrent first
    /// messages end up sharing a single session.
    pub async fn get_or_create(&self, sender: &str) -> SharedSession {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(sender) {
            return Arc::clone(session);
        }

        let session: SharedSession = Arc::new(Mutex::new(self.model.start_chat()));
        sessions.insert(sender.to_string(), Arc::clone(&session));
        info!(
            "Starting new conversation for {} ({} active)",
            sender,
            sessions.len()
        );
        session
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Part;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoSession {
        turns: usize,
    }

    #[async_trait]
    impl ChatSession for EchoSession {
        async fn send_message(&mut self, _parts: Vec<Part>) -> Result<String> {
            self.turns += 1;
            Ok(self.turns.to_string())
        }
    }

    #[derive(Default)]
    struct CountingModel {
        started: AtomicUsize,
    }

    impl ChatModel for CountingModel {
        fn start_chat(&self) -> Box<dyn ChatSession> {
            self.started.fetch_add(1, Ordering::SeqCst);
            Box::new(EchoSession { turns: 0 })
        }
    }

    #[tokio::test]
    async fn test_session_created_once_per_sender() {
        let model = Arc::new(CountingModel::default());
        let store = SessionStore::new(model.clone());

        let first = store.get_or_create("6281234@c.us").await;
        let second = store.get_or_create("6281234@c.us").await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(model.started.load(Ordering::SeqCst), 1);
        assert_eq!(store.sessions.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_senders_get_independent_sessions() {
        let model = Arc::new(CountingModel::default());
        let store = SessionStore::new(model.clone());

        let alice = store.get_or_create("111@c.us").await;
        let bob = store.get_or_create("222@c.us").await;

        assert_eq!(alice.lock().await.send_message(vec![]).await.unwrap(), "1");
        assert_eq!(alice.lock().await.send_message(vec![]).await.unwrap(), "2");
        assert_eq!(bob.lock().await.send_message(vec![]).await.unwrap(), "1");
        assert_eq!(model.started.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_messages_share_one_session() {
        let model = Arc::new(CountingModel::default());
        let store = Arc::new(SessionStore::new(model.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.get_or_create("6281234@c.us").await })
            })
            .collect();

        let sessions = futures::future::join_all(handles).await;
        let first = sessions[0].as_ref().unwrap();
        for session in &sessions {
            assert!(Arc::ptr_eq(first, session.as_ref().unwrap()));
        }
        assert_eq!(model.started.load(Ordering::SeqCst), 1);
    }
}
