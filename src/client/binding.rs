//! Live query bindings.
//!
//! A [`LiveBinding`] adapts a push subscription from a [`DocumentStore`] into a
//! state value that rendering code can poll ([`LiveBinding::state`],
//! [`LiveBinding::snapshot`]) or observe transition by transition
//! ([`LiveBinding::changes`]).
//!
//! State machine per binding:
//!
//! * no query: [`LiveQuery::unbound_state`] (an empty `Ready` list for
//!   collections, `Unbound` for documents); the store is never contacted
//! * query set: `Loading`, then `Ready` on every pushed snapshot, or `Errored`
//!   on a pushed error, after which the binding stops listening
//! * query changed: back to `Loading` before the new subscription delivers
//!   anything, so data from the previous query is never presented as current
//! * disposed: the subscription is cancelled and nothing changes afterwards
//!
//! Every binding carries a generation number. Each pushed update is applied
//! under the state lock only if its generation is still current, which
//! discards late results from a replaced or disposed subscription.

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{
    ChatError, ChatResult, Conversation, ConversationId, Message, MessagesQuery, StoreError,
};
use crate::server::store::{DocumentStore, Subscription};

#[derive(Debug, Clone, PartialEq)]
pub enum BindingState<T> {
    Unbound,
    Loading,
    Ready(T),
    Errored(StoreError),
}

impl<T> BindingState<T> {
    pub fn is_loading(&self) -> bool {
        matches!(self, BindingState::Loading)
    }

    pub fn data(&self) -> Option<&T> {
        match self {
            BindingState::Ready(data) => Some(data),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&StoreError> {
        match self {
            BindingState::Errored(e) => Some(e),
            _ => None,
        }
    }
}

/// Pull-style `{data, loading, error}` view of a binding.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveSnapshot<T> {
    pub data: Option<T>,
    pub loading: bool,
    pub error: Option<StoreError>,
}

impl<T: Clone> From<&BindingState<T>> for LiveSnapshot<T> {
    fn from(state: &BindingState<T>) -> Self {
        Self {
            data: state.data().cloned(),
            loading: state.is_loading(),
            error: state.error().cloned(),
        }
    }
}

/// Something a [`LiveBinding`] can subscribe to. Two queries that compare equal
/// are the same subscription.
#[async_trait]
pub trait LiveQuery: Clone + PartialEq + Debug + Send + Sync + 'static {
    type Output: Clone + Send + Sync + 'static;

    fn unbound_state() -> BindingState<Self::Output>;

    async fn subscribe(
        &self,
        store: &dyn DocumentStore,
    ) -> Result<Subscription<Self::Output>, StoreError>;
}

/// A single conversation document. An absent document is `Ready(None)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationDoc(pub ConversationId);

#[async_trait]
impl LiveQuery for ConversationDoc {
    type Output = Option<Conversation>;

    fn unbound_state() -> BindingState<Self::Output> {
        BindingState::Unbound
    }

    async fn subscribe(
        &self,
        store: &dyn DocumentStore,
    ) -> Result<Subscription<Self::Output>, StoreError> {
        store.watch_conversation(&self.0).await
    }
}

#[async_trait]
impl LiveQuery for MessagesQuery {
    type Output = Vec<Message>;

    fn unbound_state() -> BindingState<Self::Output> {
        BindingState::Ready(Vec::new())
    }

    async fn subscribe(
        &self,
        store: &dyn DocumentStore,
    ) -> Result<Subscription<Self::Output>, StoreError> {
        store.watch_messages(self.clone()).await
    }
}

/// Every conversation a user takes part in, most recent activity first.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InboxQuery {
    pub user_id: String,
}

impl InboxQuery {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl LiveQuery for InboxQuery {
    type Output = Vec<Conversation>;

    fn unbound_state() -> BindingState<Self::Output> {
        BindingState::Ready(Vec::new())
    }

    async fn subscribe(
        &self,
        store: &dyn DocumentStore,
    ) -> Result<Subscription<Self::Output>, StoreError> {
        store.watch_conversations_for(&self.user_id).await
    }
}

struct Inner<Q: LiveQuery> {
    query: Option<Q>,
    generation: u64,
    disposed: bool,
    state: BindingState<Q::Output>,
    listeners: Vec<mpsc::UnboundedSender<BindingState<Q::Output>>>,
    pump: Option<JoinHandle<()>>,
}

impl<Q: LiveQuery> Inner<Q> {
    fn transition(&mut self, state: BindingState<Q::Output>) {
        self.listeners.retain(|l| l.send(state.clone()).is_ok());
        self.state = state;
    }
}

pub(crate) struct BindingCore<Q: LiveQuery> {
    store: Arc<dyn DocumentStore>,
    inner: Mutex<Inner<Q>>,
}

impl<Q: LiveQuery> BindingCore<Q> {
    fn lock(&self) -> MutexGuard<'_, Inner<Q>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Replace the query. With `force` the subscription restarts even when the
    /// query is unchanged.
    pub(crate) fn set_query(self: &Arc<Self>, query: Option<Q>, force: bool) {
        let mut inner = self.lock();
        if inner.disposed || (!force && inner.query == query) {
            return;
        }
        inner.generation += 1;
        if let Some(old) = inner.pump.take() {
            old.abort();
        }
        let initial = match query {
            Some(_) => BindingState::Loading,
            None => Q::unbound_state(),
        };
        inner.transition(initial);
        inner.query = query.clone();

        if let Some(query) = query {
            debug!("[BINDING] subscribing to {:?} (generation {})", query, inner.generation);
            inner.pump = Some(tokio::spawn(pump_binding(
                self.store.clone(),
                query,
                Arc::downgrade(self),
                inner.generation,
            )));
        }
    }

    fn dispose(&self) {
        let mut inner = self.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        inner.generation += 1;
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        inner.listeners.clear();
    }

    /// Apply a pushed update if it still belongs to the current subscription.
    fn apply(&self, generation: u64, state: BindingState<Q::Output>) -> bool {
        let mut inner = self.lock();
        if inner.disposed || inner.generation != generation {
            return false;
        }
        inner.transition(state);
        true
    }
}

async fn pump_binding<Q: LiveQuery>(
    store: Arc<dyn DocumentStore>,
    query: Q,
    core: Weak<BindingCore<Q>>,
    generation: u64,
) {
    let apply = |state| match core.upgrade() {
        Some(core) => core.apply(generation, state),
        None => false,
    };

    let mut subscription = match query.subscribe(store.as_ref()).await {
        Ok(subscription) => subscription,
        Err(e) => {
            warn!("[BINDING] subscribe to {:?} failed: {}", query, e);
            apply(BindingState::Errored(e));
            return;
        }
    };

    while let Some(pushed) = subscription.next().await {
        match pushed {
            Ok(data) => {
                if !apply(BindingState::Ready(data)) {
                    break;
                }
            }
            Err(e) => {
                warn!("[BINDING] {:?} reported an error: {}", query, e);
                apply(BindingState::Errored(e));
                break;
            }
        }
    }
    debug!("[BINDING] pump for {:?} finished", query);
}

/// Binds one [`LiveQuery`] to observable state. Dropping the binding disposes it.
///
/// Must be created inside a tokio runtime when the query is non-null.
pub struct LiveBinding<Q: LiveQuery> {
    core: Arc<BindingCore<Q>>,
}

impl<Q: LiveQuery> LiveBinding<Q> {
    pub fn new(store: Arc<dyn DocumentStore>, query: Option<Q>) -> Self {
        let core = Arc::new(BindingCore {
            store,
            inner: Mutex::new(Inner {
                query: None,
                generation: 0,
                disposed: false,
                state: Q::unbound_state(),
                listeners: Vec::new(),
                pump: None,
            }),
        });
        if query.is_some() {
            core.set_query(query, false);
        }
        Self { core }
    }

    /// Switch to a different query. Equal queries are a no-op.
    pub fn set_query(&self, query: Option<Q>) {
        self.core.set_query(query, false);
    }

    /// Resubscribe to the current query, e.g. after an error.
    pub fn refresh(&self) {
        let query = self.query();
        self.core.set_query(query, true);
    }

    pub fn query(&self) -> Option<Q> {
        self.core.lock().query.clone()
    }

    pub fn state(&self) -> BindingState<Q::Output> {
        self.core.lock().state.clone()
    }

    pub fn snapshot(&self) -> LiveSnapshot<Q::Output> {
        LiveSnapshot::from(&self.core.lock().state)
    }

    /// Every state from now on, in order and uncoalesced, starting with the
    /// current one. The stream ends when the binding is disposed.
    pub fn changes(&self) -> mpsc::UnboundedReceiver<BindingState<Q::Output>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.core.lock();
        if !inner.disposed && tx.send(inner.state.clone()).is_ok() {
            inner.listeners.push(tx);
        }
        rx
    }

    /// Wait for the binding to settle on data. A pushed error becomes
    /// [`ChatError::Subscription`].
    pub async fn ready(&self) -> ChatResult<Q::Output> {
        let mut changes = self.changes();
        while let Some(state) = changes.recv().await {
            match state {
                BindingState::Ready(data) => return Ok(data),
                BindingState::Errored(e) => return Err(ChatError::Subscription(e)),
                BindingState::Loading => {}
                BindingState::Unbound => {
                    return Err(ChatError::InvalidOperation(
                        "binding has no query".to_string(),
                    ))
                }
            }
        }
        Err(ChatError::Subscription(StoreError::Closed))
    }

    pub fn dispose(self) {
        self.core.dispose();
    }

    pub(crate) fn core(&self) -> Arc<BindingCore<Q>> {
        self.core.clone()
    }
}

impl<Q: LiveQuery> Drop for LiveBinding<Q> {
    fn drop(&mut self) {
        self.core.dispose();
    }
}
