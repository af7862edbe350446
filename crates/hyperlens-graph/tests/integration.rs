//! Integration tests for hyperlens-graph against a scripted in-memory remote.
//!
//! Every transport call is handed to the test through a channel and answered
//! explicitly, so the tests control exactly when (and in which order) the
//! "server" responds.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, oneshot};

use hyperlens_core::catalog;
use hyperlens_core::config::SyncConfig;
use hyperlens_core::events::{EventPayload, SyncEvent};
use hyperlens_core::{
    CacheStatus, Entity, EntityId, FailureKind, Filter, MutationKind, MutationStatus, Payload,
    QueryDescriptor, Relation, SchemaError, SpaceId, SpaceSummary, VisibilityMode,
};
use hyperlens_graph::{
    AnonymousSession, AuthToken, CacheError, ConnectionContext, DirectoryContext, DirectoryError,
    MutationError, MutationTransport, QueryTransport, ResolveError, SessionProvider, SyncClient,
    TransportError,
};

const PRIVATE_SPACE: &str = "private-1";
const PUBLIC_SPACE: &str = "pub-1";

// ── Scripted remote ──────────────────────────────────────────────

struct QueryCall {
    descriptor: QueryDescriptor,
    context: ConnectionContext,
    reply: oneshot::Sender<Result<Vec<Entity>, TransportError>>,
}

impl QueryCall {
    fn respond(self, entities: Vec<Entity>) {
        let _ = self.reply.send(Ok(entities));
    }

    fn fail(self, error: TransportError) {
        let _ = self.reply.send(Err(error));
    }
}

struct MutationCall {
    entity_type: String,
    payload: Payload,
    context: ConnectionContext,
    reply: oneshot::Sender<Result<Entity, TransportError>>,
}

impl MutationCall {
    /// Accept the create, assigning `id`.
    fn confirm(self, id: &str) -> Entity {
        let entity = Entity::from_payload(
            EntityId::new(id),
            &self.entity_type,
            self.context.space_id.clone(),
            &self.payload,
        );
        let _ = self.reply.send(Ok(entity.clone()));
        entity
    }

    fn fail(self, error: TransportError) {
        let _ = self.reply.send(Err(error));
    }
}

struct ScriptedRemote {
    queries: mpsc::UnboundedSender<QueryCall>,
    mutations: mpsc::UnboundedSender<MutationCall>,
}

#[async_trait]
impl QueryTransport for ScriptedRemote {
    async fn query(
        &self,
        descriptor: &QueryDescriptor,
        context: &ConnectionContext,
    ) -> Result<Vec<Entity>, TransportError> {
        let (reply, response) = oneshot::channel();
        let call = QueryCall {
            descriptor: descriptor.clone(),
            context: context.clone(),
            reply,
        };
        if self.queries.send(call).is_err() {
            return Err(TransportError::Network("remote gone".into()));
        }
        response
            .await
            .unwrap_or_else(|_| Err(TransportError::Network("connection reset".into())))
    }

    /// A fixed directory: one private and two public spaces. Private listings
    /// without credentials are refused the way a real remote would.
    async fn spaces(
        &self,
        context: &DirectoryContext,
    ) -> Result<Vec<SpaceSummary>, TransportError> {
        if context.mode == VisibilityMode::Private && context.auth.is_none() {
            return Err(TransportError::Remote {
                code: 401,
                message: "unauthorized".into(),
            });
        }
        let directory = [
            (PRIVATE_SPACE, "Personal", VisibilityMode::Private),
            (PUBLIC_SPACE, "Crypto", VisibilityMode::Public),
            ("pub-2", "Research", VisibilityMode::Public),
        ];
        Ok(directory
            .into_iter()
            .filter(|(_, _, mode)| *mode == context.mode)
            .map(|(id, name, mode)| SpaceSummary {
                id: SpaceId::from(id),
                name: name.to_string(),
                mode,
            })
            .collect())
    }
}

#[async_trait]
impl MutationTransport for ScriptedRemote {
    async fn create(
        &self,
        entity_type: &str,
        payload: &Payload,
        context: &ConnectionContext,
    ) -> Result<Entity, TransportError> {
        let (reply, response) = oneshot::channel();
        let call = MutationCall {
            entity_type: entity_type.to_string(),
            payload: payload.clone(),
            context: context.clone(),
            reply,
        };
        if self.mutations.send(call).is_err() {
            return Err(TransportError::Network("remote gone".into()));
        }
        response
            .await
            .unwrap_or_else(|_| Err(TransportError::Network("connection reset".into())))
    }
}

struct SignedIn;

impl SessionProvider for SignedIn {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn private_space_id(&self) -> Option<SpaceId> {
        Some(SpaceId::from(PRIVATE_SPACE))
    }

    fn auth_token(&self) -> Option<AuthToken> {
        Some(AuthToken::new("token"))
    }
}

/// Signed in to a private space that can change mid-test, as on logout/login.
#[derive(Clone)]
struct Switchable(Arc<Mutex<SpaceId>>);

impl Switchable {
    fn new(space: &str) -> Self {
        Self(Arc::new(Mutex::new(SpaceId::from(space))))
    }

    fn switch_to(&self, space: &str) {
        *self.0.lock().unwrap() = SpaceId::from(space);
    }
}

impl SessionProvider for Switchable {
    fn is_authenticated(&self) -> bool {
        true
    }

    fn private_space_id(&self) -> Option<SpaceId> {
        Some(self.0.lock().unwrap().clone())
    }

    fn auth_token(&self) -> Option<AuthToken> {
        Some(AuthToken::new("token"))
    }
}

struct Harness {
    client: SyncClient,
    queries: mpsc::UnboundedReceiver<QueryCall>,
    mutations: mpsc::UnboundedReceiver<MutationCall>,
    events: broadcast::Receiver<SyncEvent>,
}

impl Harness {
    fn new(session: impl SessionProvider + 'static) -> Self {
        Self::with_config(&SyncConfig::default(), session)
    }

    fn with_config(config: &SyncConfig, session: impl SessionProvider + 'static) -> Self {
        let (query_tx, queries) = mpsc::unbounded_channel();
        let (mutation_tx, mutations) = mpsc::unbounded_channel();
        let remote = Arc::new(ScriptedRemote {
            queries: query_tx,
            mutations: mutation_tx,
        });
        let client = SyncClient::new(
            config,
            catalog::registry().unwrap(),
            remote.clone(),
            remote,
            Arc::new(session),
        );
        let events = client.subscribe_events();
        Self {
            client,
            queries,
            mutations,
            events,
        }
    }

    fn signed_in() -> Self {
        Self::new(SignedIn)
    }

    async fn next_query(&mut self) -> QueryCall {
        self.queries.recv().await.expect("query call")
    }

    async fn next_mutation(&mut self) -> MutationCall {
        self.mutations.recv().await.expect("mutation call")
    }

    fn no_more_queries(&mut self) -> bool {
        self.queries.try_recv().is_err()
    }

    fn no_more_mutations(&mut self) -> bool {
        self.mutations.try_recv().is_err()
    }

    /// Answer the next query call and wait for the entry to settle.
    async fn serve(&mut self, descriptor: &QueryDescriptor, entities: Vec<Entity>) {
        self.next_query().await.respond(entities);
        let entry = self.client.cache().fetch(descriptor).await.unwrap();
        assert_eq!(entry.status, CacheStatus::Success);
    }

    async fn wait_for_event(&mut self, matches: impl Fn(&EventPayload) -> bool) -> EventPayload {
        loop {
            let event = self.events.recv().await.expect("event stream open");
            if matches(&event.payload) {
                return event.payload;
            }
        }
    }
}

fn project(id: &str, name: &str, space: &str) -> Entity {
    Entity::from_payload(
        EntityId::new(id),
        catalog::PROJECT,
        SpaceId::from(space),
        &project_payload(name),
    )
}

fn task(id: &str, space: &str) -> Entity {
    Entity::from_payload(
        EntityId::new(id),
        catalog::TASK,
        SpaceId::from(space),
        &task_payload(id),
    )
}

fn project_payload(name: &str) -> Payload {
    Payload::new()
        .with("name", name)
        .with("description", "A project")
        .with("x", "@project")
}

fn task_payload(name: &str) -> Payload {
    Payload::new()
        .with("name", name)
        .with("description", "Something to do")
        .with("status", false)
}

fn ids(entities: &[Entity]) -> Vec<&str> {
    entities.iter().map(|e| e.id.as_str()).collect()
}

// ── Query cache ──────────────────────────────────────────────────

#[tokio::test]
async fn test_concurrent_gets_share_one_fetch() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);

    let first = h.client.cache().get(&descriptor).unwrap();
    let second = h.client.cache().get(&descriptor).unwrap();
    assert_eq!(first.status, CacheStatus::Pending);
    assert_eq!(second.status, CacheStatus::Pending);
    assert_eq!(first.fingerprint, second.fingerprint);

    let call = h.next_query().await;
    assert_eq!(call.descriptor, descriptor);
    assert_eq!(call.context.mode, VisibilityMode::Public);
    assert_eq!(call.context.space_id, SpaceId::from(PUBLIC_SPACE));
    call.respond(vec![project("p-1", "Uniswap", PUBLIC_SPACE)]);

    let entry = h.client.cache().fetch(&descriptor).await.unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert_eq!(ids(&entry.data), ["p-1"]);
    assert!(entry.last_updated_at.is_some());
    assert!(h.no_more_queries());
    assert_eq!(h.client.cache().len(), 1);
}

#[tokio::test]
async fn test_settled_entry_is_served_from_cache() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    h.client.cache().get(&descriptor).unwrap();
    h.serve(&descriptor, vec![project("p-1", "Aave", PUBLIC_SPACE)])
        .await;

    let entry = h.client.cache().get(&descriptor).unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert_eq!(ids(&entry.data), ["p-1"]);
    assert!(h.no_more_queries());
}

#[tokio::test]
async fn test_distinct_descriptors_fetch_separately() {
    let mut h = Harness::signed_in();
    let all = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    let searched = all
        .clone()
        .with_filter(Filter::new().contains("name", "Uni"));

    h.client.cache().get(&all).unwrap();
    h.client.cache().get(&searched).unwrap();

    let a = h.next_query().await;
    let b = h.next_query().await;
    assert_ne!(a.descriptor, b.descriptor);
    assert_eq!(h.client.cache().len(), 2);
}

#[tokio::test]
async fn test_relations_are_explicitly_not_loaded_or_loaded() {
    let mut h = Harness::signed_in();
    let with_avatar = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE).include("avatar");
    let without = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);

    h.client.cache().get(&with_avatar).unwrap();
    h.serve(&with_avatar, vec![project("p-1", "Lido", PUBLIC_SPACE)])
        .await;

    let mut with_image = project("p-1", "Lido", PUBLIC_SPACE);
    with_image.relations.insert(
        "avatar".into(),
        Relation::Loaded(vec![EntityId::new("img-1")]),
    );
    h.client.cache().get(&without).unwrap();
    h.serve(&without, vec![with_image]).await;

    let loaded = h.client.cache().peek(&with_avatar).unwrap();
    assert_eq!(loaded.data[0].relation("avatar"), &Relation::Loaded(vec![]));

    let not_loaded = h.client.cache().peek(&without).unwrap();
    assert_eq!(not_loaded.data[0].relation("avatar"), &Relation::NotLoaded);
}

#[tokio::test]
async fn test_fetch_failure_keeps_previous_data() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    h.client.cache().get(&descriptor).unwrap();
    h.serve(&descriptor, vec![project("p-1", "Curve", PUBLIC_SPACE)])
        .await;

    h.client.cache().refetch(&descriptor).unwrap();
    h.next_query()
        .await
        .fail(TransportError::Network("timeout".into()));
    let entry = h.client.cache().fetch(&descriptor).await.unwrap();
    assert_eq!(entry.status, CacheStatus::Error);
    assert_eq!(entry.error.as_ref().unwrap().kind, FailureKind::Network);
    assert_eq!(ids(&entry.data), ["p-1"]);

    // Retry after an error is an explicit refetch.
    h.client.cache().refetch(&descriptor).unwrap();
    h.next_query()
        .await
        .respond(vec![project("p-2", "Balancer", PUBLIC_SPACE)]);
    let entry = h.client.cache().fetch(&descriptor).await.unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert!(entry.error.is_none());
    assert_eq!(ids(&entry.data), ["p-2"]);
}

#[tokio::test]
async fn test_response_of_wrong_type_is_invalid() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::DAPP, PUBLIC_SPACE);
    h.client.cache().get(&descriptor).unwrap();
    h.next_query()
        .await
        .respond(vec![project("p-1", "Not a dapp", PUBLIC_SPACE)]);

    let entry = h.client.cache().fetch(&descriptor).await.unwrap();
    assert_eq!(entry.status, CacheStatus::Error);
    assert_eq!(
        entry.error.unwrap().kind,
        FailureKind::InvalidResponse
    );
}

#[tokio::test]
async fn test_response_is_truncated_to_limit() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE).with_limit(2);
    h.client.cache().get(&descriptor).unwrap();
    h.serve(
        &descriptor,
        vec![
            project("p-1", "a", PUBLIC_SPACE),
            project("p-2", "b", PUBLIC_SPACE),
            project("p-3", "c", PUBLIC_SPACE),
        ],
    )
    .await;

    let entry = h.client.cache().peek(&descriptor).unwrap();
    assert_eq!(ids(&entry.data), ["p-1", "p-2"]);
}

#[tokio::test]
async fn test_late_response_is_discarded() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    h.client.cache().get(&descriptor).unwrap();
    h.serve(&descriptor, vec![project("p-1", "first", PUBLIC_SPACE)])
        .await;

    h.client.cache().refetch(&descriptor).unwrap();
    let older = h.next_query().await;
    h.client.cache().refetch(&descriptor).unwrap();
    let newer = h.next_query().await;

    newer.respond(vec![project("p-3", "third", PUBLIC_SPACE)]);
    let entry = h.client.cache().fetch(&descriptor).await.unwrap();
    assert_eq!(ids(&entry.data), ["p-3"]);
    assert_eq!(entry.revision, 3);

    older.respond(vec![project("p-2", "second", PUBLIC_SPACE)]);
    let discarded = h
        .wait_for_event(|e| matches!(e, EventPayload::ResponseDiscarded { .. }))
        .await;
    assert!(matches!(
        discarded,
        EventPayload::ResponseDiscarded { seq: 2, latest: 3, .. }
    ));

    let entry = h.client.cache().peek(&descriptor).unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert_eq!(ids(&entry.data), ["p-3"]);
}

#[tokio::test]
async fn test_in_order_responses_end_in_latest_state() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    h.client.cache().get(&descriptor).unwrap();
    h.serve(&descriptor, vec![]).await;

    h.client.cache().refetch(&descriptor).unwrap();
    let older = h.next_query().await;
    h.client.cache().refetch(&descriptor).unwrap();
    let newer = h.next_query().await;

    older.respond(vec![project("p-2", "second", PUBLIC_SPACE)]);
    h.wait_for_event(|e| matches!(e, EventPayload::QuerySettled { seq: 2, .. }))
        .await;
    // A newer request is still in flight.
    let interim = h.client.cache().peek(&descriptor).unwrap();
    assert_eq!(interim.status, CacheStatus::Pending);
    assert_eq!(ids(&interim.data), ["p-2"]);

    newer.respond(vec![project("p-3", "third", PUBLIC_SPACE)]);
    let entry = h.client.cache().fetch(&descriptor).await.unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert_eq!(ids(&entry.data), ["p-3"]);
}

#[tokio::test]
async fn test_superseded_failure_does_not_surface() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    h.client.cache().get(&descriptor).unwrap();
    let older = h.next_query().await;
    h.client.cache().refetch(&descriptor).unwrap();
    let newer = h.next_query().await;

    older.fail(TransportError::Remote {
        code: 502,
        message: "bad gateway".into(),
    });
    newer.respond(vec![project("p-1", "ok", PUBLIC_SPACE)]);

    let entry = h.client.cache().fetch(&descriptor).await.unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    assert_eq!(ids(&entry.data), ["p-1"]);
}

#[tokio::test]
async fn test_invalidate_refetches_only_that_type() {
    let mut h = Harness::signed_in();
    let projects = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    let assets = QueryDescriptor::public(catalog::ASSET, PUBLIC_SPACE);
    h.client.cache().get(&projects).unwrap();
    h.serve(&projects, vec![]).await;
    h.client.cache().get(&assets).unwrap();
    h.serve(&assets, vec![]).await;

    assert_eq!(h.client.cache().invalidate(catalog::PROJECT), 1);
    assert!(h.client.cache().peek(&projects).unwrap().is_pending());
    assert!(!h.client.cache().peek(&assets).unwrap().is_pending());

    let call = h.next_query().await;
    assert_eq!(call.descriptor, projects);
    call.respond(vec![project("p-9", "new", PUBLIC_SPACE)]);
    let entry = h.client.cache().fetch(&projects).await.unwrap();
    assert_eq!(ids(&entry.data), ["p-9"]);
    assert!(h.no_more_queries());
}

#[tokio::test]
async fn test_invalid_filter_is_rejected_before_fetch() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::INVESTMENT_ROUND, PUBLIC_SPACE)
        .with_filter(Filter::new().contains("raisedAmount", "5"));
    let err = h.client.cache().get(&descriptor).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Schema(SchemaError::FieldMismatch { .. })
    ));

    let unknown = QueryDescriptor::public("Planet", PUBLIC_SPACE);
    assert_eq!(
        h.client.cache().get(&unknown).unwrap_err(),
        CacheError::Schema(SchemaError::UnknownType("Planet".into()))
    );
    assert!(h.client.cache().is_empty());
    assert!(h.no_more_queries());
}

// ── Space resolution ─────────────────────────────────────────────

#[tokio::test]
async fn test_private_query_requires_session() {
    let mut h = Harness::new(AnonymousSession);
    let err = h
        .client
        .cache()
        .get(&QueryDescriptor::private(catalog::TASK))
        .unwrap_err();
    assert_eq!(err, CacheError::Resolve(ResolveError::NoActiveSession));
    assert!(h.no_more_queries());
}

#[tokio::test]
async fn test_public_query_requires_space_id() {
    let mut h = Harness::new(AnonymousSession);
    let err = h
        .client
        .cache()
        .get(&QueryDescriptor::public(catalog::PROJECT, ""))
        .unwrap_err();
    assert_eq!(
        err,
        CacheError::Resolve(ResolveError::MissingSpaceId(VisibilityMode::Public))
    );
    assert!(h.no_more_queries());
}

#[tokio::test]
async fn test_private_query_uses_session_space() {
    let mut h = Harness::signed_in();
    h.client
        .cache()
        .get(&QueryDescriptor::private(catalog::TASK))
        .unwrap();
    let call = h.next_query().await;
    assert_eq!(call.context.space_id, SpaceId::from(PRIVATE_SPACE));
    assert_eq!(call.context.mode, VisibilityMode::Private);
    assert_eq!(call.context.auth, Some(AuthToken::new("token")));
}

#[tokio::test]
async fn test_private_entries_follow_the_session_space() {
    let session = Switchable::new("alice-space");
    let mut h = Harness::new(session.clone());
    let tasks = QueryDescriptor::private(catalog::TASK);

    h.client.cache().get(&tasks).unwrap();
    let call = h.next_query().await;
    assert_eq!(call.context.space_id, SpaceId::from("alice-space"));
    call.respond(vec![task("t-alice", "alice-space")]);
    let alice = h.client.cache().fetch(&tasks).await.unwrap();
    assert_eq!(ids(&alice.data), ["t-alice"]);

    session.switch_to("bob-space");
    assert!(h.client.cache().peek(&tasks).is_none());
    let fresh = h.client.cache().get(&tasks).unwrap();
    assert!(fresh.is_pending());
    assert!(fresh.data.is_empty());
    assert_ne!(fresh.fingerprint, alice.fingerprint);

    let call = h.next_query().await;
    assert_eq!(call.context.space_id, SpaceId::from("bob-space"));
    call.respond(vec![task("t-bob", "bob-space")]);
    let bob = h.client.cache().fetch(&tasks).await.unwrap();
    assert_eq!(ids(&bob.data), ["t-bob"]);

    // Back in the first space, its entry is still cached.
    session.switch_to("alice-space");
    let again = h.client.cache().get(&tasks).unwrap();
    assert_eq!(again.status, CacheStatus::Success);
    assert_eq!(ids(&again.data), ["t-alice"]);
    assert!(h.no_more_queries());
    assert_eq!(h.client.cache().len(), 2);
}

#[tokio::test]
async fn test_stale_success_is_refetched_on_get() {
    let config = SyncConfig {
        stale_after_secs: Some(0),
        ..SyncConfig::default()
    };
    let mut h = Harness::with_config(&config, SignedIn);
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    let settled = |p: &EventPayload| {
        matches!(p, EventPayload::QuerySettled { status, .. } if *status == CacheStatus::Success)
    };

    h.client.cache().get(&descriptor).unwrap();
    h.next_query()
        .await
        .respond(vec![project("p-1", "Aave", PUBLIC_SPACE)]);
    h.wait_for_event(settled).await;
    assert_eq!(
        h.client.cache().peek(&descriptor).unwrap().status,
        CacheStatus::Success
    );

    let refreshing = h.client.cache().get(&descriptor).unwrap();
    assert!(refreshing.is_pending());
    assert_eq!(ids(&refreshing.data), ["p-1"]);

    let call = h.next_query().await;
    assert_eq!(call.descriptor, descriptor);
    call.respond(vec![project("p-2", "Compound", PUBLIC_SPACE)]);
    h.wait_for_event(settled).await;
    assert_eq!(
        ids(&h.client.cache().peek(&descriptor).unwrap().data),
        ["p-2"]
    );
}

#[tokio::test]
async fn test_unset_stale_policy_never_refetches() {
    let mut h = Harness::with_config(&SyncConfig::default(), SignedIn);
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    h.client.cache().get(&descriptor).unwrap();
    h.serve(&descriptor, vec![project("p-1", "Aave", PUBLIC_SPACE)])
        .await;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    for _ in 0..3 {
        let entry = h.client.cache().get(&descriptor).unwrap();
        assert_eq!(entry.status, CacheStatus::Success);
    }
    assert!(h.no_more_queries());
}

// ── Spaces ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_spaces_are_listed_per_mode() {
    let h = Harness::signed_in();

    let private = h.client.spaces(VisibilityMode::Private).await.unwrap();
    let names: Vec<&str> = private.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, ["Personal"]);
    assert_eq!(private[0].id, SpaceId::from(PRIVATE_SPACE));

    let public = h.client.spaces(VisibilityMode::Public).await.unwrap();
    let ids: Vec<&str> = public.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, [PUBLIC_SPACE, "pub-2"]);
    assert!(public.iter().all(|s| s.mode == VisibilityMode::Public));
}

#[tokio::test]
async fn test_private_spaces_require_session() {
    let mut h = Harness::new(AnonymousSession);
    assert_eq!(
        h.client.spaces(VisibilityMode::Private).await.unwrap_err(),
        DirectoryError::Resolve(ResolveError::NoActiveSession)
    );
    assert_eq!(h.client.spaces(VisibilityMode::Public).await.unwrap().len(), 2);
    assert!(h.no_more_queries());
}

// ── Mutations ────────────────────────────────────────────────────

#[tokio::test]
async fn test_create_shows_optimistic_entity_then_server_id() {
    let mut h = Harness::signed_in();
    let tasks = QueryDescriptor::private(catalog::TASK);
    h.client.cache().get(&tasks).unwrap();
    h.serve(&tasks, vec![]).await;

    let ticket = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("Write docs"), &SpaceId::from(""))
        .unwrap();
    let local_id = ticket.local_id().clone();
    assert!(local_id.is_local());

    let optimistic = h.client.cache().peek(&tasks).unwrap();
    assert_eq!(ids(&optimistic.data), [local_id.as_str()]);
    let pending = h.client.mutations().pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, MutationStatus::Optimistic);
    assert_eq!(pending[0].target_space_id, SpaceId::from(PRIVATE_SPACE));

    let call = h.next_mutation().await;
    assert_eq!(call.context.mode, VisibilityMode::Private);
    call.confirm("task-1");

    let confirmed = ticket.outcome().await.unwrap();
    assert_eq!(confirmed.id, EntityId::new("task-1"));

    let entry = h.client.cache().peek(&tasks).unwrap();
    assert_eq!(ids(&entry.data), ["task-1"]);
    assert!(entry.find(&local_id).is_none());
    assert!(h.client.mutations().pending().is_empty());
    assert!(h.no_more_queries());
}

#[tokio::test]
async fn test_created_project_is_visible_with_server_id() {
    let mut h = Harness::signed_in();
    let projects = QueryDescriptor::private(catalog::PROJECT);
    h.client.cache().get(&projects).unwrap();
    h.serve(&projects, vec![]).await;

    let ticket = h
        .client
        .mutations()
        .create(catalog::PROJECT, project_payload("Foo"), &SpaceId::from(PRIVATE_SPACE))
        .unwrap();
    let local_id = ticket.local_id().clone();
    h.next_mutation().await.confirm("proj-42");
    ticket.outcome().await.unwrap();

    let entry = h.client.cache().get(&projects).unwrap();
    assert_eq!(entry.status, CacheStatus::Success);
    let foo = entry
        .data
        .iter()
        .find(|e| e.scalar("name").and_then(|v| v.as_str()) == Some("Foo"))
        .expect("created project is cached");
    assert_eq!(foo.id, EntityId::new("proj-42"));
    assert_ne!(foo.id, local_id);
    assert!(h.no_more_queries());
}

#[tokio::test]
async fn test_failed_create_rolls_back() {
    let mut h = Harness::signed_in();
    let tasks = QueryDescriptor::private(catalog::TASK);
    h.client.cache().get(&tasks).unwrap();
    h.serve(&tasks, vec![]).await;

    let ticket = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("Ship it"), &SpaceId::from(""))
        .unwrap();
    let local_id = ticket.local_id().clone();
    let mut watcher = h.client.mutations().subscribe(&local_id).unwrap();

    h.next_mutation().await.fail(TransportError::Remote {
        code: 500,
        message: "write rejected".into(),
    });
    let err = ticket.outcome().await.unwrap_err();
    assert!(matches!(err, MutationError::Transport(TransportError::Remote { code: 500, .. })));

    assert!(h.client.cache().peek(&tasks).unwrap().data.is_empty());
    let failed = h.client.mutations().mutation(&local_id).unwrap();
    assert_eq!(failed.status, MutationStatus::Failed);
    assert!(failed.error.unwrap().contains("write rejected"));
    let observed = watcher
        .wait_for(|m| m.status == MutationStatus::Failed)
        .await
        .unwrap()
        .clone();
    assert_eq!(observed.local_id, local_id);
}

#[tokio::test]
async fn test_retry_failed_create() {
    let mut h = Harness::signed_in();
    let tasks = QueryDescriptor::private(catalog::TASK);
    h.client.cache().get(&tasks).unwrap();
    h.serve(&tasks, vec![]).await;

    let ticket = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("Retry me"), &SpaceId::from(""))
        .unwrap();
    let local_id = ticket.local_id().clone();
    h.next_mutation()
        .await
        .fail(TransportError::Network("offline".into()));
    ticket.outcome().await.unwrap_err();

    let retried = h.client.mutations().retry(&local_id).unwrap();
    assert_eq!(retried.local_id(), &local_id);
    assert_eq!(
        ids(&h.client.cache().peek(&tasks).unwrap().data),
        [local_id.as_str()]
    );
    h.next_mutation().await.confirm("task-7");
    retried.outcome().await.unwrap();

    assert_eq!(ids(&h.client.cache().peek(&tasks).unwrap().data), ["task-7"]);
    assert!(h.client.mutations().mutation(&local_id).is_none());
    assert_eq!(
        h.client.mutations().retry(&local_id).unwrap_err(),
        MutationError::UnknownMutation(local_id)
    );
}

#[tokio::test]
async fn test_create_only_appears_in_matching_entries() {
    let mut h = Harness::signed_in();
    let all = QueryDescriptor::private(catalog::TASK);
    let searched = QueryDescriptor::private(catalog::TASK)
        .with_filter(Filter::new().contains("name", "Docs"));
    let projects = QueryDescriptor::private(catalog::PROJECT);
    for d in [&all, &searched, &projects] {
        h.client.cache().get(d).unwrap();
        h.serve(d, vec![]).await;
    }

    let ticket = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("Write docs"), &SpaceId::from(""))
        .unwrap();

    assert_eq!(h.client.cache().peek(&all).unwrap().data.len(), 1);
    // Filters are case-sensitive.
    assert!(h.client.cache().peek(&searched).unwrap().data.is_empty());
    assert!(h.client.cache().peek(&projects).unwrap().data.is_empty());

    h.next_mutation().await.confirm("task-1");
    ticket.outcome().await.unwrap();
}

#[tokio::test]
async fn test_optimistic_entity_survives_refetch() {
    let mut h = Harness::signed_in();
    let tasks = QueryDescriptor::private(catalog::TASK);
    h.client.cache().get(&tasks).unwrap();
    h.serve(&tasks, vec![]).await;

    let ticket = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("Pending"), &SpaceId::from(""))
        .unwrap();
    let local_id = ticket.local_id().clone();

    h.client.cache().refetch(&tasks).unwrap();
    h.next_query().await.respond(vec![]);
    let entry = h.client.cache().fetch(&tasks).await.unwrap();
    assert!(entry.find(&local_id).is_some());

    h.next_mutation().await.confirm("task-2");
    ticket.outcome().await.unwrap();
    assert_eq!(ids(&h.client.cache().peek(&tasks).unwrap().data), ["task-2"]);
}

#[tokio::test]
async fn test_confirmation_rewrites_relation_references() {
    let mut h = Harness::signed_in();
    let projects = QueryDescriptor::private(catalog::PROJECT).include("avatar");
    h.client.cache().get(&projects).unwrap();
    h.serve(&projects, vec![]).await;

    let image = h
        .client
        .mutations()
        .create(
            catalog::IMAGE,
            Payload::new().with("url", "https://img/1.png"),
            &SpaceId::from(""),
        )
        .unwrap();
    let image_local = image.local_id().clone();

    let project = h
        .client
        .mutations()
        .create(
            catalog::PROJECT,
            project_payload("Hyperlens").with_relation("avatar", vec![image_local.clone()]),
            &SpaceId::from(""),
        )
        .unwrap();

    let entry = h.client.cache().peek(&projects).unwrap();
    assert_eq!(
        entry.data[0].relation("avatar"),
        &Relation::Loaded(vec![image_local.clone()])
    );

    h.next_mutation().await.confirm("img-1");
    image.outcome().await.unwrap();

    let entry = h.client.cache().peek(&projects).unwrap();
    assert_eq!(
        entry.data[0].relation("avatar"),
        &Relation::Loaded(vec![EntityId::new("img-1")])
    );

    h.next_mutation().await.confirm("proj-1");
    project.outcome().await.unwrap();
}

#[tokio::test]
async fn test_invalid_create_is_rejected_locally() {
    let mut h = Harness::signed_in();
    let tasks = QueryDescriptor::private(catalog::TASK);
    h.client.cache().get(&tasks).unwrap();
    h.serve(&tasks, vec![]).await;

    let err = h
        .client
        .mutations()
        .create(
            catalog::TASK,
            Payload::new().with("name", "No status"),
            &SpaceId::from(""),
        )
        .unwrap_err();
    let MutationError::Schema(schema) = err else {
        panic!("expected a schema error, got {err:?}");
    };
    let missing: Vec<&str> = schema.problems().iter().map(|p| p.field()).collect();
    assert_eq!(missing, ["description", "status"]);

    assert!(h.client.cache().peek(&tasks).unwrap().data.is_empty());
    assert!(h.client.mutations().pending().is_empty());
    assert!(h.no_more_mutations());
}

#[tokio::test]
async fn test_create_requires_session() {
    let mut h = Harness::new(AnonymousSession);
    let err = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("x"), &SpaceId::from(""))
        .unwrap_err();
    assert_eq!(err, MutationError::Resolve(ResolveError::NoActiveSession));
    assert!(h.no_more_mutations());
}

#[tokio::test]
async fn test_publish_without_target_fails_locally() {
    let mut h = Harness::signed_in();
    let source = project("p-1", "Mine", PRIVATE_SPACE);
    for target in ["", "   "] {
        let err = h
            .client
            .mutations()
            .publish(&source, &SpaceId::from(target))
            .unwrap_err();
        assert_eq!(err, MutationError::MissingTarget);
    }
    assert!(h.no_more_mutations());
    assert!(h.client.mutations().pending().is_empty());
}

#[tokio::test]
async fn test_publish_copies_entity_and_invalidates_target() {
    let mut h = Harness::signed_in();
    let private = QueryDescriptor::private(catalog::PROJECT);
    let public = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    let source = project("p-1", "Mine", PRIVATE_SPACE);
    h.client.cache().get(&private).unwrap();
    h.serve(&private, vec![source.clone()]).await;
    h.client.cache().get(&public).unwrap();
    h.serve(&public, vec![]).await;

    let ticket = h
        .client
        .mutations()
        .publish(&source, &SpaceId::from(PUBLIC_SPACE))
        .unwrap();
    let record = h.client.mutations().mutation(ticket.local_id()).unwrap();
    assert_eq!(
        record.kind,
        MutationKind::Publish {
            source: source.id.clone()
        }
    );
    // Publishing is not optimistic.
    assert!(h.client.cache().peek(&public).unwrap().data.is_empty());

    let call = h.next_mutation().await;
    assert_eq!(call.context.mode, VisibilityMode::Public);
    assert_eq!(call.context.space_id, SpaceId::from(PUBLIC_SPACE));
    assert_eq!(call.payload, source.to_payload());
    call.confirm("pub-p-1");
    let published = ticket.outcome().await.unwrap();
    assert_ne!(published.id, source.id);

    let refetch = h.next_query().await;
    assert_eq!(refetch.descriptor, public);
    refetch.respond(vec![published.clone()]);
    let entry = h.client.cache().fetch(&public).await.unwrap();
    assert_eq!(ids(&entry.data), ["pub-p-1"]);

    // The source space is untouched.
    let private_entry = h.client.cache().peek(&private).unwrap();
    assert_eq!(private_entry.status, CacheStatus::Success);
    assert_eq!(ids(&private_entry.data), ["p-1"]);
    assert!(h.no_more_queries());
}

#[tokio::test]
async fn test_concurrent_publish_of_same_entity_is_rejected() {
    let mut h = Harness::signed_in();
    let source = project("p-1", "Mine", PRIVATE_SPACE);
    let first = h
        .client
        .mutations()
        .publish(&source, &SpaceId::from(PUBLIC_SPACE))
        .unwrap();

    let err = h
        .client
        .mutations()
        .publish(&source, &SpaceId::from("pub-2"))
        .unwrap_err();
    assert_eq!(
        err,
        MutationError::ConcurrentMutation {
            entity_type: catalog::PROJECT.into(),
            key: source.id.clone(),
        }
    );

    h.next_mutation().await.confirm("pub-p-1");
    first.outcome().await.unwrap();

    // Once settled, the entity can be published again.
    let second = h
        .client
        .mutations()
        .publish(&source, &SpaceId::from("pub-2"))
        .unwrap();
    h.next_mutation().await.confirm("pub-p-2");
    second.outcome().await.unwrap();
}

#[tokio::test]
async fn test_publish_requires_session() {
    let mut h = Harness::new(AnonymousSession);
    let err = h
        .client
        .mutations()
        .publish(
            &project("p-1", "x", PUBLIC_SPACE),
            &SpaceId::from(PUBLIC_SPACE),
        )
        .unwrap_err();
    assert_eq!(err, MutationError::Resolve(ResolveError::NoActiveSession));
    assert!(h.no_more_mutations());
}

// ── Events and shutdown ──────────────────────────────────────────

#[tokio::test]
async fn test_events_follow_mutation_lifecycle() {
    let mut h = Harness::signed_in();
    let ticket = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("Observe"), &SpaceId::from(""))
        .unwrap();
    let local_id = ticket.local_id().clone();

    let started = h
        .wait_for_event(|e| matches!(e, EventPayload::MutationStarted { .. }))
        .await;
    assert_eq!(
        started,
        EventPayload::MutationStarted {
            local_id: local_id.clone(),
            entity_type: catalog::TASK.into(),
            space_id: SpaceId::from(PRIVATE_SPACE),
        }
    );

    h.next_mutation().await.confirm("task-3");
    ticket.outcome().await.unwrap();
    let confirmed = h
        .wait_for_event(|e| matches!(e, EventPayload::MutationConfirmed { .. }))
        .await;
    assert_eq!(
        confirmed,
        EventPayload::MutationConfirmed {
            local_id,
            server_id: EntityId::new("task-3"),
        }
    );
}

#[tokio::test]
async fn test_shutdown_ignores_late_responses() {
    let mut h = Harness::signed_in();
    let descriptor = QueryDescriptor::public(catalog::PROJECT, PUBLIC_SPACE);
    let cache = h.client.cache().clone();
    let mut rx = cache.subscribe(&descriptor).unwrap();
    let call = h.next_query().await;

    let ticket = h
        .client
        .mutations()
        .create(catalog::TASK, task_payload("Late"), &SpaceId::from(""))
        .unwrap();
    let mutation = h.next_mutation().await;

    let Harness { client, .. } = h;
    client.shutdown();

    assert!(rx.changed().await.is_err());
    call.respond(vec![project("p-1", "late", PUBLIC_SPACE)]);
    mutation.confirm("task-late");

    assert_eq!(ticket.outcome().await.unwrap_err(), MutationError::Closed);
    assert!(cache.is_empty());
    assert_eq!(cache.get(&descriptor).unwrap_err(), CacheError::Closed);
}
