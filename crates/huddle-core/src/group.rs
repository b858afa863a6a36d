//! Named session registry with broadcast and multicast fan-out.
//!
//! # Locking
//!
//! One reader-writer lock guards the membership map. Queries and fan-out take
//! it shared, membership changes and `close` take it exclusive. Fan-out keeps
//! the shared lock for the whole push round, so a concurrent `close` waits
//! until every push of that round has finished (or hit the push timeout) and
//! never tears the map down underneath it.
//!
//! The closed flag is also mirrored in an atomic so [`Group::is_closed`] is
//! lock-free. It is only ever set while holding the write lock, which is what
//! keeps a racing `add` from slipping a session into a closed group.

use std::{
    collections::{HashMap, hash_map::Entry},
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::future::join_all;
use huddle_drivers::{DriverError, DriverKind, DriverRef, DriverRegistry};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::{Codec, GroupError, PushError, Session, SessionId, Uid};

/// Default cap on a single push during fan-out.
pub const DEFAULT_PUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Group tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupConfig {
    /// Encoding applied to every fan-out payload.
    pub codec: Codec,
    /// Upper bound on one push. `None` waits for the session indefinitely.
    pub push_timeout: Option<Duration>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self { codec: Codec::default(), push_timeout: Some(DEFAULT_PUSH_TIMEOUT) }
    }
}

/// Lifecycle state. `Working` moves to `Closed` once and never back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Accepting members and messages.
    Working,
    /// Terminal. Membership is empty and every mutation fails.
    Closed,
}

/// One member the fan-out failed to reach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushFailure {
    /// Connection ID of the member.
    pub session_id: SessionId,
    /// Bound logical identity, if any.
    pub uid: Option<Uid>,
    /// Why the push failed.
    pub error: PushError,
}

/// Outcome of one fan-out round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Members that accepted the message.
    pub delivered: usize,
    /// Members that did not, in push order.
    pub failures: Vec<PushFailure>,
}

impl FanOutReport {
    /// Number of members the round was addressed to.
    pub fn attempted(&self) -> usize {
        self.delivered + self.failures.len()
    }

    /// Whether every addressed member accepted the message.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

struct AttachedDriver {
    driver: DriverRef,
    /// Group connected the driver itself and closes it on `close`.
    owned: bool,
}

/// Named, concurrency-safe set of sessions.
///
/// Membership is keyed by [`Session::id`]. Lookups by logical identity or
/// UUID scan the map. Share a group between tasks with `Arc<Group<S>>`.
pub struct Group<S: Session> {
    name: String,
    closed: AtomicBool,
    sessions: RwLock<HashMap<SessionId, Arc<S>>>,
    driver: OnceLock<AttachedDriver>,
    config: GroupConfig,
}

impl<S: Session> Group<S> {
    /// Create an empty working group with no driver.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, GroupConfig::default())
    }

    /// Create an empty working group with explicit tuning.
    pub fn with_config(name: impl Into<String>, config: GroupConfig) -> Self {
        Self {
            name: name.into(),
            closed: AtomicBool::new(false),
            sessions: RwLock::new(HashMap::new()),
            driver: OnceLock::new(),
            config,
        }
    }

    /// Create a group sharing the registry's driver of `kind`.
    ///
    /// The driver stays owned by the registry; closing the group leaves it
    /// running.
    ///
    /// # Errors
    ///
    /// - `DriverNotInitialized` if the registry holds no driver of `kind`
    /// - `Driver` if the driver has been closed or fails to initialize
    pub fn with_existing_driver(
        name: impl Into<String>,
        kind: DriverKind,
        registry: &DriverRegistry,
    ) -> Result<Self, GroupError> {
        let driver = registry.get(kind).map_err(|e| match e {
            DriverError::NotInitialized(kind) => GroupError::DriverNotInitialized(kind),
            other => GroupError::Driver(other),
        })?;
        driver.as_driver().init()?;

        let group = Self::new(name);
        group.attach(driver, false)?;
        Ok(group)
    }

    /// Connect a new driver of `kind` and create a group that owns it.
    ///
    /// The driver is closed together with the group.
    ///
    /// # Errors
    ///
    /// - `Driver` with the connection error, unchanged
    pub async fn with_new_driver(
        name: impl Into<String>,
        kind: DriverKind,
        connection_string: &str,
    ) -> Result<Self, GroupError> {
        let driver = DriverRef::connect(kind, connection_string).await?;
        driver.as_driver().init()?;

        let group = Self::new(name);
        group.attach(driver, true)?;
        Ok(group)
    }

    /// Replace the tuning of a freshly built group.
    pub fn configured(mut self, config: GroupConfig) -> Self {
        self.config = config;
        self
    }

    /// Attach a driver the caller keeps ownership of.
    ///
    /// Closing the group leaves the driver running.
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed
    /// - `DriverAlreadyAttached` if the group already has a driver
    /// - `Driver` if the driver has been closed or fails to initialize
    pub async fn attach_driver(&self, driver: DriverRef) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }
        driver.as_driver().init()?;

        let _sessions = self.sessions.write().await;
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }
        self.attach(driver, false)
    }

    /// Connect a new driver of `kind` and attach it to this group.
    ///
    /// The group owns the driver and closes it on [`Group::close`].
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed, checked before and after connecting
    /// - `DriverAlreadyAttached` if the group already has a driver
    /// - `Driver` with the connection error, unchanged
    pub async fn init_driver(&self, kind: DriverKind, connection_string: &str) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }
        if let Some(attached) = self.driver.get() {
            return Err(GroupError::DriverAlreadyAttached(attached.driver.kind()));
        }

        let driver = DriverRef::connect(kind, connection_string).await?;
        if let Err(e) = self.attach_owned(&driver).await {
            driver.as_driver().close();
            return Err(e);
        }
        Ok(())
    }

    async fn attach_owned(&self, driver: &DriverRef) -> Result<(), GroupError> {
        driver.as_driver().init()?;

        let _sessions = self.sessions.write().await;
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }
        self.attach(driver.clone(), true)
    }

    /// Callers attaching to a shared group hold the membership write lock.
    fn attach(&self, driver: DriverRef, owned: bool) -> Result<(), GroupError> {
        let kind = driver.kind();
        self.driver
            .set(AttachedDriver { driver, owned })
            .map_err(|_| GroupError::DriverAlreadyAttached(self.driver().map_or(kind, DriverRef::kind)))?;

        tracing::info!(group = %self.name, %kind, owned, "driver attached");
        Ok(())
    }

    /// Group name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    pub fn status(&self) -> GroupStatus {
        if self.is_closed() { GroupStatus::Closed } else { GroupStatus::Working }
    }

    /// Whether the group has been closed. Lock-free.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Attached driver, if any.
    pub fn driver(&self) -> Option<&DriverRef> {
        self.driver.get().map(|attached| &attached.driver)
    }

    /// Fan-out tuning.
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Add `session` to the group.
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed
    /// - `DuplicateSession` if a session with the same ID is already a member
    pub async fn add(&self, session: Arc<S>) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }

        let mut sessions = self.sessions.write().await;
        // Close may have won the race for the write lock
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }

        let session_id = session.id();
        match sessions.entry(session_id) {
            Entry::Occupied(_) => Err(GroupError::DuplicateSession(session_id)),
            Entry::Vacant(slot) => {
                tracing::debug!(group = %self.name, session_id, uid = ?session.uid(), "session added");
                slot.insert(session);
                Ok(())
            },
        }
    }

    /// Remove `session` from the group. Removing a non-member succeeds.
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed
    pub async fn leave(&self, session: &S) -> Result<(), GroupError> {
        self.leave_by_id(session.id()).await
    }

    /// Remove the member with connection ID `session_id`, if present.
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed
    pub async fn leave_by_id(&self, session_id: SessionId) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }

        let mut sessions = self.sessions.write().await;
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }

        if sessions.remove(&session_id).is_some() {
            tracing::debug!(group = %self.name, session_id, "session left");
        }
        Ok(())
    }

    /// Remove every member.
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed
    pub async fn leave_all(&self) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }

        let mut sessions = self.sessions.write().await;
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }

        let removed = std::mem::take(&mut *sessions).len();
        tracing::debug!(group = %self.name, removed, "all sessions left");
        Ok(())
    }

    /// First member whose bound logical identity is `uid`.
    pub async fn member(&self, uid: Uid) -> Result<Arc<S>, GroupError> {
        self.sessions
            .read()
            .await
            .values()
            .find(|session| session.uid() == Some(uid))
            .cloned()
            .ok_or(GroupError::MemberNotFound)
    }

    /// First member whose UUID is exactly `uuid`.
    pub async fn member_by_uuid(&self, uuid: &str) -> Result<Arc<S>, GroupError> {
        self.sessions
            .read()
            .await
            .values()
            .find(|session| session.uuid() == uuid)
            .cloned()
            .ok_or(GroupError::MemberNotFound)
    }

    /// Member with connection ID `session_id`.
    pub async fn member_by_id(&self, session_id: SessionId) -> Result<Arc<S>, GroupError> {
        self.sessions.read().await.get(&session_id).cloned().ok_or(GroupError::MemberNotFound)
    }

    /// Snapshot of the bound logical identities. Unbound members are skipped.
    pub async fn members(&self) -> Vec<Uid> {
        self.sessions.read().await.values().filter_map(|session| session.uid()).collect()
    }

    /// Snapshot of member UUIDs.
    pub async fn members_uuid(&self) -> Vec<String> {
        self.sessions.read().await.values().map(|session| session.uuid().to_string()).collect()
    }

    /// Snapshot of member short UUIDs.
    pub async fn members_short_uuid(&self) -> Vec<String> {
        self.sessions.read().await.values().map(|session| session.short_uuid().to_string()).collect()
    }

    /// Whether a member is bound to `uid`.
    pub async fn contains(&self, uid: Uid) -> bool {
        self.member(uid).await.is_ok()
    }

    /// Whether a member has UUID `uuid`.
    pub async fn contains_uuid(&self, uuid: &str) -> bool {
        self.member_by_uuid(uuid).await.is_ok()
    }

    /// Current number of members.
    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Push `payload` to every member `filter` accepts.
    ///
    /// Per-member failures are logged and swallowed. Use
    /// [`Group::multicast_report`] to see them.
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed
    /// - `Codec` if `payload` cannot be encoded; nothing is pushed
    pub async fn multicast<T, F>(&self, route: &str, payload: &T, filter: F) -> Result<(), GroupError>
    where
        T: Serialize + ?Sized,
        F: Fn(&S) -> bool,
    {
        self.multicast_report(route, payload, filter).await.map(|_| ())
    }

    /// Push `payload` to every member `filter` accepts and report who failed.
    ///
    /// # Errors
    ///
    /// Same as [`Group::multicast`].
    pub async fn multicast_report<T, F>(
        &self,
        route: &str,
        payload: &T,
        filter: F,
    ) -> Result<FanOutReport, GroupError>
    where
        T: Serialize + ?Sized,
        F: Fn(&S) -> bool,
    {
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }
        let data = self.config.codec.encode(payload)?;
        self.fan_out(route, data, filter).await
    }

    /// Push `payload` to every member.
    ///
    /// All members are attempted even when some fail.
    ///
    /// # Errors
    ///
    /// - `ClosedGroup` if the group is closed
    /// - `Codec` if `payload` cannot be encoded; nothing is pushed
    /// - `Push` with the last member failure, after the round completes
    pub async fn broadcast<T>(&self, route: &str, payload: &T) -> Result<(), GroupError>
    where
        T: Serialize + ?Sized,
    {
        let report = self.multicast_report(route, payload, |_| true).await?;

        match report.failures.into_iter().last() {
            Some(failure) => {
                Err(GroupError::Push { session_id: failure.session_id, source: failure.error })
            },
            None => Ok(()),
        }
    }

    /// Close the group and drop every member.
    ///
    /// A driver the group connected itself is closed too; a shared driver is
    /// left to its registry.
    ///
    /// # Errors
    ///
    /// - `AlreadyClosed` on every call after the first
    pub async fn close(&self) -> Result<(), GroupError> {
        if self.is_closed() {
            return Err(GroupError::AlreadyClosed);
        }

        let mut sessions = self.sessions.write().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(GroupError::AlreadyClosed);
        }
        let dropped = std::mem::take(&mut *sessions).len();
        drop(sessions);

        if let Some(attached) = self.driver.get() {
            if attached.owned {
                attached.driver.as_driver().close();
            }
        }

        tracing::info!(group = %self.name, dropped, "group closed");
        Ok(())
    }

    async fn fan_out<F>(&self, route: &str, data: Bytes, filter: F) -> Result<FanOutReport, GroupError>
    where
        F: Fn(&S) -> bool,
    {
        let sessions = self.sessions.read().await;
        if self.is_closed() {
            return Err(GroupError::ClosedGroup);
        }

        let targets: Vec<&Arc<S>> = sessions.values().filter(|session| filter(session)).collect();
        let results =
            join_all(targets.iter().map(|session| self.push_one(session, route, data.clone()))).await;

        let mut report = FanOutReport::default();
        for (session, result) in targets.into_iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    tracing::warn!(
                        group = %self.name,
                        session_id = session.id(),
                        uid = ?session.uid(),
                        route,
                        %error,
                        "push failed"
                    );
                    report.failures.push(PushFailure { session_id: session.id(), uid: session.uid(), error });
                },
            }
        }

        tracing::debug!(
            group = %self.name,
            route,
            bytes = data.len(),
            delivered = report.delivered,
            failed = report.failures.len(),
            "fan-out complete"
        );
        Ok(report)
    }

    async fn push_one(&self, session: &S, route: &str, data: Bytes) -> Result<(), PushError> {
        match self.config.push_timeout {
            Some(limit) => tokio::time::timeout(limit, session.push(route, data))
                .await
                .unwrap_or(Err(PushError::Timeout(limit))),
            None => session.push(route, data).await,
        }
    }
}

impl<S: Session> std::fmt::Debug for Group<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Group")
            .field("name", &self.name)
            .field("status", &self.status())
            .field("driver", &self.driver())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct Recorder {
        id: SessionId,
        uid: Option<Uid>,
        uuid: String,
        pushed: Mutex<Vec<(String, Bytes)>>,
        fail: bool,
    }

    impl Recorder {
        fn new(id: SessionId, uid: Option<Uid>) -> Arc<Self> {
            Arc::new(Self { id, uid, uuid: format!("{id:08x}-uuid"), ..Self::default() })
        }

        fn failing(id: SessionId) -> Arc<Self> {
            Arc::new(Self { id, uid: Some(id), uuid: format!("{id:08x}-uuid"), fail: true, ..Self::default() })
        }

        fn pushed(&self) -> Vec<(String, Bytes)> {
            self.pushed.lock().unwrap().clone()
        }
    }

    impl Session for Recorder {
        fn id(&self) -> SessionId {
            self.id
        }

        fn uid(&self) -> Option<Uid> {
            self.uid
        }

        fn uuid(&self) -> &str {
            &self.uuid
        }

        async fn push(&self, route: &str, data: Bytes) -> Result<(), PushError> {
            if self.fail {
                return Err(PushError::Closed);
            }
            self.pushed.lock().unwrap().push((route.to_string(), data));
            Ok(())
        }
    }

    #[tokio::test]
    async fn new_group_is_working_and_empty() {
        let group: Group<Recorder> = Group::new("room-1");

        assert_eq!(group.name(), "room-1");
        assert_eq!(group.status(), GroupStatus::Working);
        assert_eq!(group.count().await, 0);
        assert!(group.driver().is_none());
    }

    #[tokio::test]
    async fn room_scenario() {
        let group = Group::new("room-1");
        let a = Recorder::new(1, Some(100));
        let b = Recorder::new(2, Some(200));
        group.add(a.clone()).await.unwrap();
        group.add(b.clone()).await.unwrap();

        group.broadcast("onNewUser", &"hello").await.unwrap();
        assert_eq!(a.pushed(), vec![("onNewUser".to_string(), Bytes::from_static(b"\"hello\""))]);
        assert_eq!(b.pushed().len(), 1);

        group.leave(&a).await.unwrap();
        assert_eq!(group.count().await, 1);

        group.close().await.unwrap();
        assert_eq!(group.add(b).await, Err(GroupError::ClosedGroup));
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let group = Group::new("g");
        group.add(Recorder::new(7, None)).await.unwrap();

        let err = group.add(Recorder::new(7, Some(1))).await.unwrap_err();
        assert_eq!(err, GroupError::DuplicateSession(7));
        assert_eq!(group.count().await, 1);
        // Original entry survives
        assert_eq!(group.member_by_id(7).await.unwrap().uid(), None);
    }

    #[tokio::test]
    async fn members_skip_unbound_sessions() {
        let group = Group::new("g");
        group.add(Recorder::new(1, Some(10))).await.unwrap();
        group.add(Recorder::new(2, None)).await.unwrap();

        assert_eq!(group.members().await, vec![10]);
        assert_eq!(group.members_uuid().await.len(), 2);
        assert!(group.members_short_uuid().await.iter().all(|uuid| uuid.len() == 8));
    }

    #[tokio::test]
    async fn lookups() {
        let group = Group::new("g");
        assert_eq!(group.member(10).await.unwrap_err(), GroupError::MemberNotFound);
        assert_eq!(group.member_by_uuid("00000001-uuid").await.unwrap_err(), GroupError::MemberNotFound);
        assert_eq!(group.member_by_id(1).await.unwrap_err(), GroupError::MemberNotFound);

        let session = Recorder::new(1, Some(10));
        group.add(session.clone()).await.unwrap();

        assert_eq!(group.member(10).await.unwrap().id(), 1);
        assert_eq!(group.member_by_uuid(session.uuid()).await.unwrap().id(), 1);
        assert!(group.contains(10).await);
        assert!(group.contains_uuid(session.uuid()).await);
        assert!(!group.contains(11).await);
        assert!(!group.contains_uuid("00000001").await);
    }

    #[tokio::test]
    async fn leave_non_member_and_leave_all() {
        let group: Group<Recorder> = Group::new("g");
        group.leave(&Recorder::new(99, None)).await.unwrap();

        group.add(Recorder::new(1, None)).await.unwrap();
        group.add(Recorder::new(2, None)).await.unwrap();
        group.leave_all().await.unwrap();
        assert_eq!(group.count().await, 0);
    }

    #[tokio::test]
    async fn closed_group_rejects_everything() {
        let group = Group::new("g");
        let session = Recorder::new(1, Some(1));
        group.add(session.clone()).await.unwrap();

        group.close().await.unwrap();
        assert_eq!(group.status(), GroupStatus::Closed);
        assert_eq!(group.count().await, 0);

        assert_eq!(group.add(session.clone()).await, Err(GroupError::ClosedGroup));
        assert_eq!(group.leave(&session).await, Err(GroupError::ClosedGroup));
        assert_eq!(group.leave_all().await, Err(GroupError::ClosedGroup));
        assert_eq!(group.multicast("r", &1, |_| true).await, Err(GroupError::ClosedGroup));
        assert_eq!(group.broadcast("r", &1).await, Err(GroupError::ClosedGroup));
        assert_eq!(group.close().await, Err(GroupError::AlreadyClosed));
        assert!(session.pushed().is_empty());
    }

    #[tokio::test]
    async fn multicast_respects_filter_and_swallows_failures() {
        let group = Group::new("g");
        let even = Recorder::new(2, Some(2));
        let odd = Recorder::new(3, Some(3));
        let broken = Recorder::failing(4);
        for session in [even.clone(), odd.clone(), broken.clone()] {
            group.add(session).await.unwrap();
        }

        group.multicast("r", &"x", |s| s.id() % 2 == 0).await.unwrap();
        assert_eq!(even.pushed().len(), 1);
        assert!(odd.pushed().is_empty());

        let report = group.multicast_report("r", &"x", |s| s.id() % 2 == 0).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.failures, vec![PushFailure { session_id: 4, uid: Some(4), error: PushError::Closed }]);
        assert_eq!(report.attempted(), 2);

        let report = group.multicast_report("r", &"x", |_| false).await.unwrap();
        assert_eq!(report, FanOutReport::default());
    }

    #[tokio::test]
    async fn broadcast_reaches_others_and_returns_failure() {
        let group = Group::new("g");
        let ok = Recorder::new(1, Some(1));
        group.add(ok.clone()).await.unwrap();
        group.add(Recorder::failing(2)).await.unwrap();

        let err = group.broadcast("r", &"x").await.unwrap_err();
        assert_eq!(err, GroupError::Push { session_id: 2, source: PushError::Closed });
        assert_eq!(ok.pushed().len(), 1);
    }

    #[tokio::test]
    async fn encode_failure_pushes_nothing() {
        let group = Group::new("g");
        let session = Recorder::new(1, None);
        group.add(session.clone()).await.unwrap();

        let mut bad = std::collections::BTreeMap::new();
        bad.insert((1u8, 2u8), 0u8);

        assert!(matches!(group.broadcast("r", &bad).await, Err(GroupError::Codec(_))));
        assert!(session.pushed().is_empty());
    }

    #[tokio::test]
    async fn cbor_groups_push_cbor() {
        let config = GroupConfig { codec: Codec::Cbor, ..GroupConfig::default() };
        let group = Group::with_config("g", config);
        let session = Recorder::new(1, None);
        group.add(session.clone()).await.unwrap();

        group.broadcast("r", &42u32).await.unwrap();
        let (_, data) = session.pushed().remove(0);
        assert_eq!(Codec::Cbor.decode::<u32>(&data).unwrap(), 42);
    }
}
