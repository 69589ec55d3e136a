//! Forward lifecycle.
//!
//! The engine owns every controller, the forward registry and the traffic
//! meter. Forwards are identified by a generated [`ForwardId`] at runtime
//! and by their [`NaturalKey`] across restarts of the same definition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::controller::TunnelController;
use super::model::{ActiveForward, ForwardSpec, NaturalKey, Project};
use super::registry::ForwardRegistry;
use super::session::{ForwardContext, SessionSettings};
use super::traffic::{Clock, SystemClock, TrafficMeter, TrafficSnapshot};
use super::transport::ChannelConnector;
use crate::config::EngineSettings;
use crate::error::{Result, TunnelError};
use crate::kube::CredentialResolver;
use crate::protocol::ForwardId;

/// Per-forward overrides of the engine settings
#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    pub response_timeout: Option<Duration>,
}

pub struct TunnelEngine {
    resolver: Arc<CredentialResolver>,
    connector: Arc<dyn ChannelConnector>,
    settings: EngineSettings,
    registry: ForwardRegistry,
    traffic: Arc<TrafficMeter>,
    controllers: Mutex<HashMap<ForwardId, Arc<TunnelController>>>,
    /// Projects started through `start_project` and not stopped since
    projects: Mutex<HashMap<String, Project>>,
    shutdown: CancellationToken,
    publisher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TunnelEngine {
    /// Create an engine and start publishing traffic snapshots.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(
        resolver: Arc<CredentialResolver>,
        connector: Arc<dyn ChannelConnector>,
        settings: EngineSettings,
    ) -> Self {
        Self::with_clock(resolver, connector, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        resolver: Arc<CredentialResolver>,
        connector: Arc<dyn ChannelConnector>,
        settings: EngineSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let traffic = Arc::new(TrafficMeter::new(clock));
        let shutdown = CancellationToken::new();
        let publisher = traffic.spawn_publisher(settings.traffic_interval(), shutdown.clone());

        Self {
            resolver,
            connector,
            settings,
            registry: ForwardRegistry::new(),
            traffic,
            controllers: Mutex::new(HashMap::new()),
            projects: Mutex::new(HashMap::new()),
            shutdown,
            publisher: std::sync::Mutex::new(Some(publisher)),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Start one forward, or return the running controller for its natural key.
    ///
    /// Nothing is registered when credentials can't be resolved or the local
    /// port can't be bound.
    pub async fn start_forward(
        &self,
        project: &Project,
        spec: &ForwardSpec,
        options: ForwardOptions,
    ) -> Result<Arc<TunnelController>> {
        let mut controllers = self.controllers.lock().await;

        let key = NaturalKey::new(&project.name, spec);
        if let Some(existing) = self.registry.find_by_key(&key) {
            if let Some(controller) = controllers.get(&existing.id) {
                debug!("Forward {} already active as {}", spec.display_name(), existing.id);
                return Ok(Arc::clone(controller));
            }
        }

        let context = spec.context_name(project);
        // Fail fast instead of on the first accepted connection
        self.resolver.resolve(context)?;

        let ctx = Arc::new(ForwardContext {
            project: project.name.clone(),
            context: context.to_string(),
            namespace: spec.namespace().to_string(),
            target: spec.target.clone(),
            remote_port: spec.remote_port,
            resolver: Arc::clone(&self.resolver),
            connector: Arc::clone(&self.connector),
            meter: Arc::clone(&self.traffic),
            settings: self.session_settings(&options),
        });

        let id = ForwardId::generate();
        let controller = Arc::new(
            TunnelController::bind(
                id.clone(),
                &self.settings.bind_address,
                spec.local_port,
                ctx,
            )
            .await?,
        );

        let record = ActiveForward::new(id.clone(), project, spec, controller.local_addr());
        info!(
            "Forwarding {} -> {}/{}:{} ({})",
            record.local_addr, record.namespace, record.target, record.remote_port, record.project
        );

        controllers.insert(id, Arc::clone(&controller));
        self.registry.insert(record);
        Ok(controller)
    }

    /// Stop a forward. Returns false when no forward has this id.
    pub async fn stop_forward(&self, id: &ForwardId) -> bool {
        // Held until the record is gone so a concurrent start sees the port free
        let mut controllers = self.controllers.lock().await;
        let Some(controller) = controllers.remove(id) else {
            debug!("Forward {} is not active", id);
            return false;
        };

        controller.close().await;
        if let Some(record) = self.registry.remove(id) {
            info!("Stopped {} ({})", record.local_addr, record.project);
        }
        true
    }

    /// Stop every forward of `project`, a short stagger apart.
    pub async fn stop_project(&self, project: &Project) {
        self.traffic.clear(&project.name).await;
        self.projects.lock().await.remove(&project.name);

        for spec in &project.forwards {
            tokio::time::sleep(self.settings.stop_stagger()).await;

            let key = NaturalKey::new(&project.name, spec);
            if let Some(record) = self.registry.find_by_key(&key) {
                self.stop_forward(&record.id).await;
            }
        }
        // Sessions may have recorded traffic during the stagger
        self.traffic.clear(&project.name).await;

        debug!("Project {} stopped", project.name);
    }

    /// Start every forward of `project` in declaration order.
    ///
    /// Active projects sharing the staging group are stopped first. Forwards
    /// that fail to start are reported through `on_error` and skipped.
    pub async fn start_project<F>(
        &self,
        project: &Project,
        mut on_error: F,
    ) -> Vec<Arc<TunnelController>>
    where
        F: FnMut(&ForwardSpec, TunnelError),
    {
        if let Some(group) = project.staging_group.as_deref() {
            let siblings: Vec<Project> = self
                .projects
                .lock()
                .await
                .values()
                .filter(|p| p.name != project.name && p.staging_group.as_deref() == Some(group))
                .cloned()
                .collect();

            for sibling in &siblings {
                info!(
                    "Stopping {} (staging group {}) before starting {}",
                    sibling.name, group, project.name
                );
                self.stop_project(sibling).await;
            }

            // Closed sockets may take a moment to release their ports
            if !siblings.is_empty() {
                tokio::time::sleep(self.settings.settle_delay()).await;
            }
        }

        self.projects
            .lock()
            .await
            .insert(project.name.clone(), project.clone());

        let mut started = Vec::with_capacity(project.forwards.len());
        for spec in &project.forwards {
            match self.start_forward(project, spec, ForwardOptions::default()).await {
                Ok(controller) => started.push(controller),
                Err(e) => {
                    warn!("Failed to start {}: {}", spec.display_name(), e);
                    on_error(spec, e);
                }
            }
        }
        started
    }

    pub fn subscribe_forwards(&self) -> watch::Receiver<Vec<ActiveForward>> {
        self.registry.subscribe()
    }

    pub fn active_forwards(&self) -> Vec<ActiveForward> {
        self.registry.list()
    }

    pub fn subscribe_traffic(&self) -> watch::Receiver<TrafficSnapshot> {
        self.traffic.subscribe()
    }

    pub async fn traffic_snapshot(&self) -> TrafficSnapshot {
        self.traffic.snapshot().await
    }

    /// Names of projects started and not stopped since
    pub async fn active_projects(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stop every forward and the traffic publisher
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let mut controllers = self.controllers.lock().await;
        for (id, controller) in controllers.drain() {
            controller.close().await;
            self.registry.remove(&id);
        }
        drop(controllers);
        self.projects.lock().await.clear();

        let publisher = self
            .publisher
            .lock()
            .ok()
            .and_then(|mut publisher| publisher.take());
        if let Some(publisher) = publisher {
            let _ = publisher.await;
        }

        info!("Tunnel engine stopped");
    }

    fn session_settings(&self, options: &ForwardOptions) -> SessionSettings {
        SessionSettings {
            response_timeout: options
                .response_timeout
                .unwrap_or_else(|| self.settings.response_timeout()),
            retry_delay: self.settings.retry_delay(),
            open_timeout: self.settings.open_timeout(),
            max_attempts: self.settings.max_attempts(),
            failure_response: self.settings.failure_response,
        }
    }
}

impl Drop for TunnelEngine {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::{test_resolver, Behavior, MockConnector, MockEvent, REPLY};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn settings() -> EngineSettings {
        EngineSettings {
            retry_delay_ms: 10,
            stop_stagger_ms: 1,
            settle_delay_ms: 20,
            traffic_interval_ms: 20,
            ..Default::default()
        }
    }

    type Harness = (TunnelEngine, Arc<MockConnector>, UnboundedReceiver<MockEvent>);

    fn engine(behavior: Behavior) -> Harness {
        let (connector, events) = MockConnector::new(behavior);
        let engine = TunnelEngine::new(test_resolver(), connector.clone(), settings());
        (engine, connector, events)
    }

    fn project(name: &str) -> Project {
        Project::new(name, "test-ctx")
    }

    fn web() -> ForwardSpec {
        ForwardSpec::new("web-1", 8080, 0)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let project = project("shop");
        let spec = ForwardSpec::new("web-1", 8080, 0);

        let first = engine
            .start_forward(&project, &spec, ForwardOptions::default())
            .await
            .unwrap();
        let second = engine
            .start_forward(&project, &spec, ForwardOptions::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.active_forwards().len(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_absent_is_noop() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let mut rx = engine.subscribe_forwards();

        assert!(!engine.stop_forward(&ForwardId::from("missing")).await);
        assert!(!rx.has_changed().unwrap());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_forward_unregisters() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let controller = engine
            .start_forward(&project("shop"), &web(), ForwardOptions::default())
            .await
            .unwrap();

        assert!(engine.stop_forward(controller.id()).await);
        assert!(controller.is_closed());
        assert!(engine.active_forwards().is_empty());
        assert!(!engine.stop_forward(controller.id()).await);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_failure_is_not_registered() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();

        let result = engine
            .start_forward(
                &project("shop"),
                &ForwardSpec::new("web-1", 8080, port),
                ForwardOptions::default(),
            )
            .await;

        assert!(matches!(result, Err(TunnelError::Bind { .. })));
        assert!(engine.active_forwards().is_empty());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_context_is_not_registered() {
        let (engine, connector, _events) = engine(Behavior::Respond);
        let spec = ForwardSpec::new("web-1", 8080, 0).with_context("missing");

        let result = engine
            .start_forward(&project("shop"), &spec, ForwardOptions::default())
            .await;

        assert!(matches!(result, Err(TunnelError::Credential(_))));
        assert!(engine.active_forwards().is_empty());
        assert_eq!(connector.attempts(), 0);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_bridges_bytes_and_meters_traffic() {
        let (engine, _connector, mut events) = engine(Behavior::Respond);
        let project = project("shop");
        let controller = engine
            .start_forward(&project, &web(), ForwardOptions::default())
            .await
            .unwrap();

        let mut client = TcpStream::connect(controller.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1").await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, REPLY);

        let Some(MockEvent::Frame(frame)) = events.recv().await else {
            panic!("expected a frame");
        };
        assert_eq!(frame.len(), 13);
        assert_eq!(frame[0], 0x00);

        let snapshot = engine.traffic_snapshot().await;
        let total: u64 = snapshot["shop"].iter().map(|e| e.bytes).sum();
        assert!(total >= 21, "metered {} bytes", total);

        drop(client);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_bound_ends_local_socket() {
        let (engine, connector, _events) = engine(Behavior::CloseImmediately);
        let controller = engine
            .start_forward(&project("shop"), &web(), ForwardOptions::default())
            .await
            .unwrap();

        let mut client = TcpStream::connect(controller.local_addr()).await.unwrap();
        let mut buf = Vec::new();
        let err = client.read_to_end(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);
        assert_eq!(connector.attempts(), 4);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_clean_disconnect_does_not_reconnect() {
        let (engine, connector, _events) = engine(Behavior::ReplyThenClose);
        let controller = engine
            .start_forward(&project("shop"), &web(), ForwardOptions::default())
            .await
            .unwrap();

        let mut client = TcpStream::connect(controller.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, REPLY);
        assert_eq!(connector.attempts(), 1);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_local_close_closes_remote() {
        let (engine, _connector, mut events) = engine(Behavior::Respond);
        let controller = engine
            .start_forward(&project("shop"), &web(), ForwardOptions::default())
            .await
            .unwrap();

        let mut client = TcpStream::connect(controller.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        drop(client);

        assert!(matches!(events.recv().await, Some(MockEvent::Frame(_))));
        assert_eq!(events.recv().await, Some(MockEvent::Closed));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_response_timeout_override() {
        let (connector, _events) = MockConnector::new(Behavior::Silent);
        let engine = TunnelEngine::new(
            test_resolver(),
            connector,
            EngineSettings {
                failure_response: crate::config::FailureResponse::Http,
                ..settings()
            },
        );
        let controller = engine
            .start_forward(
                &project("shop"),
                &ForwardSpec::new("web-1", 8080, 0),
                ForwardOptions {
                    response_timeout: Some(Duration::from_millis(50)),
                },
            )
            .await
            .unwrap();

        let mut client = TcpStream::connect(controller.local_addr()).await.unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 504"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_project_reports_failures() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = occupied.local_addr().unwrap().port();
        let project = project("shop")
            .with_forward(ForwardSpec::new("web-1", 8080, 0))
            .with_forward(ForwardSpec::new("db-0", 5432, port))
            .with_forward(ForwardSpec::new("cache-0", 6379, 0).with_context("missing"));

        let mut failed = Vec::new();
        let started = engine
            .start_project(&project, |spec, e| failed.push((spec.target.clone(), e)))
            .await;

        assert_eq!(started.len(), 1);
        assert_eq!(failed.len(), 2);
        assert_eq!(failed[0].0, "db-0");
        assert!(matches!(failed[0].1, TunnelError::Bind { .. }));
        assert!(matches!(failed[1].1, TunnelError::Credential(_)));
        assert_eq!(engine.active_forwards().len(), 1);
        assert_eq!(engine.active_projects().await, vec!["shop".to_string()]);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_project_clears_forwards_and_traffic() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let project = project("shop")
            .with_forward(ForwardSpec::new("web-1", 8080, 0))
            .with_forward(ForwardSpec::new("db-0", 5432, 0));
        let started = engine.start_project(&project, |_, _| {}).await;

        let mut client = TcpStream::connect(started[0].local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        assert!(engine.traffic_snapshot().await.contains_key("shop"));

        engine.stop_project(&project).await;
        assert!(engine.active_forwards().is_empty());
        assert!(!engine.traffic_snapshot().await.contains_key("shop"));
        assert!(engine.active_projects().await.is_empty());
        assert!(started.iter().all(|c| c.is_closed()));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_project_drops_traffic_recorded_while_stopping() {
        let (connector, _events) = MockConnector::new(Behavior::Respond);
        let engine = TunnelEngine::new(
            test_resolver(),
            connector,
            EngineSettings {
                stop_stagger_ms: 100,
                ..settings()
            },
        );
        let project = project("shop").with_forward(ForwardSpec::new("web-1", 8080, 0));
        engine.start_project(&project, |_, _| {}).await;

        tokio::join!(engine.stop_project(&project), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine.traffic.record("shop", 5).await;
        });

        assert!(!engine.traffic_snapshot().await.contains_key("shop"));
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_while_stopping_rebinds_port() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let project = project("shop");
        let spec = ForwardSpec::new("web-1", 8080, port);
        let first = engine
            .start_forward(&project, &spec, ForwardOptions::default())
            .await
            .unwrap();

        let (stopped, restarted) = tokio::join!(
            engine.stop_forward(first.id()),
            engine.start_forward(&project, &spec, ForwardOptions::default())
        );

        assert!(stopped);
        let restarted = restarted.unwrap();
        assert_ne!(restarted.id(), first.id());
        assert_eq!(restarted.local_addr().port(), port);
        let forwards = engine.active_forwards();
        assert_eq!(forwards.len(), 1);
        assert_eq!(&forwards[0].id, restarted.id());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_staging_group_is_exclusive() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let old = project("shop-a")
            .with_staging_group("stg")
            .with_forward(ForwardSpec::new("web-1", 8080, 0));
        let other = project("blog").with_forward(ForwardSpec::new("blog-0", 80, 0));
        let new = project("shop-b")
            .with_staging_group("stg")
            .with_forward(ForwardSpec::new("web-2", 8080, 0));

        let old_controllers = engine.start_project(&old, |_, _| {}).await;
        engine.start_project(&other, |_, _| {}).await;
        let mut rx = engine.subscribe_forwards();
        rx.borrow_and_update();

        engine.start_project(&new, |_, _| {}).await;

        let forwards = engine.active_forwards();
        assert!(forwards.iter().all(|f| f.project != "shop-a"));
        assert!(forwards.iter().any(|f| f.project == "shop-b"));
        assert!(forwards.iter().any(|f| f.project == "blog"));
        assert!(old_controllers[0].is_closed());
        assert_eq!(
            engine.active_projects().await,
            vec!["blog".to_string(), "shop-b".to_string()]
        );
        assert!(rx.has_changed().unwrap());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_staging_group_reuses_ports() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let free = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = free.local_addr().unwrap().port();
        drop(free);

        let old = project("shop-a")
            .with_staging_group("stg")
            .with_forward(ForwardSpec::new("web-1", 8080, port));
        let new = project("shop-b")
            .with_staging_group("stg")
            .with_forward(ForwardSpec::new("web-2", 8080, port));

        assert_eq!(engine.start_project(&old, |_, _| {}).await.len(), 1);
        let mut failures = 0;
        let started = engine.start_project(&new, |_, _| failures += 1).await;

        assert_eq!(failures, 0);
        assert_eq!(started[0].local_addr().port(), port);
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let project = project("shop").with_forward(ForwardSpec::new("web-1", 8080, 0));
        let started = engine.start_project(&project, |_, _| {}).await;

        engine.shutdown().await;
        assert!(engine.active_forwards().is_empty());
        assert!(started[0].is_closed());
    }

    #[tokio::test]
    async fn test_traffic_subscription_publishes() {
        let (engine, _connector, _events) = engine(Behavior::Respond);
        let mut rx = engine.subscribe_traffic();
        let controller = engine
            .start_forward(&project("shop"), &web(), ForwardOptions::default())
            .await
            .unwrap();

        let mut client = TcpStream::connect(controller.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();

        loop {
            rx.changed().await.unwrap();
            if rx.borrow_and_update().contains_key("shop") {
                break;
            }
        }
        engine.shutdown().await;
    }
}
