use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AppClientConf;
use crate::deploy::{AppClientListener, ApplicationDescription, DeployMessage};
use crate::rpc::{EndpointAddress, RpcAddress, RpcCallContext, RpcEndpoint, RpcEndpointRef, RpcEnv};


/// the name under which the client's endpoint is registered in its RPC environment
pub const APP_CLIENT_ENDPOINT_NAME: &str = "AppClient";
/// the well-known name of the master's endpoint
pub const MASTER_ENDPOINT_NAME: &str = "Master";


/// A point-in-time view of a client's registration
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RegistrationState {
    pub app_id: Option<String>,
    pub registered: bool,
    pub disconnected: bool,
    pub dead: bool,
    /// the number of the most recent registration attempt, 0 before the first one
    pub attempt: u32,
}

/// The state of one registration session. No lock is held across a network call, and the flags
///  change by compare-and-set so that every transition is reported once.
#[derive(Default)]
struct Session {
    app_id: RwLock<Option<String>>,
    master: RwLock<Option<Arc<dyn RpcEndpointRef>>>,
    registered: AtomicBool,
    disconnected: AtomicBool,
    /// never reset once set
    dead: AtomicBool,
    attempt: AtomicU32,
}

impl Session {
    fn app_id(&self) -> Option<String> {
        self.app_id.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn master(&self) -> Option<Arc<dyn RpcEndpointRef>> {
        self.master.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_app_id(&self, app_id: String) {
        *self.app_id.write().unwrap_or_else(PoisonError::into_inner) = Some(app_id);
    }

    fn set_master(&self, master: Arc<dyn RpcEndpointRef>) {
        *self.master.write().unwrap_or_else(PoisonError::into_inner) = Some(master);
    }

    fn snapshot(&self) -> RegistrationState {
        RegistrationState {
            app_id: self.app_id(),
            registered: self.registered.load(Ordering::Acquire),
            disconnected: self.disconnected.load(Ordering::Acquire),
            dead: self.dead.load(Ordering::Acquire),
            attempt: self.attempt.load(Ordering::Acquire),
        }
    }
}


/// Registers an application with the cluster master and keeps the registration alive: it retries
///  unanswered registrations, follows the master through failover, and reports what happens to
///  the application and its executors to an [AppClientListener].
///
/// The protocol runs in an endpoint named [APP_CLIENT_ENDPOINT_NAME], so the master talks to the
///  client through the RPC environment like to any other endpoint.
pub struct AppClient {
    rpc_env: Arc<dyn RpcEnv>,
    master_address: RpcAddress,
    description: ApplicationDescription,
    listener: Arc<dyn AppClientListener>,
    conf: AppClientConf,
    session: Arc<Session>,
    started: AtomicBool,
    endpoint: RwLock<Option<Arc<dyn RpcEndpointRef>>>,
}

impl AppClient {
    pub fn new(
        rpc_env: Arc<dyn RpcEnv>,
        master_url: &str,
        description: ApplicationDescription,
        listener: Arc<dyn AppClientListener>,
        conf: AppClientConf,
    ) -> anyhow::Result<AppClient> {
        let master_address = RpcAddress::from_url(master_url)?;
        Ok(AppClient {
            rpc_env,
            master_address,
            description,
            listener,
            conf,
            session: Default::default(),
            started: AtomicBool::new(false),
            endpoint: Default::default(),
        })
    }

    /// Sets up the client's endpoint, which starts registering with the master. A client can be
    ///  started only once.
    pub async fn start(&self) -> anyhow::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            bail!("application client for {} was already started", self.description.name);
        }

        let endpoint = ClientEndpoint::new(
            self.rpc_env.clone(),
            self.master_address.clone(),
            self.description.clone(),
            self.listener.clone(),
            self.conf.clone(),
            self.session.clone(),
        );
        let endpoint_ref = self.rpc_env.setup_endpoint(APP_CLIENT_ENDPOINT_NAME, endpoint).await?;
        *self.endpoint.write().unwrap_or_else(PoisonError::into_inner) = Some(endpoint_ref);
        Ok(())
    }

    /// Unregisters the application and shuts the client down. Returns `false` if the client was
    ///  not running or did not confirm.
    pub async fn stop(&self) -> bool {
        let endpoint = self.endpoint.write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(endpoint) = endpoint else {
            debug!("application client is not running");
            return false;
        };

        match endpoint.ask(DeployMessage::StopAppClient).await {
            Ok(stopped) => stopped,
            Err(e) => {
                warn!("failed to stop application client: {:#}", e);
                false
            }
        }
    }

    /// Asks the master for a total of `requested_total` executors. `Ok(false)` means the request
    ///  was not sent because the application is not registered yet.
    pub async fn request_total_executors(&self, requested_total: u32) -> anyhow::Result<bool> {
        let Some((endpoint, app_id)) = self.registered_endpoint() else {
            warn!("attempted to request executors before registering with master");
            return Ok(false);
        };
        endpoint.ask(DeployMessage::RequestExecutors { app_id, requested_total }).await
    }

    /// Asks the master to kill the given executors. `Ok(false)` means the request was not sent
    ///  because the application is not registered yet.
    pub async fn kill_executors(&self, executor_ids: Vec<String>) -> anyhow::Result<bool> {
        let Some((endpoint, app_id)) = self.registered_endpoint() else {
            warn!("attempted to kill executors before registering with master");
            return Ok(false);
        };
        endpoint.ask(DeployMessage::KillExecutors { app_id, executor_ids }).await
    }

    pub async fn registration_state(&self) -> RegistrationState {
        self.session.snapshot()
    }

    fn registered_endpoint(&self) -> Option<(Arc<dyn RpcEndpointRef>, String)> {
        let endpoint = self.endpoint.read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()?;
        let app_id = self.session.app_id()?;
        Some((endpoint, app_id))
    }
}


/// The registration attempt in flight and the timer that supersedes it. Each timer carries the
///  number of the attempt it was armed for, and a timer for any other attempt does nothing.
#[derive(Default)]
struct RegistrationTasks {
    attempt: u32,
    attempt_task: Option<JoinHandle<()>>,
    retry_timer: Option<JoinHandle<()>>,
    /// no further attempts once this is set
    released: bool,
}

impl RegistrationTasks {
    fn cancel_attempt(&mut self) {
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
    }

    fn release(&mut self) {
        self.released = true;
        self.cancel_attempt();
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}


struct ClientEndpoint {
    myself: Weak<ClientEndpoint>,
    rpc_env: Arc<dyn RpcEnv>,
    master_address: RpcAddress,
    description: ApplicationDescription,
    listener: Arc<dyn AppClientListener>,
    conf: AppClientConf,
    session: Arc<Session>,
    tasks: Mutex<RegistrationTasks>,
}

impl ClientEndpoint {
    fn new(
        rpc_env: Arc<dyn RpcEnv>,
        master_address: RpcAddress,
        description: ApplicationDescription,
        listener: Arc<dyn AppClientListener>,
        conf: AppClientConf,
        session: Arc<Session>,
    ) -> Arc<ClientEndpoint> {
        Arc::new_cyclic(|myself| ClientEndpoint {
            myself: myself.clone(),
            rpc_env,
            master_address,
            description,
            listener,
            conf,
            session,
            tasks: Default::default(),
        })
    }

    fn address(&self) -> EndpointAddress {
        EndpointAddress::new(self.rpc_env.address(), APP_CLIENT_ENDPOINT_NAME)
    }

    fn lock_tasks(&self) -> MutexGuard<'_, RegistrationTasks> {
        self.tasks.lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn start_registration(&self) {
        let mut tasks = self.lock_tasks();
        self.start_attempt(&mut tasks, 1);
    }

    fn release_registration(&self) {
        self.lock_tasks().release();
    }

    fn start_attempt(&self, tasks: &mut RegistrationTasks, attempt: u32) {
        tasks.attempt = attempt;
        self.session.attempt.store(attempt, Ordering::Release);
        info!("connecting to master {} (attempt {})", self.master_address, attempt);

        let myself = self.myself.clone();
        tasks.attempt_task = Some(tokio::spawn(async move {
            let Some(endpoint) = myself.upgrade() else {
                return;
            };
            if let Err(e) = endpoint.register_with_master().await {
                warn!("failed to connect to master {}: {:#}", endpoint.master_address, e);
            }
        }));

        let myself = self.myself.clone();
        let interval = self.conf.registration_retry_interval;
        tasks.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            if let Some(endpoint) = myself.upgrade() {
                endpoint.on_retry_timer(attempt);
            }
        }));
    }

    async fn register_with_master(&self) -> anyhow::Result<()> {
        if self.session.registered.load(Ordering::Acquire) {
            return Ok(());
        }

        let master = self.rpc_env.endpoint_ref(&EndpointAddress::new(self.master_address.clone(), MASTER_ENDPOINT_NAME)).await?;
        master.send(DeployMessage::RegisterApplication {
            description: self.description.clone(),
            driver: self.address(),
        }).await
    }

    fn on_retry_timer(&self, attempt: u32) {
        let mut tasks = self.lock_tasks();
        if tasks.released || tasks.attempt != attempt {
            return;
        }

        if self.session.registered.load(Ordering::Acquire) {
            tasks.release();
        }
        else if attempt >= self.conf.max_registration_retries {
            tasks.release();
            drop(tasks);
            self.mark_dead("All masters are unresponsive! Giving up.");
        }
        else {
            tasks.cancel_attempt();
            self.start_attempt(&mut tasks, attempt + 1);
        }
    }

    fn mark_dead(&self, reason: &str) {
        if self.session.dead.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok() {
            warn!("application {} is dead: {}", self.description.name, reason);
            self.listener.dead(reason);
        }
    }

    fn mark_disconnected(&self) {
        if !self.session.disconnected.swap(true, Ordering::AcqRel) {
            info!("connection to master lost, waiting for master to reconnect");
            self.listener.disconnected();
        }
    }

    fn full_executor_id(&self, exec_id: u32) -> String {
        let app_id = self.session.app_id()
            .unwrap_or_default();
        format!("{}/{}", app_id, exec_id)
    }

    /// Records a registration unless the session is over. Returns `None` if the acknowledgement is
    ///  ignored, and otherwise whether it is the first one.
    fn accept_registration(&self, app_id: &str, master_ref: Arc<dyn RpcEndpointRef>) -> Option<bool> {
        // the retry timer gives up under the same lock, so an acknowledgement either wins against
        //  it or is dropped
        let mut tasks = self.lock_tasks();
        if self.session.dead.load(Ordering::Acquire) {
            debug!("ignoring registration as {}: application is dead", app_id);
            return None;
        }
        if tasks.released && !self.session.registered.load(Ordering::Acquire) {
            debug!("ignoring registration as {}: registration was abandoned", app_id);
            return None;
        }

        self.session.set_app_id(app_id.to_string());
        self.session.set_master(master_ref);
        tasks.release();
        Some(self.session.registered.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok())
    }

    async fn on_registered(&self, app_id: String, master: EndpointAddress) -> anyhow::Result<()> {
        let master_ref = self.rpc_env.endpoint_ref(&master).await?;
        match self.accept_registration(&app_id, master_ref) {
            Some(true) => {
                info!("connected to cluster with app id {}", app_id);
                self.listener.connected(&app_id);
            }
            Some(false) => debug!("registered again as {}", app_id),
            None => {}
        }
        Ok(())
    }

    async fn on_master_changed(&self, master: EndpointAddress) -> anyhow::Result<()> {
        info!("master has changed, new master is at {}", master.address);
        let master_ref = self.rpc_env.endpoint_ref(&master).await?;
        self.session.set_master(master_ref.clone());
        self.session.disconnected.store(false, Ordering::Release);

        match self.session.app_id() {
            Some(app_id) => master_ref.send(DeployMessage::MasterChangeAcknowledged { app_id }).await?,
            None => warn!("master changed before the application was registered, not acknowledging"),
        }
        Ok(())
    }

    /// Tells the master that the application is gone. Nobody waits for this, a master that is
    ///  unreachable finds out on its own.
    fn unregister_in_background(&self) {
        let (Some(app_id), Some(master)) = (self.session.app_id(), self.session.master()) else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = master.send(DeployMessage::UnregisterApplication { app_id }).await {
                debug!("failed to unregister from master: {:#}", e);
            }
        });
    }
}

#[async_trait]
impl RpcEndpoint for ClientEndpoint {
    async fn on_start(&self) -> anyhow::Result<()> {
        self.start_registration();
        Ok(())
    }

    async fn receive(&self, sender: RpcAddress, message: DeployMessage) -> anyhow::Result<()> {
        match message {
            DeployMessage::RegisteredApplication { app_id, master } => {
                self.on_registered(app_id, master).await?;
            }
            DeployMessage::ApplicationRemoved { message } => {
                self.mark_dead(&format!("Master removed our application: {}", message));
                self.release_registration();
                self.rpc_env.stop(&self.address()).await;
            }
            DeployMessage::ExecutorAdded { exec_id, worker_id, host, cores, memory_mb } => {
                let full_id = self.full_executor_id(exec_id);
                info!("executor added: {} on {} ({}) with {} core(s)", full_id, worker_id, host, cores);
                self.listener.executor_added(&full_id, &worker_id, &host, cores, memory_mb);
            }
            DeployMessage::ExecutorUpdated { id, state, message, exit_status, worker_lost } => {
                let full_id = self.full_executor_id(id);
                info!("executor updated: {} is now {:?} ({})", full_id, state, message);
                if state.is_finished() {
                    self.listener.executor_removed(&full_id, &message, exit_status, worker_lost);
                }
            }
            DeployMessage::WorkerRemoved { id, host, message } => {
                info!("worker removed: {} on {}: {}", id, host, message);
                self.listener.worker_removed(&id, &host, &message);
            }
            DeployMessage::MasterChanged { master } => {
                self.on_master_changed(master).await?;
            }
            other => {
                warn!("unexpected message from {}: {:?}", sender, other);
            }
        }
        Ok(())
    }

    async fn receive_and_reply(&self, message: DeployMessage, context: RpcCallContext) -> anyhow::Result<()> {
        match message {
            DeployMessage::StopAppClient => {
                self.mark_dead("Application has been stopped.");
                self.release_registration();
                self.unregister_in_background();
                context.reply(true);
                self.rpc_env.stop(&self.address()).await;
            }
            message @ (DeployMessage::RequestExecutors { .. } | DeployMessage::KillExecutors { .. }) => {
                match self.session.master() {
                    Some(master) => context.reply_with(async move { master.ask(message).await }),
                    None => {
                        warn!("attempted to send {:?} before registering with master", message);
                        context.reply(false);
                    }
                }
            }
            other => {
                context.send_failure(anyhow!("unexpected request: {:?}", other));
            }
        }
        Ok(())
    }

    async fn on_disconnected(&self, remote: RpcAddress) {
        let master = self.session.master()
            .map(|master| master.address().address);
        if master.as_ref() == Some(&remote) {
            self.mark_disconnected();
        }
    }

    async fn on_stop(&self) {
        self.release_registration();
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;
    use tokio::time::sleep;

    use crate::config::TransportConf;
    use crate::deploy::{ExecutorState, MockAppClientListener};
    use crate::rpc::TransportRpcEnv;
    use crate::test_util::endpoint::{TrackingEndpointRef, TrackingRpcEnv};
    use crate::test_util::listener::{ListenerEvent, RecordingListener};
    use crate::test_util::{test_master_endpoint, test_master_url, test_rpc_addr_from_number};

    use super::*;

    const DRIVER: u16 = 5000;
    const MASTER: u16 = 7077;

    fn description() -> ApplicationDescription {
        ApplicationDescription {
            name: "word count".to_string(),
            max_cores: 8,
            memory_per_executor_mb: 1024,
            cores_per_executor: 2,
            command: "run-executor".to_string(),
        }
    }

    fn register_message() -> DeployMessage {
        DeployMessage::RegisterApplication {
            description: description(),
            driver: EndpointAddress::new(test_rpc_addr_from_number(DRIVER), APP_CLIENT_ENDPOINT_NAME),
        }
    }

    fn registered_message(app_id: &str) -> DeployMessage {
        DeployMessage::RegisteredApplication {
            app_id: app_id.to_string(),
            master: test_master_endpoint(MASTER),
        }
    }

    struct Fixture {
        env: Arc<TrackingRpcEnv>,
        listener: Arc<RecordingListener>,
        client: AppClient,
        master: Arc<TrackingEndpointRef>,
    }

    impl Fixture {
        async fn started() -> Fixture {
            let env = TrackingRpcEnv::new(test_rpc_addr_from_number(DRIVER));
            let listener = Arc::new(RecordingListener::new());
            let client = AppClient::new(env.clone(), &test_master_url(MASTER), description(), listener.clone(), AppClientConf::new()).unwrap();
            client.start().await.unwrap();
            settle().await;

            let master = env.remote(&test_master_endpoint(MASTER)).await;
            Fixture { env, listener, client, master }
        }

        async fn registered() -> Fixture {
            let fixture = Fixture::started().await;
            fixture.deliver(registered_message("app-7")).await;
            assert_eq!(fixture.master.sent_messages().await, vec![register_message()]);
            fixture
        }

        /// hands a message to the client's endpoint as if it had been sent by the master
        async fn deliver(&self, message: DeployMessage) {
            self.env.local(APP_CLIENT_ENDPOINT_NAME).await
                .expect("client endpoint is not running")
                .send(message).await
                .unwrap();
            settle().await;
        }
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    /// delays lookups and sends of remote endpoints, local endpoints are served right away
    struct SlowRpcEnv {
        inner: Arc<TrackingRpcEnv>,
        lookup_delay: Duration,
        send_delay: Duration,
    }

    #[derive(Debug)]
    struct SlowEndpointRef {
        inner: Arc<dyn RpcEndpointRef>,
        send_delay: Duration,
    }

    #[async_trait]
    impl RpcEndpointRef for SlowEndpointRef {
        fn address(&self) -> EndpointAddress {
            self.inner.address()
        }

        async fn send(&self, message: DeployMessage) -> anyhow::Result<()> {
            sleep(self.send_delay).await;
            self.inner.send(message).await
        }

        async fn ask(&self, message: DeployMessage) -> anyhow::Result<bool> {
            self.inner.ask(message).await
        }
    }

    #[async_trait]
    impl RpcEnv for SlowRpcEnv {
        fn address(&self) -> RpcAddress {
            self.inner.address()
        }

        async fn setup_endpoint(&self, name: &str, endpoint: Arc<dyn RpcEndpoint>) -> anyhow::Result<Arc<dyn RpcEndpointRef>> {
            self.inner.setup_endpoint(name, endpoint).await
        }

        async fn endpoint_ref(&self, address: &EndpointAddress) -> anyhow::Result<Arc<dyn RpcEndpointRef>> {
            if address.address == self.inner.address() {
                return self.inner.endpoint_ref(address).await;
            }
            sleep(self.lookup_delay).await;
            let inner = self.inner.endpoint_ref(address).await?;
            Ok(Arc::new(SlowEndpointRef { inner, send_delay: self.send_delay }))
        }

        async fn stop(&self, address: &EndpointAddress) {
            self.inner.stop(address).await
        }
    }

    async fn start_slow(lookup_delay: Duration, send_delay: Duration) -> (Arc<TrackingRpcEnv>, Arc<RecordingListener>, AppClient) {
        let inner = TrackingRpcEnv::new(test_rpc_addr_from_number(DRIVER));
        let env = Arc::new(SlowRpcEnv { inner: inner.clone(), lookup_delay, send_delay });
        let listener = Arc::new(RecordingListener::new());
        let client = AppClient::new(env, &test_master_url(MASTER), description(), listener.clone(), AppClientConf::new()).unwrap();
        client.start().await.unwrap();
        settle().await;
        (inner, listener, client)
    }

    #[tokio::test(start_paused = true)]
    async fn test_registered_on_third_attempt() {
        let fixture = Fixture::started().await;
        assert_eq!(fixture.master.sent_messages().await, vec![register_message()]);
        assert_eq!(fixture.client.registration_state().await.attempt, 1);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(fixture.master.sent_messages().await, vec![register_message()]);
        assert_eq!(fixture.client.registration_state().await.attempt, 2);

        sleep(Duration::from_secs(20)).await;
        assert_eq!(fixture.master.sent_messages().await, vec![register_message()]);
        assert_eq!(fixture.client.registration_state().await.attempt, 3);

        fixture.deliver(registered_message("app-7")).await;
        assert_eq!(fixture.client.registration_state().await, RegistrationState {
            app_id: Some("app-7".to_string()),
            registered: true,
            disconnected: false,
            dead: false,
            attempt: 3,
        });

        // the third attempt's timer is cancelled, so nothing happens when it would have fired
        sleep(Duration::from_secs(120)).await;
        assert!(fixture.master.sent_messages().await.is_empty());
        assert_eq!(fixture.client.registration_state().await.attempt, 3);
        assert_eq!(fixture.listener.events(), vec![ListenerEvent::Connected("app-7".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unanswered_registration_gives_up() {
        let fixture = Fixture::started().await;

        sleep(Duration::from_secs(61)).await;
        assert_eq!(fixture.master.sent_messages().await, vec![register_message(); 3]);

        let state = fixture.client.registration_state().await;
        assert!(state.dead);
        assert!(!state.registered);
        assert_eq!(state.attempt, 3);

        sleep(Duration::from_secs(120)).await;
        assert!(fixture.master.sent_messages().await.is_empty());
        assert_eq!(fixture.listener.events(), vec![ListenerEvent::Dead("All masters are unresponsive! Giving up.".to_string())]);

        // a late answer does not revive the application
        fixture.deliver(registered_message("app-7")).await;
        assert!(!fixture.client.registration_state().await.registered);
        assert_eq!(fixture.listener.events().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_before_registration_are_not_sent() {
        let env = TrackingRpcEnv::new(test_rpc_addr_from_number(DRIVER));
        let client = AppClient::new(env.clone(), &test_master_url(MASTER), description(), Arc::new(RecordingListener::new()), AppClientConf::new()).unwrap();
        assert!(!client.request_total_executors(3).await.unwrap());

        client.start().await.unwrap();
        settle().await;
        assert!(!client.request_total_executors(3).await.unwrap());
        assert!(!client.kill_executors(vec!["1".to_string()]).await.unwrap());

        let master = env.remote(&test_master_endpoint(MASTER)).await;
        assert!(master.asked_messages().await.is_empty());
        assert_eq!(master.sent_messages().await, vec![register_message()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_are_bridged_to_master() {
        let fixture = Fixture::registered().await;

        assert!(fixture.client.request_total_executors(5).await.unwrap());
        fixture.master.set_ask_reply(Ok(false)).await;
        assert!(!fixture.client.kill_executors(vec!["1".to_string(), "2".to_string()]).await.unwrap());

        fixture.master.set_ask_reply(Err("master says no".to_string())).await;
        let err = fixture.client.request_total_executors(1).await.unwrap_err();
        assert_eq!(err.to_string(), "master says no");

        assert_eq!(fixture.master.asked_messages().await, vec![
            DeployMessage::RequestExecutors { app_id: "app-7".to_string(), requested_total: 5 },
            DeployMessage::KillExecutors { app_id: "app-7".to_string(), executor_ids: vec!["1".to_string(), "2".to_string()] },
            DeployMessage::RequestExecutors { app_id: "app-7".to_string(), requested_total: 1 },
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_master_changed_is_acknowledged_once() {
        let fixture = Fixture::registered().await;
        let new_master_address = test_master_endpoint(MASTER + 1);

        fixture.deliver(DeployMessage::MasterChanged { master: new_master_address.clone() }).await;

        let new_master = fixture.env.remote(&new_master_address).await;
        assert_eq!(new_master.sent_messages().await, vec![DeployMessage::MasterChangeAcknowledged { app_id: "app-7".to_string() }]);
        assert!(fixture.master.sent_messages().await.is_empty());

        // requests now go to the new master
        fixture.client.request_total_executors(2).await.unwrap();
        assert_eq!(new_master.asked_messages().await.len(), 1);
        assert!(fixture.master.asked_messages().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_reported_once_per_master() {
        let fixture = Fixture::registered().await;

        fixture.env.disconnect(&test_rpc_addr_from_number(9999)).await;
        fixture.env.disconnect(&test_rpc_addr_from_number(MASTER)).await;
        fixture.env.disconnect(&test_rpc_addr_from_number(MASTER)).await;
        settle().await;
        assert!(fixture.client.registration_state().await.disconnected);

        fixture.deliver(DeployMessage::MasterChanged { master: test_master_endpoint(MASTER + 1) }).await;
        assert!(!fixture.client.registration_state().await.disconnected);

        // the old master is no longer relevant
        fixture.env.disconnect(&test_rpc_addr_from_number(MASTER)).await;
        fixture.env.disconnect(&test_rpc_addr_from_number(MASTER + 1)).await;
        settle().await;

        assert_eq!(fixture.listener.events(), vec![
            ListenerEvent::Connected("app-7".to_string()),
            ListenerEvent::Disconnected,
            ListenerEvent::Disconnected,
        ]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_before_registration_is_ignored() {
        let fixture = Fixture::started().await;
        fixture.env.disconnect(&test_rpc_addr_from_number(MASTER)).await;
        settle().await;

        assert!(!fixture.client.registration_state().await.disconnected);
        assert!(fixture.listener.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_application_removed() {
        let fixture = Fixture::registered().await;

        fixture.deliver(DeployMessage::ApplicationRemoved { message: "killed by admin".to_string() }).await;

        assert!(fixture.client.registration_state().await.dead);
        assert_eq!(fixture.listener.events(), vec![
            ListenerEvent::Connected("app-7".to_string()),
            ListenerEvent::Dead("Master removed our application: killed by admin".to_string()),
        ]);
        assert_eq!(fixture.env.stopped().await, vec![EndpointAddress::new(test_rpc_addr_from_number(DRIVER), APP_CLIENT_ENDPOINT_NAME)]);
        assert!(fixture.env.local(APP_CLIENT_ENDPOINT_NAME).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_is_reported_once() {
        let mut listener = MockAppClientListener::new();
        listener.expect_connected()
            .withf(|app_id| app_id == "app-7")
            .times(1)
            .return_const(());
        listener.expect_dead()
            .withf(|reason| reason == "Master removed our application: gone")
            .times(1)
            .return_const(());

        let env = TrackingRpcEnv::new(test_rpc_addr_from_number(DRIVER));
        let client = AppClient::new(env.clone(), &test_master_url(MASTER), description(), Arc::new(listener), AppClientConf::new()).unwrap();
        client.start().await.unwrap();
        settle().await;

        let endpoint = env.local(APP_CLIENT_ENDPOINT_NAME).await.unwrap();
        endpoint.send(registered_message("app-7")).await.unwrap();
        endpoint.send(DeployMessage::ApplicationRemoved { message: "gone".to_string() }).await.unwrap();
        endpoint.send(DeployMessage::ApplicationRemoved { message: "gone again".to_string() }).await.unwrap();
        sleep(Duration::from_secs(120)).await;

        // the endpoint has stopped, so dropping the client drops the mock and verifies it
        drop(endpoint);
        drop(client);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop() {
        let fixture = Fixture::registered().await;

        assert!(fixture.client.stop().await);
        settle().await;

        assert_eq!(fixture.master.sent_messages().await, vec![DeployMessage::UnregisterApplication { app_id: "app-7".to_string() }]);
        assert_eq!(fixture.listener.events().last(), Some(&ListenerEvent::Dead("Application has been stopped.".to_string())));
        assert!(fixture.env.local(APP_CLIENT_ENDPOINT_NAME).await.is_none());

        assert!(!fixture.client.stop().await);
        assert!(!fixture.client.request_total_executors(1).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_registration() {
        let fixture = Fixture::started().await;
        assert!(fixture.client.stop().await);

        sleep(Duration::from_secs(120)).await;
        assert_eq!(fixture.master.sent_messages().await, vec![register_message()]);
        assert_eq!(fixture.listener.events(), vec![ListenerEvent::Dead("Application has been stopped.".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_completing_after_giving_up_is_ignored() {
        let (env, listener, client) = start_slow(Duration::from_secs(2), Duration::ZERO).await;

        // the acknowledgement arrives just before the last attempt times out, and resolving the
        //  master takes until after that
        sleep(Duration::from_secs(59)).await;
        env.local(APP_CLIENT_ENDPOINT_NAME).await.unwrap()
            .send(registered_message("app-7")).await
            .unwrap();
        sleep(Duration::from_secs(5)).await;

        let state = client.registration_state().await;
        assert!(state.dead);
        assert!(!state.registered);
        assert_eq!(state.app_id, None);
        assert_eq!(listener.events(), vec![ListenerEvent::Dead("All masters are unresponsive! Giving up.".to_string())]);
        assert!(!client.request_total_executors(1).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_does_not_wait_for_unregistering() {
        let (env, listener, client) = start_slow(Duration::ZERO, Duration::from_secs(3600)).await;
        env.local(APP_CLIENT_ENDPOINT_NAME).await.unwrap()
            .send(registered_message("app-7")).await
            .unwrap();
        settle().await;
        assert!(client.registration_state().await.registered);

        let stopped = tokio::time::timeout(Duration::from_secs(1), client.stop()).await
            .expect("stop should not wait for the master");
        assert!(stopped);
        assert_eq!(listener.events().last(), Some(&ListenerEvent::Dead("Application has been stopped.".to_string())));

        // the unregistration is still delivered eventually, the registration attempt was cancelled
        sleep(Duration::from_secs(7200)).await;
        let master = env.remote(&test_master_endpoint(MASTER)).await;
        assert_eq!(master.sent_messages().await, vec![DeployMessage::UnregisterApplication { app_id: "app-7".to_string() }]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice() {
        let fixture = Fixture::started().await;
        assert!(fixture.client.start().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_added_and_worker_removed() {
        let fixture = Fixture::registered().await;

        fixture.deliver(DeployMessage::ExecutorAdded {
            exec_id: 3,
            worker_id: "worker-1".to_string(),
            host: "10.0.0.3".to_string(),
            cores: 2,
            memory_mb: 1024,
        }).await;
        fixture.deliver(DeployMessage::WorkerRemoved {
            id: "worker-1".to_string(),
            host: "10.0.0.3".to_string(),
            message: "heartbeat lost".to_string(),
        }).await;

        assert_eq!(fixture.listener.events(), vec![
            ListenerEvent::Connected("app-7".to_string()),
            ListenerEvent::ExecutorAdded {
                full_id: "app-7/3".to_string(),
                worker_id: "worker-1".to_string(),
                host: "10.0.0.3".to_string(),
                cores: 2,
                memory_mb: 1024,
            },
            ListenerEvent::WorkerRemoved {
                worker_id: "worker-1".to_string(),
                host: "10.0.0.3".to_string(),
                message: "heartbeat lost".to_string(),
            },
        ]);
    }

    #[rstest]
    #[case::launching(ExecutorState::Launching, false)]
    #[case::running(ExecutorState::Running, false)]
    #[case::killed(ExecutorState::Killed, true)]
    #[case::failed(ExecutorState::Failed, true)]
    #[case::lost(ExecutorState::Lost, true)]
    #[case::exited(ExecutorState::Exited, true)]
    #[tokio::test(start_paused = true)]
    async fn test_executor_updated(#[case] state: ExecutorState, #[case] removed: bool) {
        let fixture = Fixture::registered().await;

        fixture.deliver(DeployMessage::ExecutorUpdated {
            id: 4,
            state,
            message: "state changed".to_string(),
            exit_status: 137,
            worker_lost: false,
        }).await;

        let mut expected = vec![ListenerEvent::Connected("app-7".to_string())];
        if removed {
            expected.push(ListenerEvent::ExecutorRemoved {
                full_id: "app-7/4".to_string(),
                message: "state changed".to_string(),
                exit_status: 137,
                worker_lost: false,
            });
        }
        assert_eq!(fixture.listener.events(), expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_request_fails() {
        let fixture = Fixture::registered().await;
        let endpoint = fixture.env.local(APP_CLIENT_ENDPOINT_NAME).await.unwrap();
        assert!(endpoint.ask(DeployMessage::UnregisterApplication { app_id: "app-7".to_string() }).await.is_err());
    }

    #[test]
    fn test_invalid_master_url() {
        let env = TrackingRpcEnv::new(test_rpc_addr_from_number(DRIVER));
        assert!(AppClient::new(env, "master:7077", description(), Arc::new(RecordingListener::new()), AppClientConf::new()).is_err());
    }


    /// just enough of a master to register an application and answer its requests
    struct FakeMaster {
        env: Arc<TransportRpcEnv>,
        received: tokio::sync::Mutex<Vec<DeployMessage>>,
    }

    #[async_trait]
    impl RpcEndpoint for FakeMaster {
        async fn receive(&self, _sender: RpcAddress, message: DeployMessage) -> anyhow::Result<()> {
            if let DeployMessage::RegisterApplication { driver, .. } = &message {
                self.env.endpoint_ref(driver).await?
                    .send(DeployMessage::RegisteredApplication {
                        app_id: "app-1".to_string(),
                        master: EndpointAddress::new(self.env.address(), MASTER_ENDPOINT_NAME),
                    }).await?;
            }
            self.received.lock().await.push(message);
            Ok(())
        }

        async fn receive_and_reply(&self, message: DeployMessage, context: RpcCallContext) -> anyhow::Result<()> {
            let granted = matches!(message, DeployMessage::RequestExecutors { requested_total, .. } if requested_total <= 4);
            self.received.lock().await.push(message);
            context.reply(granted);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_registration_over_the_network() {
        let mut conf = TransportConf::new();
        conf.request_timeout = Duration::from_secs(5);
        conf.connect_timeout = Duration::from_secs(5);

        let master_env = TransportRpcEnv::create(conf.clone(), "127.0.0.1", 0).await.unwrap();
        let master = Arc::new(FakeMaster { env: master_env.clone(), received: Default::default() });
        master_env.setup_endpoint(MASTER_ENDPOINT_NAME, master.clone()).await.unwrap();

        let driver_env = TransportRpcEnv::create(conf, "127.0.0.1", 0).await.unwrap();
        let listener = Arc::new(RecordingListener::new());
        let master_url = format!("masterlink://{}", master_env.address());
        let client = AppClient::new(driver_env.clone(), &master_url, description(), listener.clone(), AppClientConf::new()).unwrap();
        client.start().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !client.registration_state().await.registered {
                sleep(Duration::from_millis(10)).await;
            }
        }).await
            .expect("application was not registered in time");
        assert_eq!(listener.events(), vec![ListenerEvent::Connected("app-1".to_string())]);

        assert!(client.request_total_executors(4).await.unwrap());
        assert!(!client.request_total_executors(5).await.unwrap());
        assert!(client.stop().await);

        let expected_unregister = DeployMessage::UnregisterApplication { app_id: "app-1".to_string() };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !master.received.lock().await.contains(&expected_unregister) {
                sleep(Duration::from_millis(10)).await;
            }
        }).await
            .expect("application was not unregistered in time");

        driver_env.shutdown().await;
        master_env.shutdown().await;
    }
}
