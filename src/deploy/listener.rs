#[cfg(test)] use mockall::automock;


/// Callbacks through which an [crate::deploy::AppClient] reports on the application's registration
///  and its executors. They are called from the client's endpoint task and should return quickly.
#[cfg_attr(test, automock)]
pub trait AppClientListener: Send + Sync + 'static {
    /// The master accepted the application
    fn connected(&self, app_id: &str);

    /// The connection to the master was lost. Not terminal: a new master may take over.
    fn disconnected(&self);

    /// The application is gone for good, e.g. because the master could not be reached or removed
    ///  it. Called at most once.
    fn dead(&self, reason: &str);

    fn executor_added(&self, full_id: &str, worker_id: &str, host: &str, cores: u32, memory_mb: u32);

    fn executor_removed(&self, full_id: &str, message: &str, exit_status: i32, worker_lost: bool);

    fn worker_removed(&self, worker_id: &str, host: &str, message: &str);
}
