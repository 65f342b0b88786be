use bytes::{Buf, BufMut};

use crate::network::protocol::WireError;
use crate::rpc::EndpointAddress;
use crate::util::buf::{put_string, put_string_list, try_get_bool, try_get_i32, try_get_string, try_get_string_list, try_get_u32, try_get_u8};


/// What an application asks the master for when it registers
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ApplicationDescription {
    pub name: String,
    pub max_cores: u32,
    pub memory_per_executor_mb: u32,
    pub cores_per_executor: u32,
    pub command: String,
}

impl ApplicationDescription {
    pub fn ser(&self, buf: &mut impl BufMut) {
        put_string(buf, &self.name);
        buf.put_u32(self.max_cores);
        buf.put_u32(self.memory_per_executor_mb);
        buf.put_u32(self.cores_per_executor);
        put_string(buf, &self.command);
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<ApplicationDescription, WireError> {
        Ok(ApplicationDescription {
            name: try_get_string(buf, "application name")?,
            max_cores: try_get_u32(buf, "max cores")?,
            memory_per_executor_mb: try_get_u32(buf, "memory per executor")?,
            cores_per_executor: try_get_u32(buf, "cores per executor")?,
            command: try_get_string(buf, "application command")?,
        })
    }
}


#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum ExecutorState {
    Launching,
    Running,
    Killed,
    Failed,
    Lost,
    Exited,
}

impl ExecutorState {
    /// An executor in a finished state is gone for good
    pub fn is_finished(&self) -> bool {
        matches!(self, ExecutorState::Killed | ExecutorState::Failed | ExecutorState::Lost | ExecutorState::Exited)
    }

    fn id(&self) -> u8 {
        match self {
            ExecutorState::Launching => 0,
            ExecutorState::Running => 1,
            ExecutorState::Killed => 2,
            ExecutorState::Failed => 3,
            ExecutorState::Lost => 4,
            ExecutorState::Exited => 5,
        }
    }

    fn try_deser(buf: &mut impl Buf) -> Result<ExecutorState, WireError> {
        match try_get_u8(buf, "executor state")? {
            0 => Ok(ExecutorState::Launching),
            1 => Ok(ExecutorState::Running),
            2 => Ok(ExecutorState::Killed),
            3 => Ok(ExecutorState::Failed),
            4 => Ok(ExecutorState::Lost),
            5 => Ok(ExecutorState::Exited),
            id => Err(WireError::UnknownDiscriminator { what: "executor state", id }),
        }
    }
}


const ID_REGISTER_APPLICATION: u8 = 1;
const ID_REGISTERED_APPLICATION: u8 = 2;
const ID_APPLICATION_REMOVED: u8 = 3;
const ID_UNREGISTER_APPLICATION: u8 = 4;
const ID_REQUEST_EXECUTORS: u8 = 5;
const ID_KILL_EXECUTORS: u8 = 6;
const ID_EXECUTOR_ADDED: u8 = 7;
const ID_EXECUTOR_UPDATED: u8 = 8;
const ID_WORKER_REMOVED: u8 = 9;
const ID_MASTER_CHANGED: u8 = 10;
const ID_MASTER_CHANGE_ACKNOWLEDGED: u8 = 11;
const ID_STOP_APP_CLIENT: u8 = 12;

/// The control messages exchanged between an application's client and the master
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DeployMessage {
    RegisterApplication {
        description: ApplicationDescription,
        driver: EndpointAddress,
    },
    RegisteredApplication {
        app_id: String,
        master: EndpointAddress,
    },
    ApplicationRemoved {
        message: String,
    },
    UnregisterApplication {
        app_id: String,
    },
    RequestExecutors {
        app_id: String,
        requested_total: u32,
    },
    KillExecutors {
        app_id: String,
        executor_ids: Vec<String>,
    },
    ExecutorAdded {
        exec_id: u32,
        worker_id: String,
        host: String,
        cores: u32,
        memory_mb: u32,
    },
    ExecutorUpdated {
        id: u32,
        state: ExecutorState,
        message: String,
        exit_status: i32,
        worker_lost: bool,
    },
    WorkerRemoved {
        id: String,
        host: String,
        message: String,
    },
    MasterChanged {
        master: EndpointAddress,
    },
    MasterChangeAcknowledged {
        app_id: String,
    },
    StopAppClient,
}

impl DeployMessage {
    pub fn id(&self) -> u8 {
        match self {
            DeployMessage::RegisterApplication { .. } => ID_REGISTER_APPLICATION,
            DeployMessage::RegisteredApplication { .. } => ID_REGISTERED_APPLICATION,
            DeployMessage::ApplicationRemoved { .. } => ID_APPLICATION_REMOVED,
            DeployMessage::UnregisterApplication { .. } => ID_UNREGISTER_APPLICATION,
            DeployMessage::RequestExecutors { .. } => ID_REQUEST_EXECUTORS,
            DeployMessage::KillExecutors { .. } => ID_KILL_EXECUTORS,
            DeployMessage::ExecutorAdded { .. } => ID_EXECUTOR_ADDED,
            DeployMessage::ExecutorUpdated { .. } => ID_EXECUTOR_UPDATED,
            DeployMessage::WorkerRemoved { .. } => ID_WORKER_REMOVED,
            DeployMessage::MasterChanged { .. } => ID_MASTER_CHANGED,
            DeployMessage::MasterChangeAcknowledged { .. } => ID_MASTER_CHANGE_ACKNOWLEDGED,
            DeployMessage::StopAppClient => ID_STOP_APP_CLIENT,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.id());
        match self {
            DeployMessage::RegisterApplication { description, driver } => {
                description.ser(buf);
                driver.ser(buf);
            }
            DeployMessage::RegisteredApplication { app_id, master } => {
                put_string(buf, app_id);
                master.ser(buf);
            }
            DeployMessage::ApplicationRemoved { message } => put_string(buf, message),
            DeployMessage::UnregisterApplication { app_id } => put_string(buf, app_id),
            DeployMessage::RequestExecutors { app_id, requested_total } => {
                put_string(buf, app_id);
                buf.put_u32(*requested_total);
            }
            DeployMessage::KillExecutors { app_id, executor_ids } => {
                put_string(buf, app_id);
                put_string_list(buf, executor_ids);
            }
            DeployMessage::ExecutorAdded { exec_id, worker_id, host, cores, memory_mb } => {
                buf.put_u32(*exec_id);
                put_string(buf, worker_id);
                put_string(buf, host);
                buf.put_u32(*cores);
                buf.put_u32(*memory_mb);
            }
            DeployMessage::ExecutorUpdated { id, state, message, exit_status, worker_lost } => {
                buf.put_u32(*id);
                buf.put_u8(state.id());
                put_string(buf, message);
                buf.put_i32(*exit_status);
                buf.put_u8(*worker_lost as u8);
            }
            DeployMessage::WorkerRemoved { id, host, message } => {
                put_string(buf, id);
                put_string(buf, host);
                put_string(buf, message);
            }
            DeployMessage::MasterChanged { master } => master.ser(buf),
            DeployMessage::MasterChangeAcknowledged { app_id } => put_string(buf, app_id),
            DeployMessage::StopAppClient => {}
        }
    }

    pub fn try_deser(buf: &mut impl Buf) -> Result<DeployMessage, WireError> {
        let result = match try_get_u8(buf, "deploy message discriminator")? {
            ID_REGISTER_APPLICATION => DeployMessage::RegisterApplication {
                description: ApplicationDescription::try_deser(buf)?,
                driver: EndpointAddress::try_deser(buf)?,
            },
            ID_REGISTERED_APPLICATION => DeployMessage::RegisteredApplication {
                app_id: try_get_string(buf, "app id")?,
                master: EndpointAddress::try_deser(buf)?,
            },
            ID_APPLICATION_REMOVED => DeployMessage::ApplicationRemoved {
                message: try_get_string(buf, "removal message")?,
            },
            ID_UNREGISTER_APPLICATION => DeployMessage::UnregisterApplication {
                app_id: try_get_string(buf, "app id")?,
            },
            ID_REQUEST_EXECUTORS => DeployMessage::RequestExecutors {
                app_id: try_get_string(buf, "app id")?,
                requested_total: try_get_u32(buf, "requested total")?,
            },
            ID_KILL_EXECUTORS => DeployMessage::KillExecutors {
                app_id: try_get_string(buf, "app id")?,
                executor_ids: try_get_string_list(buf, "executor ids")?,
            },
            ID_EXECUTOR_ADDED => DeployMessage::ExecutorAdded {
                exec_id: try_get_u32(buf, "executor id")?,
                worker_id: try_get_string(buf, "worker id")?,
                host: try_get_string(buf, "executor host")?,
                cores: try_get_u32(buf, "executor cores")?,
                memory_mb: try_get_u32(buf, "executor memory")?,
            },
            ID_EXECUTOR_UPDATED => DeployMessage::ExecutorUpdated {
                id: try_get_u32(buf, "executor id")?,
                state: ExecutorState::try_deser(buf)?,
                message: try_get_string(buf, "executor message")?,
                exit_status: try_get_i32(buf, "exit status")?,
                worker_lost: try_get_bool(buf, "worker lost")?,
            },
            ID_WORKER_REMOVED => DeployMessage::WorkerRemoved {
                id: try_get_string(buf, "worker id")?,
                host: try_get_string(buf, "worker host")?,
                message: try_get_string(buf, "worker message")?,
            },
            ID_MASTER_CHANGED => DeployMessage::MasterChanged {
                master: EndpointAddress::try_deser(buf)?,
            },
            ID_MASTER_CHANGE_ACKNOWLEDGED => DeployMessage::MasterChangeAcknowledged {
                app_id: try_get_string(buf, "app id")?,
            },
            ID_STOP_APP_CLIENT => DeployMessage::StopAppClient,
            id => return Err(WireError::UnknownDiscriminator { what: "deploy message", id }),
        };
        Ok(result)
    }
}
