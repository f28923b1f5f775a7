//! The server: shared context, the listener loop and the per-connection
//! request loop.
//!
//! Request handlers live in [`handlers`], startup reconciliation in
//! [`recovery`] and the completed-job sweep in [`purge`].
pub mod handlers;
pub mod purge;
pub mod recovery;

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use self::purge::PurgePolicy;
use crate::config::ServerConfig;
use crate::dispatch::hosts::{HostPool, MomSignaller};
use crate::dispatch::{DispatchEngine, Services};
use crate::nanny::{DeleteNanny, JobSignaller};
use crate::net::ConnectionRegistry;
use crate::notify::Notifier;
use crate::queue::QueueManager;
use crate::store::{JobStore, StoreError};
use crate::task::TaskScheduler;
use crate::types::job::Job;
use crate::types::protocol::{BatchReply, RequestBody};
use crate::wire::codec::{read_request, write_reply};
use crate::wire::{ChannelError, WireChannel, WireError};

/// Decides who may act on what.
pub trait Authorizer: Send + Sync + 'static {
    fn is_manager(&self, user: &str) -> bool;

    /// Whether `user` may modify `job`.
    fn may_modify(&self, user: &str, job: &Job) -> bool {
        self.is_manager(user) || job.owner_user() == user
    }
}

/// Job owners act on their own jobs; managers on any.
#[derive(Debug)]
pub struct OwnerOrManager {
    managers: Vec<String>,
}

impl OwnerOrManager {
    pub fn new(managers: Vec<String>) -> Self {
        Self { managers }
    }
}

impl Authorizer for OwnerOrManager {
    fn is_manager(&self, user: &str) -> bool {
        self.managers.iter().any(|m| m == user)
    }
}

/// Optional replacements for the default collaborators.
#[derive(Default)]
pub struct Parts {
    pub signaller: Option<Arc<dyn JobSignaller>>,
    pub authorizer: Option<Arc<dyn Authorizer>>,
}

pub struct Server {
    me: Weak<Server>,
    config: ServerConfig,
    svc: Services,
    engine: Arc<DispatchEngine>,
    signaller: Arc<dyn JobSignaller>,
    auth: Arc<dyn Authorizer>,
    purge: PurgePolicy,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(
        config: ServerConfig,
        cancel: CancellationToken,
    ) -> Result<Arc<Self>, StoreError> {
        Self::with_parts(config, cancel, Parts::default())
    }

    pub fn with_parts(
        config: ServerConfig,
        cancel: CancellationToken,
        parts: Parts,
    ) -> Result<Arc<Self>, StoreError> {
        let store = Arc::new(JobStore::open(
            &config.spool_dir,
            config.store.save_retries,
        )?);
        let tasks = Arc::new(TaskScheduler::new());
        let registry = ConnectionRegistry::new(
            config.connections.max,
            config.server_name.clone(),
            config.port,
            Duration::from_secs(config.connections.connect_timeout_secs),
            Duration::from_secs(config.connections.disconnect_timeout_secs),
        );
        let hosts = Arc::new(HostPool::new(
            &config.exec_hosts.moms,
            config.exec_hosts.mom_port,
            Duration::from_secs(config.exec_hosts.suspect_secs),
        ));
        let signaller =
            parts.signaller.unwrap_or_else(|| -> Arc<dyn JobSignaller> {
                Arc::new(MomSignaller::new(
                    Arc::clone(&registry),
                    config.exec_hosts.mom_port,
                    config.dispatch.step_timeout(),
                ))
            });
        let nanny = DeleteNanny::new(
            Arc::clone(&store),
            Arc::clone(&tasks),
            Arc::clone(&signaller),
            Duration::from_secs(config.nanny.delay_secs),
            config.nanny.enabled,
        );
        let notifier = Arc::new(Notifier::new(
            config.mailer.clone(),
            config.server_name.clone(),
        ));
        let auth = parts
            .authorizer
            .unwrap_or_else(|| -> Arc<dyn Authorizer> {
                Arc::new(OwnerOrManager::new(config.managers.clone()))
            });

        let svc = Services {
            store,
            queues: Arc::new(QueueManager::new(&config.queues)),
            registry,
            tasks,
            hosts,
            nanny,
            notifier,
        };
        let engine = DispatchEngine::new(svc.clone(), &config);
        let purge = PurgePolicy::new(&config.purge);

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            svc,
            engine,
            signaller,
            auth,
            purge,
            cancel,
        }))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn services(&self) -> &Services {
        &self.svc
    }

    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Starts the task runner and the purge sweep. The runner stops when the
    /// server's token is cancelled.
    pub fn start_background(&self) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.svc.tasks);
        let cancel = self.cancel.clone();
        let runner = tokio::spawn(async move { tasks.run(cancel).await });
        self.schedule_sweep();
        runner
    }

    /// Accepts connections until the server's token is cancelled, handling
    /// each as its own task.
    pub async fn serve(&self, listener: TcpListener) -> io::Result<()> {
        info!(
            addr = %listener.local_addr()?,
            server = %self.config.server_name,
            "listening"
        );

        loop {
            let (conn, peer) = match select! {
                accept = listener.accept() => accept,
                _ = self.cancel.cancelled() => break,
            } {
                Ok(x) => x,
                Err(error) => {
                    warn!(%error, "failed to accept connection");
                    continue;
                },
            };

            let Some(me) = self.me.upgrade() else { break };
            tokio::spawn(me.handle_conn(conn, peer));
        }

        self.svc.registry.shutdown();
        info!("stopped listening");
        Ok(())
    }

    #[instrument(name = "handle", skip_all, fields(%peer))]
    async fn handle_conn(self: Arc<Self>, conn: TcpStream, peer: SocketAddr) {
        debug!("accepted connection");

        if let Err(error) = conn.set_nodelay(true) {
            warn!(%error, "failed to set NODELAY");
        }
        let mut ch = WireChannel::new(conn);
        ch.set_timeout(self.config.connections.idle_timeout());

        loop {
            let req = select! {
                x = read_request(&mut ch) => x,
                _ = self.cancel.cancelled() => break,
            };

            let reply = match req {
                Ok(req) if req.body == RequestBody::Disconnect => {
                    trace!("peer disconnected");
                    break;
                },
                Ok(req) => self.handle_request(req).await,
                Err(WireError::Channel(ChannelError::Eof)) => break,
                Err(WireError::Channel(ChannelError::Timeout)) => {
                    debug!("idle connection timed out");
                    break;
                },
                Err(error) if error.is_fatal_to_connection() => {
                    debug!(%error, "dropping connection");
                    break;
                },
                Err(WireError::Codec(error)) => {
                    debug!(%error, "refusing malformed request");
                    BatchReply::error(error.reply_code())
                },
                Err(WireError::Channel(_)) => break,
            };

            let written = select! {
                x = write_reply(&mut ch, &reply) => x,
                _ = self.cancel.cancelled() => break,
            };
            if let Err(error) = written {
                debug!(%error, "failed to write reply");
                break;
            }
        }

        debug!("closed connection");
    }
}
