//! Accounting records and owner notification.
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::types::attribute::names;
use crate::types::job::Job;

/// Kinds of accounting record, by their conventional letters.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AccountKind {
    /// Queued.
    Queued,
    /// Started on an execution host.
    Started,
    /// Ended.
    Exited,
    /// Deleted.
    Deleted,
    /// Aborted by the server.
    Aborted,
    /// Requeued for rerun.
    Rerun,
    /// Moved or routed to another server.
    Moved,
}

impl AccountKind {
    pub fn letter(self) -> char {
        match self {
            AccountKind::Queued => 'Q',
            AccountKind::Started => 'S',
            AccountKind::Exited => 'E',
            AccountKind::Deleted => 'D',
            AccountKind::Aborted => 'A',
            AccountKind::Rerun => 'R',
            AccountKind::Moved => 'M',
        }
    }
}

impl fmt::Display for AccountKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.letter())
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("failed to start mailer: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("mailer failed: {0}")]
    Failed(ExitStatus),
    #[error("mailer did not finish: {0}")]
    Wait(#[source] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct Notifier {
    mailer: Option<PathBuf>,
    server_name: String,
}

impl Notifier {
    pub fn new(
        mailer: Option<PathBuf>,
        server_name: impl Into<String>,
    ) -> Self {
        Self {
            mailer,
            server_name: server_name.into(),
        }
    }

    pub fn account(&self, kind: AccountKind, job_id: &str, message: &str) {
        info!(target: "accounting", kind = %kind, job_id, "{message}");
    }

    /// Tells a job's owner about `message` through the mailer, if one is
    /// configured. The receiver yields the mailer's result; nothing waits on
    /// it.
    pub fn notify_owner(
        &self,
        job: &Job,
        message: &str,
    ) -> oneshot::Receiver<Result<(), NotifyError>> {
        let (tx, rx) = oneshot::channel();
        let recipient = job
            .attrs
            .get(names::MAIL_USERS)
            .unwrap_or_else(|| job.owner())
            .to_owned();
        info!(target: "notify", job_id = %job.id, %recipient, "{message}");

        let Some(mailer) = self.mailer.clone() else {
            let _ = tx.send(Ok(()));
            return rx;
        };
        let body = format!(
            "Job: {}\nServer: {}\n\n{message}\n",
            job.id, self.server_name
        );
        let job_id = job.id.clone();

        tokio::spawn(async move {
            let res = run_mailer(mailer, &recipient, body).await;
            if let Err(error) = &res {
                warn!(%job_id, %error, "owner notification failed");
            }
            let _ = tx.send(res);
        });
        rx
    }
}

async fn run_mailer(
    mailer: PathBuf,
    recipient: &str,
    body: String,
) -> Result<(), NotifyError> {
    let mut child = Command::new(&mailer)
        .arg(recipient)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(NotifyError::Spawn)?;

    if let Some(mut stdin) = child.stdin.take() {
        // A mailer may exit without reading its input.
        if let Err(error) = stdin.write_all(body.as_bytes()).await {
            debug!(%error, "mailer closed its input early");
        }
    }

    let status = child.wait().await.map_err(NotifyError::Wait)?;
    if status.success() {
        Ok(())
    } else {
        Err(NotifyError::Failed(status))
    }
}
