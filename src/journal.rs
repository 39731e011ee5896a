//! Fire-and-forget transition journal.
//!
//! The core offers a copy of every committed state transition to an
//! unbounded channel; a collaborator may drain it to stable storage. The
//! core never blocks on (or fails because of) the journal, and no replay or
//! recovery is performed here.

use std::fmt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// A committed state transition, as offered to the journal channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JournalEvent {
    pub tube: String,
    pub id: u64,
    pub op: JournalOp,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JournalOp {
    Put,
    Reserve,
    Release,
    Bury,
    Touch,
    Kick,
    Delete,
    /// A reservation's TTR elapsed and the job was forced back to ready.
    TimedOut,
    /// A delay elapsed and the job became ready.
    Promoted,
}

impl fmt::Display for JournalOp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use JournalOp::*;

        f.write_str(match self {
            Put => "put",
            Reserve => "reserve",
            Release => "release",
            Bury => "bury",
            Touch => "touch",
            Kick => "kick",
            Delete => "delete",
            TimedOut => "timed-out",
            Promoted => "promoted",
        })
    }
}

impl fmt::Display for JournalEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.op, self.tube, self.id)
    }
}

/// Cloneable sending half held by each tube. Sends never block; events
/// offered after the receiver is gone are dropped silently.
#[derive(Clone, Debug)]
pub struct Journal {
    tx: mpsc::UnboundedSender<JournalEvent>,
}

impl Journal {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<JournalEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub(crate) fn record(&self, tube: &str, id: u64, op: JournalOp) {
        let _ = self.tx.send(JournalEvent {
            tube: tube.to_owned(),
            id,
            op,
        });
    }
}

/// Drains journal events into an append-only line-per-event file under
/// `dir`. Runs until the sending side is dropped.
pub async fn write_to_dir(
    dir: PathBuf,
    mut rx: mpsc::UnboundedReceiver<JournalEvent>,
) -> Result<()> {
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let path = dir.join("journal.log");
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .with_context(|| format!("opening journal at {}", path.display()))?;

    info!(path = %path.display(), "journalling transitions");

    while let Some(event) = rx.recv().await {
        file.write_all(format!("{event}\n").as_bytes())
            .await
            .context("appending to journal")?;
    }

    file.flush().await.context("flushing journal")?;
    debug!("journal channel closed");

    Ok(())
}
