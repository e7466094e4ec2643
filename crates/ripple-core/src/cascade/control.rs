//! Control requests sent from the service into an execution's driver task.

use tokio::sync::{mpsc, oneshot};

use crate::error::{CascadeError, CascadeResult};

/// Requested transition on a running or paused execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    Abort,
    SkipStep { repo_id: String },
    SetPublishedVersion { repo_id: String, version: String },
}

impl ControlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ControlCommand::Pause => "pause",
            ControlCommand::Resume => "resume",
            ControlCommand::Abort => "abort",
            ControlCommand::SkipStep { .. } => "skip_step",
            ControlCommand::SetPublishedVersion { .. } => "set_published_version",
        }
    }
}

/// A command plus the channel its outcome is reported on.
#[derive(Debug)]
pub struct ControlMessage {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<CascadeResult<()>>,
}

impl ControlMessage {
    pub fn respond(self, outcome: CascadeResult<()>) {
        // The requester may have given up waiting.
        let _ = self.reply.send(outcome);
    }
}

pub type ControlSender = mpsc::Sender<ControlMessage>;
pub type ControlReceiver = mpsc::Receiver<ControlMessage>;

pub fn channel() -> (ControlSender, ControlReceiver) {
    mpsc::channel(32)
}

/// Send `command` and wait for the driver's answer.
///
/// `Ok(None)` means the driver is gone (the execution already finished).
pub async fn request(
    sender: &ControlSender,
    command: ControlCommand,
) -> CascadeResult<Option<()>> {
    let (reply, answer) = oneshot::channel();
    if sender.send(ControlMessage { command, reply }).await.is_err() {
        return Ok(None);
    }
    match answer.await {
        Ok(outcome) => outcome.map(Some),
        Err(_) => Err(CascadeError::Engine(
            "execution driver dropped a control request".to_string(),
        )),
    }
}
